// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job lifecycle types shared between the store, planner, and executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Mime tag of primary values and attached objects (MessagePack bytes).
pub const MIME_VALUE: &str = "application/msgpack";
/// Mime tag of attached text, captured output, and error messages.
pub const MIME_TEXT: &str = "text/plain";
/// Mime tag of raw attached bytes.
pub const MIME_BYTES: &str = "application/octet-stream";
/// Mime tag of attached directories (tar archives).
pub const MIME_TAR: &str = "application/tar";
/// Mime tag of PNG images, inlined by the browser view.
pub const MIME_PNG: &str = "image/png";

/// Store-assigned identifier of one job row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Detached` is the synthetic state of a key with no active row; it is never
/// stored. `Freed` keeps the row and metadata but the primary value is gone;
/// archived states are tombstones excluded from all active lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No active row exists for the key.
    Detached,
    /// The key is claimed; computation has not started.
    Announced,
    /// The computation is running in some worker.
    Running,
    /// The computation completed; the value (if any) is stored.
    Finished,
    /// The computation failed; the key is free for re-announcement.
    Error,
    /// Finished, but the primary value has been discarded.
    Freed,
    /// Archived from `Finished`.
    ArchivedFinished,
    /// Archived from `Freed`.
    ArchivedFreed,
}

/// States that participate in active-key lookups.
pub const ACTIVE_STATES: [JobState; 4] = [
    JobState::Announced,
    JobState::Running,
    JobState::Finished,
    JobState::Freed,
];

impl JobState {
    /// One-character storage code.
    pub fn code(self) -> &'static str {
        match self {
            JobState::Detached => "",
            JobState::Announced => "a",
            JobState::Running => "r",
            JobState::Finished => "f",
            JobState::Error => "e",
            JobState::Freed => "d",
            JobState::ArchivedFinished => "F",
            JobState::ArchivedFreed => "D",
        }
    }

    /// Decode a storage code.
    pub fn from_code(code: &str) -> Option<JobState> {
        Some(match code {
            "" => JobState::Detached,
            "a" => JobState::Announced,
            "r" => JobState::Running,
            "f" => JobState::Finished,
            "e" => JobState::Error,
            "d" => JobState::Freed,
            "F" => JobState::ArchivedFinished,
            "D" => JobState::ArchivedFreed,
            _ => return None,
        })
    }

    /// `true` for states that participate in active-key lookups.
    pub fn is_active(self) -> bool {
        ACTIVE_STATES.contains(&self)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Detached => "detached",
            JobState::Announced => "announced",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Error => "error",
            JobState::Freed => "freed",
            JobState::ArchivedFinished => "archived_finished",
            JobState::ArchivedFreed => "archived_freed",
        };
        f.write_str(s)
    }
}

/// Per-job execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSetup {
    /// Name of the runner that executes the job.
    pub runner: String,
    /// Time limit for the computation; a miss records a timeout failure.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Run alone: nothing else is dispatched while this job is in flight.
    #[serde(default)]
    pub exclusive: bool,
    /// Relay captured output to the executor's console instead of attaching
    /// it as the `!output` blob.
    #[serde(default)]
    pub relay: bool,
}

impl Default for JobSetup {
    fn default() -> Self {
        JobSetup {
            runner: "local".to_string(),
            timeout: None,
            exclusive: false,
            relay: false,
        }
    }
}

impl JobSetup {
    /// Setup targeting a named runner, everything else default.
    pub fn with_runner(runner: impl Into<String>) -> Self {
        JobSetup {
            runner: runner.into(),
            ..JobSetup::default()
        }
    }

    /// Builder-style timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder-style exclusivity flag.
    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Builder-style relay flag.
    #[must_use]
    pub fn relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }
}

impl From<&str> for JobSetup {
    fn from(runner: &str) -> JobSetup {
        JobSetup::with_runner(runner)
    }
}

/// Dates, timing, and setup of one job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// When the row was announced or inserted.
    pub created_date: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub finished_date: Option<DateTime<Utc>>,
    /// Wall-clock computation time.
    pub computation_time: Option<Duration>,
    /// The setup the job ran under, if it was computed.
    pub job_setup: Option<JobSetup>,
}

/// Short human-readable rendering of a serialized value, truncated to fit the
/// store's `repr` column (85 chars).
pub fn short_repr(rendered: &str) -> String {
    if rendered.chars().count() > 85 {
        let head: String = rendered.chars().take(80).collect();
        format!("{head} ...")
    } else {
        rendered.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for state in [
            JobState::Detached,
            JobState::Announced,
            JobState::Running,
            JobState::Finished,
            JobState::Error,
            JobState::Freed,
            JobState::ArchivedFinished,
            JobState::ArchivedFreed,
        ] {
            assert_eq!(JobState::from_code(state.code()), Some(state));
        }
        assert_eq!(JobState::from_code("x"), None);
    }

    #[test]
    fn active_states() {
        assert!(JobState::Finished.is_active());
        assert!(JobState::Announced.is_active());
        assert!(!JobState::Error.is_active());
        assert!(!JobState::ArchivedFinished.is_active());
        assert!(!JobState::Detached.is_active());
    }

    #[test]
    fn job_setup_round_trip() {
        let setup = JobSetup::with_runner("cluster")
            .timeout(Duration::from_secs(30))
            .exclusive(true);
        let text = serde_json::to_string(&setup).unwrap();
        let back: JobSetup = serde_json::from_str(&text).unwrap();
        assert_eq!(setup, back);
    }

    #[test]
    fn short_repr_truncates() {
        let long = "x".repeat(120);
        let repr = short_repr(&long);
        assert_eq!(repr.chars().count(), 84);
        assert!(repr.ends_with(" ..."));
        assert_eq!(short_repr("short"), "short");
    }
}
