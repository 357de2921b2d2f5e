// SPDX-License-Identifier: MIT OR Apache-2.0
//! Row and summary types returned by store queries.

use chrono::{DateTime, Utc};
use granary_core::{ConfigValue, JobId, JobSetup, JobState, Key};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// One not-yet-announced job of a plan, as the store sees it.
///
/// `announce_plan` assigns `job_id` on success and clears it again when the
/// whole announcement loses the uniqueness race.
#[derive(Debug, Clone)]
pub struct PlanJob {
    /// Builder name.
    pub builder: String,
    /// Content-hash key of the job.
    pub key: Key,
    /// Full config of the job.
    pub config: ConfigValue,
    /// Execution policy.
    pub job_setup: JobSetup,
    /// Plan-internal predecessors, by key (announced in the same call).
    pub dep_keys: Vec<Key>,
    /// Preexisting finished predecessors, by id.
    pub dep_ids: Vec<JobId>,
    /// Store-assigned id, filled in by `announce_plan`.
    pub job_id: Option<JobId>,
}

/// What a worker receives when it claims a job (Announced → Running).
#[derive(Debug)]
pub struct RunningJob {
    /// Execution policy recorded at announcement time.
    pub job_setup: JobSetup,
    /// Full config of the job.
    pub config: ConfigValue,
    /// Key → id of the job's immediate predecessors.
    pub dep_ids: HashMap<Key, JobId>,
}

/// One stored job row for a key, including archived history.
#[derive(Debug, Clone)]
pub struct StoredJob {
    /// Store-assigned id.
    pub id: JobId,
    /// Builder name.
    pub builder: String,
    /// Content-hash key.
    pub key: Key,
    /// Lifecycle state.
    pub state: JobState,
    /// Full config.
    pub config: ConfigValue,
}

/// A key rename for `upgrade_builder`.
#[derive(Debug, Clone)]
pub struct KeyUpdate {
    /// Current key.
    pub key: Key,
    /// Key after the upgrade.
    pub new_key: Key,
    /// Upgraded config, stored alongside the new key.
    pub config: ConfigValue,
}

/// Aggregate computation-time statistics for one builder (milliseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    /// Number of rows with a recorded computation time.
    pub count: i64,
    /// Mean computation time in milliseconds.
    pub avg: Option<f64>,
    /// Sample standard deviation in milliseconds (0 for tiny samples).
    pub stdev: Option<f64>,
}

/// Per-builder counters for the browser view.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BuilderSummary {
    /// Builder name.
    pub name: String,
    /// Jobs in `Finished`.
    pub n_finished: i64,
    /// Jobs in `Error`.
    pub n_failed: i64,
    /// Jobs in `Announced` or `Running`.
    pub n_in_progress: i64,
    /// Jobs in `ArchivedFinished`.
    pub n_archived: i64,
    /// Jobs in `Freed` or `ArchivedFreed`.
    pub n_freed: i64,
    /// Total byte footprint (configs + blobs).
    pub size: i64,
}

/// One job row in a builder listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    /// Store-assigned id.
    pub id: JobId,
    /// Content-hash key.
    pub key: Key,
    /// Lifecycle state (lowercase name).
    pub state: String,
    /// Full config.
    pub config: ConfigValue,
    /// Byte footprint of config + blobs.
    pub size: i64,
    /// Computation time in milliseconds.
    pub comp_time: Option<i64>,
    /// Announcement / insertion date.
    pub created: DateTime<Utc>,
    /// Terminal date, if reached.
    pub finished: Option<DateTime<Utc>>,
}

/// One blob row in a job listing, with an inline preview where cheap.
#[derive(Debug, Clone, Serialize)]
pub struct BlobSummary {
    /// Blob name; `None` is the primary value.
    pub name: Option<String>,
    /// Short human-readable repr, if recorded.
    pub repr: Option<String>,
    /// Mime tag.
    pub mime: String,
    /// Payload size in bytes.
    pub size: i64,
    /// Inline preview: text verbatim, PNG base64, everything else omitted.
    pub value: Option<String>,
}

/// State counters over the currently-running window.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StatusCounts {
    /// Jobs currently running.
    pub n_running: i64,
    /// Jobs finished within the window.
    pub n_finished: i64,
    /// Jobs announced but not yet started.
    pub n_announced: i64,
    /// Jobs failed within the window.
    pub n_failed: i64,
}

/// One recent error row.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    /// Store-assigned id.
    pub id: JobId,
    /// Builder name.
    pub builder: String,
    /// Full config.
    pub config: ConfigValue,
    /// When the job errored.
    pub finished: Option<DateTime<Utc>>,
}

/// Aggregated counts plus the most recent errors.
#[derive(Debug, Clone, Serialize)]
pub struct RunningStatus {
    /// Counters over the current window.
    pub counts: StatusCounts,
    /// The five most recent errors.
    pub errors: Vec<ErrorSummary>,
}

pub(crate) fn duration_to_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn ms_to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}
