// SPDX-License-Identifier: MIT OR Apache-2.0
//! Store error types.

use granary_core::JobId;

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying SQLite engine reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored config or job setup failed to (de)serialize.
    #[error("stored record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// An in-memory database was requested; results must survive restarts.
    #[error("in-memory store is not supported, results must survive process restart")]
    InMemoryUnsupported,

    /// A blob with the same `(job_id, name)` already exists.
    #[error("blob '{name}' already exists")]
    DuplicateBlob {
        /// The contested blob name (`<primary>` for the primary value).
        name: String,
    },

    /// A state transition found the row in an unexpected state.
    #[error("job {job_id} could not move to {target}: row missing or in wrong state")]
    BadTransition {
        /// The job that failed to transition.
        job_id: JobId,
        /// The state the caller tried to reach.
        target: &'static str,
    },

    /// The store contents violate an internal invariant.
    #[error("store integrity violation: {reason}")]
    Integrity {
        /// Human-readable detail.
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        StoreError::Integrity {
            reason: reason.into(),
        }
    }

    /// `true` when the error is a SQLite uniqueness/constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
