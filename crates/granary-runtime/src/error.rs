// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy of the runtime.

use granary_core::{ConfigError, JobState};
use granary_store::StoreError;

/// Everything that can go wrong while planning, executing, or reading jobs.
#[derive(Debug, thiserror::Error)]
pub enum GranaryError {
    /// Config canonicalization failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store rejected or failed an operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A builder's dependency phase re-entered a key it is already visiting.
    #[error("cyclic dependency detected while planning {job}")]
    CyclicDependency {
        /// Description of the offending job.
        job: String,
    },

    /// A frozen builder has no stored value for the requested key.
    #[error("computation depends on a missing value {job} of a frozen builder")]
    MissingValue {
        /// Description of the offending job.
        job: String,
    },

    /// A dependency sits in the `Freed` state.
    #[error(
        "computation depends on a job in freed state ({job}); \
         drop or archive the job to run the computation"
    )]
    StaleFreed {
        /// Description of the offending job.
        job: String,
    },

    /// A job failed (or timed out) and the plan was not continue-on-error.
    #[error("job failed: {message}")]
    JobFailed {
        /// Failure description, including the job.
        message: String,
    },

    /// The dependency phase emitted a different set of jobs when re-run
    /// inside the worker.
    #[error("dependencies inconsistent for {job}")]
    InconsistentDeps {
        /// Description of the offending job.
        job: String,
    },

    /// No builder registered under this name.
    #[error("unknown builder '{name}'")]
    UnknownBuilder {
        /// The requested builder name.
        name: String,
    },

    /// No runner registered under this name.
    #[error("job asked for unknown runner '{name}'")]
    UnknownRunner {
        /// The requested runner name.
        name: String,
    },

    /// A runner name is already taken.
    #[error("runner '{name}' is already registered")]
    RunnerExists {
        /// The contested runner name.
        name: String,
    },

    /// Two upgraded configs map to the same key.
    #[error("key collision in upgrade, config={config}")]
    UpgradeCollision {
        /// The colliding config, rendered as JSON.
        config: String,
    },

    /// `insert` hit a key that is already actively announced.
    #[error("job {job} already exists")]
    AlreadyExists {
        /// Description of the contested job.
        job: String,
    },

    /// A handle operation needs an attached job.
    #[error("job {job} is not attached")]
    NotAttached {
        /// Description of the detached job.
        job: String,
    },

    /// A value read needs a `Finished` job.
    #[error("job {job} is not finished (state: {state})")]
    NotFinished {
        /// Description of the job.
        job: String,
        /// The state it was found in.
        state: JobState,
    },

    /// No finished row exists for the key.
    #[error("no finished job for {job}")]
    NoFinishedJob {
        /// Description of the requested job.
        job: String,
    },

    /// A named blob does not exist.
    #[error("blob '{name}' not found")]
    MissingBlob {
        /// The requested blob name.
        name: String,
    },

    /// A blob exists but carries an unexpected mime tag.
    #[error("blob '{name}' is not {expected}, but {actual}")]
    WrongMime {
        /// The requested blob name.
        name: String,
        /// Mime tag the caller expected.
        expected: &'static str,
        /// Mime tag found in the store.
        actual: String,
    },

    /// `input` was called with a job the dependency phase never emitted.
    #[error("job {job} is not a declared dependency of this computation")]
    UndeclaredDependency {
        /// Description of the undeclared job.
        job: String,
    },

    /// An attachment name is empty or starts with `!`.
    #[error("invalid blob name: {reason}")]
    InvalidBlobName {
        /// What is wrong with the name.
        reason: String,
    },

    /// A value failed to serialize into its binary form.
    #[error("value encoding error: {0}")]
    ValueEncode(#[from] rmp_serde::encode::Error),

    /// A stored value failed to deserialize.
    #[error("value decoding error: {0}")]
    ValueDecode(#[from] rmp_serde::decode::Error),

    /// Filesystem error (attachments, working directories).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A builder reported a domain error of its own.
    #[error("{message}")]
    Builder {
        /// The builder's own description of the failure.
        message: String,
    },

    /// Internal invariant violation.
    #[error("internal error: {reason}")]
    Internal {
        /// Human-readable detail.
        reason: String,
    },
}

impl GranaryError {
    /// Wrap a builder-domain failure message.
    pub fn builder(message: impl Into<String>) -> Self {
        GranaryError::Builder {
            message: message.into(),
        }
    }
}
