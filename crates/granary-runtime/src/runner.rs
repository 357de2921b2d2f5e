// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runner abstraction and the local pool runner.
//!
//! A runner is a named back-end that actually executes builder functions.
//! The executor submits one [`WorkerJob`] at a time and awaits its
//! [`JobOutcome`]; all result persistence happens inside the worker, so a
//! runner's only contract is "run this job to completion somewhere".

use crate::builder::Builder;
use crate::worker;
use async_trait::async_trait;
use granary_core::{JobId, Key};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Everything a worker needs to execute one announced job.
#[derive(Clone)]
pub struct WorkerJob {
    /// Path of the store; the worker opens its own handle.
    pub store_path: PathBuf,
    /// The builder to run.
    pub builder: Arc<Builder>,
    /// The announced row to claim.
    pub job_id: JobId,
    /// The job's content-hash key.
    pub key: Key,
}

/// Why a job did not finish.
#[derive(Debug, Clone)]
pub enum JobFailure {
    /// The builder returned an error (or panicked).
    Error {
        /// Failure description.
        message: String,
    },
    /// The builder exceeded its configured time limit.
    Timeout {
        /// The limit that was exceeded.
        timeout: Duration,
    },
}

impl JobFailure {
    /// Human-readable failure description.
    pub fn message(&self) -> String {
        match self {
            JobFailure::Error { message } => message.clone(),
            JobFailure::Timeout { timeout } => {
                format!("job timeouted after {} seconds", timeout.as_secs_f64())
            }
        }
    }
}

/// Terminal result of one worker run.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The job committed `set_finished`.
    Finished {
        /// The finished row.
        job_id: JobId,
        /// The job's key.
        key: Key,
    },
    /// The job committed `set_error` (or could not be claimed).
    Failed {
        /// The failed row.
        job_id: JobId,
        /// The job's key.
        key: Key,
        /// What went wrong.
        failure: JobFailure,
    },
}

/// A named execution back-end.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Human-readable description of the runner's capacity.
    fn resources(&self) -> String;

    /// Execute one job to completion and report its outcome.
    ///
    /// The worker protocol (claim, dependency re-check, compute, commit) is
    /// shared; implementations only choose *where* it runs.
    async fn submit(&self, job: WorkerJob) -> JobOutcome;
}

/// The default runner: a bounded pool of blocking workers on this host.
pub struct LocalRunner {
    workers: usize,
    slots: Arc<Semaphore>,
}

impl LocalRunner {
    /// A pool with `workers` slots; defaults to the host CPU count.
    pub fn new(workers: Option<usize>) -> LocalRunner {
        let workers = workers.unwrap_or_else(num_cpus::get).max(1);
        LocalRunner {
            workers,
            slots: Arc::new(Semaphore::new(workers)),
        }
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn resources(&self) -> String {
        format!("{} cpus", self.workers)
    }

    async fn submit(&self, job: WorkerJob) -> JobOutcome {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return JobOutcome::Failed {
                    job_id: job.job_id,
                    key: job.key.clone(),
                    failure: JobFailure::Error {
                        message: "local runner stopped".to_string(),
                    },
                };
            }
        };
        let job_id = job.job_id;
        let key = job.key.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            worker::run_worker(job)
        });
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::Failed {
                job_id,
                key,
                failure: JobFailure::Error {
                    message: format!("worker task failed: {e}"),
                },
            },
        }
    }
}
