// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker protocol: claim the announced row, verify the dependency set,
//! run the full phase, and commit the result.
//!
//! Workers open their own store handle so they stay independent of the
//! dispatching executor; the `Announced → Running` transition is the
//! single-winner claim.

use crate::builder::PackedValue;
use crate::context::{JobContext, OutputCapture};
use crate::error::GranaryError;
use crate::job::Job;
use crate::runner::{JobFailure, JobOutcome, WorkerJob};
use granary_core::{JobId, JobState, Key};
use granary_store::Store;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum ComputeEnd {
    Done(Result<Option<PackedValue>, GranaryError>),
    Timeout(Duration),
}

/// Run one announced job to completion; never panics, always reports.
pub(crate) fn run_worker(work: WorkerJob) -> JobOutcome {
    let WorkerJob {
        store_path,
        builder,
        job_id,
        key,
    } = work;

    let failed = |key: &Key, message: String| JobOutcome::Failed {
        job_id,
        key: key.clone(),
        failure: JobFailure::Error { message },
    };

    let store = match Store::open(&store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => return failed(&key, format!("worker could not open store: {e}")),
    };

    let running = match store.set_running(job_id) {
        Ok(running) => running,
        Err(e) => return failed(&key, format!("could not claim job: {e}")),
    };
    debug!(target: "granary.worker", %job_id, builder = builder.name(), "claimed job");

    // Re-run the dependency phase; the emitted set must match the edges the
    // planner recorded, otherwise the builder is not deterministic.
    let deps = match builder.collect_deps(&running.config) {
        Ok(deps) => deps,
        Err(e) => {
            let message = format!("job failed: {e}");
            record_error(&store, job_id, &message, None, None);
            return failed(&key, message);
        }
    };
    let emitted: HashSet<&Key> = deps.iter().map(|d| d.key()).collect();
    let stored: HashSet<&Key> = running.dep_ids.keys().collect();
    if emitted != stored {
        let message = "dependencies inconsistent".to_string();
        record_error(&store, job_id, &message, None, None);
        return failed(&key, message);
    }

    let inputs: Vec<Job> = deps
        .iter()
        .map(|dep| {
            Job::attached(
                dep.clone(),
                running.dep_ids[dep.key()],
                JobState::Finished,
                store.clone(),
            )
        })
        .collect();

    let workdir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(e) => {
            let message = format!("could not create working directory: {e}");
            record_error(&store, job_id, &message, None, None);
            return failed(&key, message);
        }
    };

    let output = OutputCapture::default();
    let relay = running.job_setup.relay;
    let timeout = running.job_setup.timeout;
    let mut ctx = JobContext::new(
        running.config,
        job_id,
        store.clone(),
        inputs,
        workdir.path().to_path_buf(),
        output.clone(),
        relay,
    );

    let compute = match builder.compute_fn() {
        Some(compute) => compute,
        None => {
            let message = format!("builder '{}' has no computation", builder.name());
            record_error(&store, job_id, &message, None, None);
            return failed(&key, message);
        }
    };

    let started = Instant::now();
    let end = match timeout {
        Some(timeout) => {
            // The deadline must not depend on the builder cooperating, so
            // the computation runs on a detached thread that is simply
            // abandoned on a miss.
            let (tx, rx) = mpsc::channel();
            let thread = std::thread::Builder::new()
                .name(format!("granary-job-{job_id}"))
                .spawn(move || {
                    let _ = tx.send((*compute)(&mut ctx));
                });
            match thread {
                Ok(_) => match rx.recv_timeout(timeout) {
                    Ok(result) => ComputeEnd::Done(result),
                    Err(RecvTimeoutError::Timeout) => ComputeEnd::Timeout(timeout),
                    Err(RecvTimeoutError::Disconnected) => ComputeEnd::Done(Err(
                        GranaryError::builder("builder panicked"),
                    )),
                },
                Err(e) => ComputeEnd::Done(Err(GranaryError::Internal {
                    reason: format!("could not spawn job thread: {e}"),
                })),
            }
        }
        None => {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| (*compute)(&mut ctx)));
            ComputeEnd::Done(result.unwrap_or_else(|panic| {
                Err(GranaryError::builder(format!(
                    "builder panicked: {}",
                    describe_panic(&*panic)
                )))
            }))
        }
    };
    let elapsed = started.elapsed();

    let captured = if relay { None } else { output.snapshot() };
    match end {
        ComputeEnd::Done(Ok(value)) => {
            match store.set_finished(
                job_id,
                value.map(|packed| (packed.bytes, packed.repr)),
                elapsed,
                captured.as_deref(),
            ) {
                Ok(()) => {
                    debug!(target: "granary.worker", %job_id, "finished");
                    JobOutcome::Finished { job_id, key }
                }
                Err(e) => failed(&key, format!("could not commit result: {e}")),
            }
        }
        ComputeEnd::Done(Err(e)) => {
            let message = format!("job failed: {e}");
            record_error(&store, job_id, &message, Some(elapsed), captured.as_deref());
            failed(&key, message)
        }
        ComputeEnd::Timeout(timeout) => {
            let message = format!("job timeouted after {} seconds", timeout.as_secs_f64());
            record_error(&store, job_id, &message, None, captured.as_deref());
            JobOutcome::Failed {
                job_id,
                key,
                failure: JobFailure::Timeout { timeout },
            }
        }
    }
}

fn record_error(
    store: &Store,
    job_id: JobId,
    message: &str,
    computation_time: Option<Duration>,
    output: Option<&str>,
) {
    if let Err(e) = store.set_error(job_id, message, computation_time, output) {
        warn!(target: "granary.worker", %job_id, error = %e, "could not record job error");
    }
}

fn describe_panic(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
