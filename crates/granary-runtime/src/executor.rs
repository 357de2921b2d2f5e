// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dispatch loop.
//!
//! A single cooperative task submits ready nodes to their runners and reaps
//! completions; parallelism lives inside the runners. Exclusive nodes run
//! alone: the loop drains in-flight work first, dispatches one exclusive,
//! and only returns to normal dispatch once it completes.

use crate::builder::BuilderRegistry;
use crate::error::GranaryError;
use crate::plan::Plan;
use crate::runner::{JobOutcome, Runner, WorkerJob};
use granary_core::{JobId, Key};
use granary_store::Store;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub(crate) struct Executor<'a> {
    store: Arc<Store>,
    runners: &'a HashMap<String, Arc<dyn Runner>>,
    registry: &'a BuilderRegistry,
}

impl<'a> Executor<'a> {
    pub fn new(
        store: Arc<Store>,
        runners: &'a HashMap<String, Arc<dyn Runner>>,
        registry: &'a BuilderRegistry,
    ) -> Executor<'a> {
        Executor {
            store,
            runners,
            registry,
        }
    }

    fn submit(
        &self,
        plan: &Plan,
        key: &Key,
        in_flight: &mut JoinSet<JobOutcome>,
    ) -> Result<(), GranaryError> {
        let node = &plan.nodes[key];
        let runner = self
            .runners
            .get(&node.job_setup.runner)
            .cloned()
            .ok_or_else(|| GranaryError::UnknownRunner {
                name: node.job_setup.runner.clone(),
            })?;
        let job_id = node.job_id.ok_or_else(|| GranaryError::Internal {
            reason: format!("node {key} was never announced"),
        })?;
        let work = WorkerJob {
            store_path: self.store.path().to_path_buf(),
            builder: self.registry.get(&node.builder)?,
            job_id,
            key: key.clone(),
        };
        debug!(target: "granary.executor", %job_id, builder = %node.builder, "submitting");
        in_flight.spawn(async move { runner.submit(work).await });
        Ok(())
    }

    /// Drive all announced nodes of the plan to completion.
    ///
    /// Under continue-on-error, failed keys land in `plan.error_keys`, their
    /// dependents are never dispatched, and the leftover announced rows are
    /// removed before returning. Otherwise the first failure aborts the run.
    pub async fn run(&self, plan: &mut Plan) -> Result<(), GranaryError> {
        let total = plan.order.len();
        info!(target: "granary.executor", jobs = total, "executing plan");

        let mut consumers: HashMap<Key, Vec<Key>> = HashMap::new();
        let mut waiting_deps: HashMap<Key, usize> = HashMap::new();
        let mut ready: VecDeque<Key> = VecDeque::new();
        let mut ready_exclusive: VecDeque<Key> = VecDeque::new();
        for key in &plan.order {
            let node = &plan.nodes[key];
            waiting_deps.insert(key.clone(), node.dep_keys.len());
            for dep in &node.dep_keys {
                consumers.entry(dep.clone()).or_default().push(key.clone());
            }
            if node.dep_keys.is_empty() {
                if node.job_setup.exclusive {
                    ready_exclusive.push_back(key.clone());
                } else {
                    ready.push_back(key.clone());
                }
            }
        }

        let mut in_flight: JoinSet<JobOutcome> = JoinSet::new();
        let mut dispatched: HashSet<Key> = HashSet::new();
        let mut exclusive_mode = false;
        let mut completed = 0usize;

        loop {
            if exclusive_mode {
                if in_flight.is_empty() {
                    match ready_exclusive.pop_front() {
                        Some(key) => {
                            dispatched.insert(key.clone());
                            self.submit(plan, &key, &mut in_flight)?;
                        }
                        None => {
                            exclusive_mode = false;
                            continue;
                        }
                    }
                }
            } else {
                while let Some(key) = ready.pop_front() {
                    dispatched.insert(key.clone());
                    self.submit(plan, &key, &mut in_flight)?;
                }
                if in_flight.is_empty() {
                    if let Some(key) = ready_exclusive.pop_front() {
                        exclusive_mode = true;
                        dispatched.insert(key.clone());
                        self.submit(plan, &key, &mut in_flight)?;
                    }
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let outcome = joined.map_err(|e| GranaryError::Internal {
                reason: format!("worker task join failed: {e}"),
            })?;

            match outcome {
                JobOutcome::Finished { job_id, key } => {
                    completed += 1;
                    debug!(
                        target: "granary.executor",
                        %job_id, completed, total, "job finished"
                    );
                    for consumer in consumers.get(&key).map(Vec::as_slice).unwrap_or(&[]) {
                        let count = waiting_deps
                            .get_mut(consumer)
                            .expect("consumer tracked in waiting_deps");
                        *count -= 1;
                        if *count == 0 {
                            if plan.nodes[consumer].job_setup.exclusive {
                                ready_exclusive.push_back(consumer.clone());
                            } else {
                                ready.push_back(consumer.clone());
                            }
                        }
                    }
                }
                JobOutcome::Failed {
                    job_id,
                    key,
                    failure,
                } => {
                    let node = &plan.nodes[&key];
                    warn!(
                        target: "granary.executor",
                        %job_id, builder = %node.builder, message = %failure.message(),
                        "job failed"
                    );
                    if plan.continue_on_error {
                        plan.error_keys.insert(key);
                    } else {
                        in_flight.abort_all();
                        return Err(GranaryError::JobFailed {
                            message: format!("{} ({}/{})", failure.message(), node.builder, key),
                        });
                    }
                }
            }
        }

        // Nodes blocked behind failed dependencies were announced but never
        // dispatched; release their keys.
        let skipped: Vec<JobId> = plan
            .order
            .iter()
            .filter(|key| !dispatched.contains(*key))
            .filter_map(|key| plan.nodes[key].job_id)
            .collect();
        if !skipped.is_empty() {
            debug!(target: "granary.executor", skipped = skipped.len(), "unannouncing skipped jobs");
            self.store.unannounce_plan(&skipped)?;
        }
        Ok(())
    }
}
