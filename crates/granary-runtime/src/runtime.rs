// SPDX-License-Identifier: MIT OR Apache-2.0
//! The public runtime: a store handle, the builder registry, and runners.

use crate::builder::{Builder, BuilderRegistry, PackedValue};
use crate::error::GranaryError;
use crate::executor::Executor;
use crate::job::{Job, JobRef};
use crate::plan::Plan;
use crate::runner::{LocalRunner, Runner};
use granary_core::{ConfigValue, JobState, Key, canonical_key};
use granary_store::{Store, StoredJob};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long the planner backs off after losing an announcement race or
/// while waiting for a peer executor.
const CONFLICT_BACKOFF: Duration = Duration::from_secs(1);

/// Core entry point: manages the store and runs computations.
///
/// A runtime is opened on a store path, builders are registered in-process,
/// and `compute` guarantees each requested job is computed at most once —
/// across time and across concurrent runtimes pointed at the same store.
pub struct Runtime {
    store: Arc<Store>,
    registry: BuilderRegistry,
    runners: HashMap<String, Arc<dyn Runner>>,
}

impl Runtime {
    /// Open (or create) the store at `path` and recover from any previously
    /// crashed executor by dropping unfinished rows.
    pub fn open(path: impl AsRef<Path>) -> Result<Runtime, GranaryError> {
        let store = Arc::new(Store::open(path)?);
        store.drop_unfinished_jobs()?;
        let mut runners: HashMap<String, Arc<dyn Runner>> = HashMap::new();
        runners.insert("local".to_string(), Arc::new(LocalRunner::new(None)));
        Ok(Runtime {
            store,
            registry: BuilderRegistry::new(),
            runners,
        })
    }

    /// Replace the local runner with a pool of `workers` slots.
    pub fn set_local_workers(&mut self, workers: usize) {
        self.runners.insert(
            "local".to_string(),
            Arc::new(LocalRunner::new(Some(workers))),
        );
    }

    /// Register an additional runner under `name`.
    ///
    /// # Errors
    ///
    /// Fails when the name is already taken (including `local`).
    pub fn add_runner(
        &mut self,
        name: impl Into<String>,
        runner: impl Runner + 'static,
    ) -> Result<(), GranaryError> {
        let name = name.into();
        if self.runners.contains_key(&name) {
            return Err(GranaryError::RunnerExists { name });
        }
        self.runners.insert(name, Arc::new(runner));
        Ok(())
    }

    /// Register a builder, replacing any previous entry of the same name.
    pub fn register_builder(&mut self, builder: Builder) -> Arc<Builder> {
        debug!(target: "granary.runtime", builder = builder.name(), "registering builder");
        self.registry.register(builder)
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Sorted names of the registered builders.
    pub fn builder_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Compute one job (and its transitive prerequisites), returning the
    /// finished handle.
    pub async fn compute(&self, job: &JobRef) -> Result<Job, GranaryError> {
        let mut jobs = self.compute_many(std::slice::from_ref(job), false).await?;
        jobs.pop().ok_or_else(|| GranaryError::Internal {
            reason: "compute_many returned no result".to_string(),
        })
    }

    /// Compute a set of jobs.
    ///
    /// With `continue_on_error`, a failing job does not abort the call:
    /// independent branches run to completion, dependents of the failure are
    /// skipped, and the returned handles carry `Error` (or stay detached)
    /// where appropriate.
    pub async fn compute_many(
        &self,
        jobs: &[JobRef],
        continue_on_error: bool,
    ) -> Result<Vec<Job>, GranaryError> {
        let mut plan = Plan::new(jobs.to_vec(), continue_on_error);
        loop {
            plan.build(&self.store, &self.registry)?;
            if plan.is_finished() {
                break;
            }
            if plan.need_wait() {
                info!(
                    target: "granary.runtime",
                    "waiting for computation on another executor ..."
                );
                tokio::time::sleep(CONFLICT_BACKOFF).await;
                continue;
            }

            info!(target: "granary.runtime", "\n{}", plan.report(&self.store)?);
            let mut plan_jobs = plan.to_plan_jobs();
            if !self.store.announce_plan(&mut plan_jobs)? {
                debug!(target: "granary.runtime", "lost announcement race, retrying");
                tokio::time::sleep(CONFLICT_BACKOFF).await;
                continue;
            }
            plan.assign_ids(&plan_jobs);
            if !plan.conflicts.is_empty() {
                info!(
                    target: "granary.runtime",
                    "some jobs were temporarily skipped, they depend on jobs \
                     computed by another executor"
                );
            }

            let executor = Executor::new(self.store.clone(), &self.runners, &self.registry);
            match executor.run(&mut plan).await {
                Ok(()) => {
                    if plan.conflicts.is_empty() {
                        break;
                    }
                }
                Err(e) => {
                    self.store.unannounce_plan(&plan.node_ids())?;
                    return Err(e);
                }
            }
        }

        self.attach_results(jobs, &plan)
    }

    fn attach_results(&self, jobs: &[JobRef], plan: &Plan) -> Result<Vec<Job>, GranaryError> {
        // In default mode every planned node finished; under
        // continue-on-error the states have to be read back.
        let states = if plan.continue_on_error {
            self.store.get_states(&plan.node_ids())?
        } else {
            HashMap::new()
        };
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let key = job.key();
            if let Some(job_id) = plan.existing_jobs.get(key) {
                out.push(Job::attached(
                    job.clone(),
                    *job_id,
                    JobState::Finished,
                    self.store.clone(),
                ));
                continue;
            }
            match plan.nodes.get(key).and_then(|node| node.job_id) {
                Some(job_id) if !plan.continue_on_error => {
                    out.push(Job::attached(
                        job.clone(),
                        job_id,
                        JobState::Finished,
                        self.store.clone(),
                    ));
                }
                Some(job_id) => match states.get(&job_id) {
                    Some(state) => out.push(Job::attached(
                        job.clone(),
                        job_id,
                        *state,
                        self.store.clone(),
                    )),
                    None => out.push(Job::detached(job.clone())),
                },
                None => out.push(Job::detached(job.clone())),
            }
        }
        Ok(out)
    }

    /// Active state of a job's key.
    pub fn get_state(&self, job: &JobRef) -> Result<JobState, GranaryError> {
        Ok(self.store.get_active_state(job.key())?)
    }

    /// Read a finished job, or `None` when the key has no finished row.
    pub fn try_read(&self, job: &JobRef) -> Result<Option<Job>, GranaryError> {
        let (job_id, state) = self.store.get_active_job_id_and_state(job.key())?;
        match (job_id, state) {
            (Some(job_id), JobState::Finished) => Ok(Some(Job::attached(
                job.clone(),
                job_id,
                state,
                self.store.clone(),
            ))),
            _ => Ok(None),
        }
    }

    /// Read a finished job.
    ///
    /// # Errors
    ///
    /// Fails when no finished row exists for the key.
    pub fn read(&self, job: &JobRef) -> Result<Job, GranaryError> {
        self.try_read(job)?
            .ok_or_else(|| GranaryError::NoFinishedJob {
                job: job.to_string(),
            })
    }

    /// Read many jobs; missing ones come back as `None`.
    pub fn read_many(&self, jobs: &[JobRef]) -> Result<Vec<Option<Job>>, GranaryError> {
        jobs.iter().map(|job| self.try_read(job)).collect()
    }

    /// All stored rows for a job's key, including archived history.
    pub fn read_jobs(&self, job: &JobRef) -> Result<Vec<Job>, GranaryError> {
        let rows = self.store.read_jobs(job.key())?;
        Ok(rows
            .into_iter()
            .map(|row: StoredJob| {
                Job::attached(
                    JobRef::from_parts(row.builder, row.key, row.config),
                    row.id,
                    row.state,
                    self.store.clone(),
                )
            })
            .collect())
    }

    /// Insert an externally-computed value for a job.
    ///
    /// # Errors
    ///
    /// Fails when the key is already actively announced.
    pub fn insert<T: serde::Serialize>(
        &self,
        job: &JobRef,
        value: &T,
    ) -> Result<(), GranaryError> {
        let packed = PackedValue::pack(value)?;
        let created = self.store.create_job_with_value(
            job.builder_name(),
            job.key(),
            job.config(),
            Some((packed.bytes, packed.repr)),
        )?;
        if created {
            Ok(())
        } else {
            Err(GranaryError::AlreadyExists {
                job: job.to_string(),
            })
        }
    }

    /// Drop a job and its downstream closure; `drop_inputs` extends the
    /// closure upstream.
    pub fn drop_job(&self, job: &JobRef, drop_inputs: bool) -> Result<(), GranaryError> {
        self.drop_many(std::slice::from_ref(job), drop_inputs)
    }

    /// Drop many jobs and their closures.
    pub fn drop_many(&self, jobs: &[JobRef], drop_inputs: bool) -> Result<(), GranaryError> {
        let keys: Vec<Key> = jobs.iter().map(|job| job.key().clone()).collect();
        Ok(self.store.drop_keys(&keys, drop_inputs)?)
    }

    /// Archive a job and its downstream closure.
    pub fn archive(&self, job: &JobRef, archive_inputs: bool) -> Result<(), GranaryError> {
        self.archive_many(std::slice::from_ref(job), archive_inputs)
    }

    /// Archive many jobs and their closures.
    pub fn archive_many(
        &self,
        jobs: &[JobRef],
        archive_inputs: bool,
    ) -> Result<(), GranaryError> {
        let keys: Vec<Key> = jobs.iter().map(|job| job.key().clone()).collect();
        Ok(self.store.archive_keys(&keys, archive_inputs)?)
    }

    /// Discard a finished job's primary value, keeping its metadata.
    pub fn free(&self, job: &JobRef) -> Result<(), GranaryError> {
        self.free_many(std::slice::from_ref(job))
    }

    /// Free many jobs.
    pub fn free_many(&self, jobs: &[JobRef]) -> Result<(), GranaryError> {
        let keys: Vec<Key> = jobs.iter().map(|job| job.key().clone()).collect();
        Ok(self.store.free_keys(&keys)?)
    }

    /// Drop every row of a builder (plus downstream closures).
    pub fn drop_builder(&self, name: &str, drop_inputs: bool) -> Result<(), GranaryError> {
        Ok(self.store.drop_builder(name, drop_inputs)?)
    }

    /// Rewrite the configs of a builder's finished jobs in place.
    ///
    /// Collisions between upgraded keys are detected before any mutation.
    pub fn upgrade_builder(
        &self,
        builder_name: &str,
        upgrade: impl Fn(ConfigValue) -> ConfigValue,
    ) -> Result<(), GranaryError> {
        let configs = self.store.get_all_configs(builder_name)?;
        let mut seen = std::collections::HashSet::new();
        let mut updates = Vec::new();
        for (key, config) in configs {
            let config = upgrade(config);
            let new_key = canonical_key(builder_name, &config)?;
            if !seen.insert(new_key.clone()) {
                return Err(GranaryError::UpgradeCollision {
                    config: serde_json::to_string(&config)
                        .unwrap_or_else(|_| "?".to_string()),
                });
            }
            if new_key != key {
                updates.push(granary_store::KeyUpdate {
                    key,
                    new_key,
                    config,
                });
            }
        }
        Ok(self.store.upgrade_builder(&updates)?)
    }
}
