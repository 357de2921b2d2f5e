// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plan construction.
//!
//! A plan is the DAG of not-yet-computed jobs derived for one `compute`
//! call: new nodes keyed by content hash, the ids of already-finished
//! predecessors, and the keys found announced or running elsewhere. The
//! traversal runs each builder's dependency phase exactly once per
//! encountered job.

use crate::builder::BuilderRegistry;
use crate::error::GranaryError;
use crate::job::JobRef;
use granary_core::{ConfigValue, JobId, JobSetup, JobState, Key};
use granary_store::{PlanJob, Store};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

/// In-memory record for one entry of a plan.
#[derive(Debug, Clone)]
pub(crate) struct PlanNode {
    pub builder: String,
    pub key: Key,
    pub config: ConfigValue,
    pub job_setup: JobSetup,
    /// Plan-internal predecessors, deduplicated.
    pub dep_keys: Vec<Key>,
    /// Preexisting finished predecessors, deduplicated.
    pub existing_dep_ids: Vec<JobId>,
    pub job_id: Option<JobId>,
}

/// The DAG of new work derived for one `compute` call.
pub(crate) struct Plan {
    pub leaves: Vec<JobRef>,
    pub continue_on_error: bool,
    pub nodes: HashMap<Key, PlanNode>,
    /// Traversal order of `nodes`, for deterministic announcement.
    pub order: Vec<Key>,
    /// Keys resolved to already-finished rows, cached across rebuilds.
    pub existing_jobs: HashMap<Key, JobId>,
    /// Keys found announced/running by someone else in the last build.
    pub conflicts: HashSet<Key>,
    /// Keys that failed under continue-on-error; never re-planned.
    pub error_keys: HashSet<Key>,
}

enum Visit {
    Existing(JobId),
    Node,
    Blocked,
}

struct Traversal<'a> {
    store: &'a Store,
    registry: &'a BuilderRegistry,
    plan: &'a mut Plan,
    visiting: HashSet<Key>,
}

impl Plan {
    pub fn new(leaves: Vec<JobRef>, continue_on_error: bool) -> Plan {
        Plan {
            leaves,
            continue_on_error,
            nodes: HashMap::new(),
            order: Vec::new(),
            existing_jobs: HashMap::new(),
            conflicts: HashSet::new(),
            error_keys: HashSet::new(),
        }
    }

    /// Nothing left to compute and nobody to wait for.
    pub fn is_finished(&self) -> bool {
        self.nodes.is_empty() && self.conflicts.is_empty()
    }

    /// Nothing to compute here, but a peer holds keys we need.
    pub fn need_wait(&self) -> bool {
        self.nodes.is_empty() && !self.conflicts.is_empty()
    }

    /// (Re)build the plan against the current store state.
    ///
    /// `existing_jobs` and `error_keys` survive rebuilds; nodes and
    /// conflicts are derived fresh.
    pub fn build(&mut self, store: &Store, registry: &BuilderRegistry) -> Result<(), GranaryError> {
        self.nodes.clear();
        self.order.clear();
        self.conflicts.clear();
        let leaves = self.leaves.clone();
        let mut traversal = Traversal {
            store,
            registry,
            plan: self,
            visiting: HashSet::new(),
        };
        for leaf in &leaves {
            traversal.visit(leaf)?;
        }
        Ok(())
    }

    /// Store-facing view of the nodes, in traversal order.
    pub fn to_plan_jobs(&self) -> Vec<PlanJob> {
        self.order
            .iter()
            .map(|key| {
                let node = &self.nodes[key];
                PlanJob {
                    builder: node.builder.clone(),
                    key: node.key.clone(),
                    config: node.config.clone(),
                    job_setup: node.job_setup.clone(),
                    dep_keys: node.dep_keys.clone(),
                    dep_ids: node.existing_dep_ids.clone(),
                    job_id: None,
                }
            })
            .collect()
    }

    /// Copy the ids assigned by `announce_plan` back into the nodes.
    pub fn assign_ids(&mut self, announced: &[PlanJob]) {
        for job in announced {
            if let Some(node) = self.nodes.get_mut(&job.key) {
                node.job_id = job.job_id;
            }
        }
    }

    /// Ids of all announced nodes.
    pub fn node_ids(&self) -> Vec<JobId> {
        self.order
            .iter()
            .filter_map(|key| self.nodes[key].job_id)
            .collect()
    }

    /// Human-readable table of scheduled jobs with expected computation
    /// times from past runs.
    pub fn report(&self, store: &Store) -> Result<String, GranaryError> {
        let mut per_builder: BTreeMap<&str, usize> = BTreeMap::new();
        for key in &self.order {
            *per_builder.entry(self.nodes[key].builder.as_str()).or_default() += 1;
        }
        let mut out = String::new();
        out.push_str(
            "Scheduled jobs   |     # | Expected comp. time (per job)\n\
             -----------------+-------+--------------------------------\n",
        );
        for (builder, count) in per_builder {
            let stats = store.get_run_stats(builder)?;
            match stats.avg {
                Some(avg) => {
                    let _ = writeln!(
                        out,
                        "{:<17}| {:>5} | {:>8} +- {}",
                        builder,
                        count,
                        format_time(avg),
                        format_time(stats.stdev.unwrap_or(0.0)),
                    );
                }
                None => {
                    let _ = writeln!(out, "{builder:<17}| {count:>5} | N/A");
                }
            }
        }
        out.push_str("-----------------+-------+--------------------------------");
        Ok(out)
    }
}

impl Traversal<'_> {
    fn visit(&mut self, job: &JobRef) -> Result<Visit, GranaryError> {
        let key = job.key();
        if let Some(job_id) = self.plan.existing_jobs.get(key) {
            return Ok(Visit::Existing(*job_id));
        }
        if self.plan.conflicts.contains(key) || self.plan.error_keys.contains(key) {
            return Ok(Visit::Blocked);
        }
        if self.plan.nodes.contains_key(key) {
            return Ok(Visit::Node);
        }
        if self.visiting.contains(key) {
            return Err(GranaryError::CyclicDependency {
                job: job.to_string(),
            });
        }

        let builder = self.registry.get(job.builder_name())?;
        let (job_id, state) = self.store.get_active_job_id_and_state(key)?;
        match state {
            JobState::Finished => {
                let job_id = job_id.ok_or_else(|| GranaryError::Internal {
                    reason: format!("finished row without id for {job}"),
                })?;
                self.plan.existing_jobs.insert(key.clone(), job_id);
                return Ok(Visit::Existing(job_id));
            }
            JobState::Announced | JobState::Running => {
                self.plan.conflicts.insert(key.clone());
                return Ok(Visit::Blocked);
            }
            JobState::Freed => {
                return Err(GranaryError::StaleFreed {
                    job: job.to_string(),
                });
            }
            _ => {}
        }

        if builder.is_frozen() {
            return Err(GranaryError::MissingValue {
                job: job.to_string(),
            });
        }

        self.visiting.insert(key.clone());
        let deps = builder.collect_deps(job.config())?;
        let mut dep_keys = Vec::new();
        let mut existing_dep_ids = Vec::new();
        let mut seen_keys = HashSet::new();
        let mut seen_ids = HashSet::new();
        let mut blocked = false;
        for dep in &deps {
            match self.visit(dep)? {
                Visit::Existing(id) => {
                    if seen_ids.insert(id) {
                        existing_dep_ids.push(id);
                    }
                }
                Visit::Node => {
                    if seen_keys.insert(dep.key().clone()) {
                        dep_keys.push(dep.key().clone());
                    }
                }
                Visit::Blocked => {
                    // Keep walking so all sibling conflicts are recorded,
                    // but this node cannot be planned yet.
                    blocked = true;
                }
            }
        }
        self.visiting.remove(key);
        if blocked {
            return Ok(Visit::Blocked);
        }

        let node = PlanNode {
            builder: job.builder_name().to_string(),
            key: key.clone(),
            config: job.config().clone(),
            job_setup: builder.create_job_setup(job.config()),
            dep_keys,
            existing_dep_ids,
            job_id: None,
        };
        self.plan.order.push(key.clone());
        self.plan.nodes.insert(key.clone(), node);
        Ok(Visit::Node)
    }
}

fn format_time(ms: f64) -> String {
    if ms < 1000.0 {
        format!("{ms:.0}ms")
    } else if ms < 60_000.0 {
        format!("{:.1}s", ms / 1000.0)
    } else {
        format!("{:.1}min", ms / 60_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_time_scales() {
        assert_eq!(format_time(12.0), "12ms");
        assert_eq!(format_time(1500.0), "1.5s");
        assert_eq!(format_time(90_000.0), "1.5min");
    }
}
