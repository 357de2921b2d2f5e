// SPDX-License-Identifier: MIT OR Apache-2.0
//! Builders and the in-process registry.
//!
//! A builder runs in two phases. The *dependency phase* receives the config
//! and a [`DepContext`] and emits the jobs this computation consumes; it must
//! be deterministic in the config and free of side effects. The *full phase*
//! receives a [`JobContext`](crate::JobContext) with the resolved inputs and
//! produces the value. Frozen builders have no full phase; their values are
//! inserted externally.

use crate::context::JobContext;
use crate::error::GranaryError;
use crate::job::JobRef;
use granary_core::{ConfigValue, JobSetup, short_repr, validate_builder_name};
use std::collections::HashMap;
use std::sync::Arc;

/// A serialized value ready to be stored: MessagePack bytes plus a short
/// human-readable repr for listings.
#[derive(Debug, Clone)]
pub struct PackedValue {
    pub(crate) bytes: Vec<u8>,
    pub(crate) repr: String,
}

impl PackedValue {
    /// Serialize a value into the store's binary encoding.
    pub fn pack<T: serde::Serialize>(value: &T) -> Result<PackedValue, GranaryError> {
        let bytes = rmp_serde::to_vec(value)?;
        let repr = match serde_json::to_string(value) {
            Ok(rendered) => short_repr(&rendered),
            Err(_) => "<value>".to_string(),
        };
        Ok(PackedValue { bytes, repr })
    }

    /// The binary payload.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Collects the jobs emitted by a dependency phase.
#[derive(Debug, Default)]
pub struct DepContext {
    deps: Vec<JobRef>,
}

impl DepContext {
    pub(crate) fn new() -> DepContext {
        DepContext::default()
    }

    /// Declare that this computation consumes `job`'s value.
    pub fn emit(&mut self, job: JobRef) {
        self.deps.push(job);
    }

    pub(crate) fn into_deps(self) -> Vec<JobRef> {
        self.deps
    }
}

type ComputeFn =
    dyn Fn(&mut JobContext) -> Result<Option<PackedValue>, GranaryError> + Send + Sync;
type DepsFn = dyn Fn(&ConfigValue, &mut DepContext) -> Result<(), GranaryError> + Send + Sync;
type SetupFn = dyn Fn(&ConfigValue) -> JobSetup + Send + Sync;

enum SetupSpec {
    Static(JobSetup),
    Derived(Box<SetupFn>),
}

/// A named two-phase computation.
pub struct Builder {
    name: String,
    compute: Option<Arc<ComputeFn>>,
    deps: Option<Arc<DepsFn>>,
    setup: SetupSpec,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl Builder {
    /// A builder with a full phase and no dependencies.
    ///
    /// # Errors
    ///
    /// Fails when the name is not a valid identifier.
    pub fn new<F>(name: impl Into<String>, compute: F) -> Result<Builder, GranaryError>
    where
        F: Fn(&mut JobContext) -> Result<Option<PackedValue>, GranaryError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        validate_builder_name(&name)?;
        Ok(Builder {
            name,
            compute: Some(Arc::new(compute)),
            deps: None,
            setup: SetupSpec::Static(JobSetup::default()),
        })
    }

    /// A frozen builder: no callable, values must be inserted externally.
    pub fn frozen(name: impl Into<String>) -> Result<Builder, GranaryError> {
        let name = name.into();
        validate_builder_name(&name)?;
        Ok(Builder {
            name,
            compute: None,
            deps: None,
            setup: SetupSpec::Static(JobSetup::default()),
        })
    }

    /// Attach the dependency phase.
    #[must_use]
    pub fn dependencies<F>(mut self, deps: F) -> Builder
    where
        F: Fn(&ConfigValue, &mut DepContext) -> Result<(), GranaryError> + Send + Sync + 'static,
    {
        self.deps = Some(Arc::new(deps));
        self
    }

    /// Use a fixed job setup for every config.
    #[must_use]
    pub fn job_setup(mut self, setup: impl Into<JobSetup>) -> Builder {
        self.setup = SetupSpec::Static(setup.into());
        self
    }

    /// Derive the job setup from the config.
    #[must_use]
    pub fn job_setup_fn<F>(mut self, setup: F) -> Builder
    where
        F: Fn(&ConfigValue) -> JobSetup + Send + Sync + 'static,
    {
        self.setup = SetupSpec::Derived(Box::new(setup));
        self
    }

    /// The builder's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` when the builder has no callable.
    pub fn is_frozen(&self) -> bool {
        self.compute.is_none()
    }

    /// A reference to this builder's job for `config`.
    pub fn job(&self, config: impl Into<ConfigValue>) -> Result<JobRef, GranaryError> {
        JobRef::new(self.name.clone(), config)
    }

    /// Run the dependency phase, collecting the emitted jobs.
    pub(crate) fn collect_deps(&self, config: &ConfigValue) -> Result<Vec<JobRef>, GranaryError> {
        let mut ctx = DepContext::new();
        if let Some(deps) = &self.deps {
            (**deps)(config, &mut ctx)?;
        }
        Ok(ctx.into_deps())
    }

    /// Derive the job setup for `config`.
    pub(crate) fn create_job_setup(&self, config: &ConfigValue) -> JobSetup {
        match &self.setup {
            SetupSpec::Static(setup) => setup.clone(),
            SetupSpec::Derived(f) => f(config),
        }
    }

    pub(crate) fn compute_fn(&self) -> Option<Arc<ComputeFn>> {
        self.compute.clone()
    }
}

/// Process-lifetime registry of builders, by name.
#[derive(Debug, Default)]
pub struct BuilderRegistry {
    builders: HashMap<String, Arc<Builder>>,
}

impl BuilderRegistry {
    /// Create an empty registry.
    pub fn new() -> BuilderRegistry {
        BuilderRegistry::default()
    }

    /// Register a builder, replacing any previous entry of the same name.
    pub fn register(&mut self, builder: Builder) -> Arc<Builder> {
        let builder = Arc::new(builder);
        self.builders
            .insert(builder.name().to_string(), builder.clone());
        builder
    }

    /// Look up a builder by name.
    pub fn get(&self, name: &str) -> Result<Arc<Builder>, GranaryError> {
        self.builders
            .get(name)
            .cloned()
            .ok_or_else(|| GranaryError::UnknownBuilder {
                name: name.to_string(),
            })
    }

    /// `true` when a builder of this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Sorted names of all registered builders.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_value_produces_repr() {
        let packed = PackedValue::pack(&42i64).unwrap();
        assert_eq!(packed.repr, "42");
        let decoded: i64 = rmp_serde::from_slice(packed.bytes()).unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn register_replaces_duplicates() {
        let mut registry = BuilderRegistry::new();
        registry.register(Builder::frozen("col1").unwrap());
        registry.register(Builder::new("col1", |_ctx| Ok(None)).unwrap());
        assert!(!registry.get("col1").unwrap().is_frozen());
        assert!(registry.get("missing").is_err());
        assert_eq!(registry.names(), vec!["col1".to_string()]);
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(Builder::frozen("not valid").is_err());
        assert!(Builder::new("1bad", |_ctx| Ok(None)).is_err());
    }

    #[test]
    fn dependency_phase_collects_emitted_jobs() {
        let builder = Builder::new("total", |_ctx| Ok(None))
            .unwrap()
            .dependencies(|config, ctx| {
                let n = config.as_int().unwrap_or(0);
                for i in 0..n {
                    ctx.emit(JobRef::new("item", i)?);
                }
                Ok(())
            });
        let deps = builder.collect_deps(&ConfigValue::from(3)).unwrap();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].builder_name(), "item");
    }

    #[test]
    fn job_setup_derivation() {
        let fixed = Builder::frozen("a").unwrap().job_setup("cluster");
        assert_eq!(
            fixed.create_job_setup(&ConfigValue::from(1)).runner,
            "cluster"
        );

        let derived = Builder::frozen("b").unwrap().job_setup_fn(|config| {
            JobSetup::default().exclusive(config.as_int() == Some(0))
        });
        assert!(derived.create_job_setup(&ConfigValue::from(0)).exclusive);
        assert!(!derived.create_job_setup(&ConfigValue::from(1)).exclusive);
    }
}
