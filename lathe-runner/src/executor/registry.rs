//! Contract-to-runner registry
//!
//! Templates name a contract such as `Train<ImageClassification>`. The
//! registry maps the contract's name (`Train`) to a [`RunnerFactory`]
//! that builds the [`JobRunner`] for a job. The poller only asks the
//! backend for jobs whose contract is registered here.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lathe_core::domain::template::contract_name;

use super::RunError;
use super::docker::DockerRunnerFactory;
use super::spec::JobSpec;
use crate::container::ContainerRunner;
use crate::context::JobContext;

/// Contract-specific main work of a job
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs the job's main work
    ///
    /// # Arguments
    /// * `ctx` - Log, working directory, progress and cancellation
    /// * `containers` - Engine used to run images
    async fn do_run(&self, ctx: &mut JobContext, containers: &ContainerRunner)
    -> Result<(), RunError>;
}

/// Builds runners for one contract
pub trait RunnerFactory: Send + Sync {
    /// Creates the runner for a job, validating what it needs up front
    fn create(&self, spec: &JobSpec) -> Result<Box<dyn JobRunner>>;
}

impl<F> RunnerFactory for F
where
    F: Fn(&JobSpec) -> Result<Box<dyn JobRunner>> + Send + Sync,
{
    fn create(&self, spec: &JobSpec) -> Result<Box<dyn JobRunner>> {
        self(spec)
    }
}

#[derive(Clone, Default)]
pub struct RunnerRegistry {
    factories: BTreeMap<String, Arc<dyn RunnerFactory>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in docker runner for `Train` and `Predict`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let docker: Arc<dyn RunnerFactory> = Arc::new(DockerRunnerFactory);
        registry.register("Train", Arc::clone(&docker));
        registry.register("Predict", docker);
        registry
    }

    /// Registers a factory, replacing any previous one for the contract
    pub fn register(&mut self, contract: impl Into<String>, factory: Arc<dyn RunnerFactory>) {
        self.factories.insert(contract.into(), factory);
    }

    /// Registered contract names, sorted
    pub fn contracts(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Finds the factory for a template contract
    ///
    /// Type arguments are ignored: `Train<Foo>` resolves to `Train`.
    pub fn resolve(&self, contract: &str) -> Option<Arc<dyn RunnerFactory>> {
        self.factories.get(contract_name(contract)).cloned()
    }
}
