//! Node lifecycle
//!
//! Startup sequence:
//! 1. List hardware generations and collect the hardware snapshot
//! 2. Register the node (recovering an orphaned job)
//! 3. Poll and execute, one job at a time
//!
//! Backend failures in any step are logged and retried after the
//! backend-error backoff; they never end the process.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use lathe_core::domain::hardware::HardwareSnapshot;
use tracing::{error, info};

use super::poller::{JobPoller, PollSettings};
use crate::backend::Backend;
use crate::backoff::BackoffScheduler;
use crate::config::Config;
use crate::container::{ContainerRunner, ContainerSettings};
use crate::executor::{ExecutorEnv, ExecutorSettings, RunReport, RunnerRegistry};
use crate::hardware;
use crate::node::{self, NodeIdentity};

pub struct Launcher {
    backend: Arc<dyn Backend>,
    registry: RunnerRegistry,
    executor: ExecutorSettings,
    containers: ContainerSettings,
    poll: PollSettings,
    backend_errors: BackoffScheduler,
    gpu_id: u32,
    ip: String,
}

impl Launcher {
    /// # Arguments
    /// * `config` - Validated runner configuration
    /// * `backend` - The job backend
    /// * `registry` - Runners for the contracts this node accepts
    pub fn new(config: &Config, backend: Arc<dyn Backend>, registry: RunnerRegistry) -> Self {
        let poll = config.poll_settings();
        Self {
            backend,
            registry,
            executor: config.executor_settings(),
            containers: config.container_settings(),
            backend_errors: BackoffScheduler::new(
                "backend",
                config.backend_error_wait(),
                poll.backoff_mode,
            ),
            poll,
            gpu_id: config.general.gpu_id,
            ip: node::primary_ipv4(),
        }
    }

    /// Overrides the discovered IPv4 address
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Runs the node
    ///
    /// Returns after the first executed job unless `continuous` is set.
    /// In continuous mode it never returns; the caller stops it by dropping
    /// the future.
    ///
    /// # Returns
    /// Reports of the executed jobs
    pub async fn run(&mut self, continuous: bool) -> Result<Vec<RunReport>> {
        info!(
            "Starting node on {} (GPU {}, {} mode)",
            self.ip,
            self.gpu_id,
            if continuous { "continuous" } else { "single-shot" }
        );

        let snapshot = Arc::new(self.collect_hardware().await);
        let node = self.register(&snapshot).await;

        let env = Arc::new(ExecutorEnv {
            backend: Arc::clone(&self.backend),
            containers: Arc::new(ContainerRunner::new(self.containers.clone())),
            settings: self.executor.clone(),
            node,
        });
        let mut poller = JobPoller::new(env, self.registry.clone(), snapshot, &self.poll);

        let mut reports = Vec::new();
        loop {
            match poller.poll().await {
                Ok(executor) => {
                    self.backend_errors.reset();
                    let report = executor.run().await;
                    info!(
                        "Job {} done (success: {}, cancelled: {})",
                        report.job_pk, report.success, report.cancelled
                    );
                    reports.push(report);
                    if !continuous {
                        return Ok(reports);
                    }
                }
                Err(e) => {
                    error!("Polling failed: {:#}", e);
                    self.backend_errors.sleep().await;
                    self.backend_errors.advance();
                }
            }
        }
    }

    async fn collect_hardware(&mut self) -> HardwareSnapshot {
        let backend = Arc::clone(&self.backend);
        let generations = retry(&mut self.backend_errors, "list hardware generations", || {
            backend.list_hardware_generations()
        })
        .await;
        hardware::collect(&generations).await
    }

    async fn register(&mut self, snapshot: &HardwareSnapshot) -> NodeIdentity {
        let backend = Arc::clone(&self.backend);
        let (ip, gpu_id) = (self.ip.clone(), self.gpu_id);
        retry(&mut self.backend_errors, "register node", || {
            node::register(backend.as_ref(), snapshot, &ip, gpu_id)
        })
        .await
    }
}

/// Retries an operation until it succeeds, backing off between attempts
async fn retry<T, F, Fut>(backoff: &mut BackoffScheduler, what: &str, mut operation: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation().await {
            Ok(value) => {
                backoff.reset();
                return value;
            }
            Err(e) => {
                error!("Failed to {}: {:#}", what, e);
                backoff.sleep().await;
                backoff.advance();
            }
        }
    }
}
