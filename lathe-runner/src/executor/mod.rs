//! Job execution
//!
//! A [`JobExecutor`] takes one prepared job through its whole life on
//! this node:
//!
//! ```text
//! Created -> Acquiring -> Running(PreRun) -> Running(DoRun) -> Running(PostRun) -> Finished
//! ```
//!
//! Acquiring claims and starts the job, PreRun logs into the registry and
//! pulls the image, DoRun hands over to the contract's [`JobRunner`] and
//! PostRun uploads the log and reports the outcome. PostRun always runs,
//! so the backend hears about every job this node acquired, including
//! failed and cancelled ones.

pub mod docker;
pub mod registry;
pub mod spec;

pub use registry::{JobRunner, RunnerFactory, RunnerRegistry};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use lathe_core::domain::hardware::HardwareSnapshot;
use tracing::{debug, error, info, warn};

use crate::artifact::{Compression, StripPath};
use crate::backend::{Backend, NOTIFICATION};
use crate::container::{CANCELLED_MARKER, ContainerRunner};
use crate::context::JobContext;
use crate::matcher;
use crate::node::NodeIdentity;
use spec::JobSpec;

/// Error reported when setup failed without a more specific reason
pub const PRE_RUN_ERROR: &str = "An error occurred during pre-run, check log!";

/// Error reported when the runner failed without a more specific reason
pub const RUN_ERROR: &str = "An error occurred during run, check log!";

/// Node-wide settings every job execution shares
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Parent of the per-job working directories
    pub work_dir: PathBuf,
    /// Mounted into containers as `/cache`
    pub cache_dir: PathBuf,
    pub keep_job_dirs: bool,
    /// Minimum time between two cancellation queries
    pub cancel_check_wait: Duration,
    pub compression: Compression,
    pub use_sudo: bool,
    pub ask_sudo_pw: bool,
}

/// Everything an executor needs besides the job itself
pub struct ExecutorEnv {
    pub backend: Arc<dyn Backend>,
    pub containers: Arc<ContainerRunner>,
    pub settings: ExecutorSettings,
    pub node: NodeIdentity,
}

/// Failure of a runner's main work
#[derive(Debug)]
pub enum RunError {
    /// The job was cancelled through the backend
    Cancelled,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for RunError {
    fn from(e: anyhow::Error) -> Self {
        RunError::Failed(e)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Cancelled => write!(f, "{}", CANCELLED_MARKER),
            RunError::Failed(e) => write!(f, "{:#}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    PreRun,
    DoRun,
    PostRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Created,
    Acquiring,
    Running(RunPhase),
    Finished,
}

/// Outcome of [`JobExecutor::run`]
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_pk: i64,
    pub success: bool,
    pub cancelled: bool,
    /// Error reason sent to the backend
    pub error: Option<String>,
    /// Outputs uploaded for the job, including the log
    pub outputs: Vec<String>,
    /// States the executor went through, in order
    pub states: Vec<ExecutorState>,
}

impl RunReport {
    pub fn ran(&self, phase: RunPhase) -> bool {
        self.states.contains(&ExecutorState::Running(phase))
    }
}

pub struct JobExecutor {
    spec: Arc<JobSpec>,
    runner: Box<dyn JobRunner>,
    env: Arc<ExecutorEnv>,
    states: Vec<ExecutorState>,
    /// Registry logged into during pre-run
    registry_login: Option<String>,
}

impl JobExecutor {
    pub fn new(spec: JobSpec, runner: Box<dyn JobRunner>, env: Arc<ExecutorEnv>) -> Self {
        Self {
            spec: Arc::new(spec),
            runner,
            env,
            states: vec![ExecutorState::Created],
            registry_login: None,
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn state(&self) -> ExecutorState {
        self.states
            .last()
            .copied()
            .unwrap_or(ExecutorState::Created)
    }

    /// Checks the job's image against this node's hardware
    ///
    /// Returns `None` when the job can run here, otherwise the reason it
    /// cannot. Jobs without an image run anywhere.
    pub fn can_run(&self, snapshot: &HardwareSnapshot) -> Option<String> {
        self.spec
            .image
            .as_ref()
            .and_then(|image| matcher::can_run(image, snapshot))
    }

    fn transition(&mut self, state: ExecutorState) {
        debug!("Job {}: {:?} -> {:?}", self.spec.pk(), self.state(), state);
        self.states.push(state);
    }

    /// Runs the job to completion
    ///
    /// Never fails: every error ends up in the job log and in the outcome
    /// reported to the backend.
    pub async fn run(mut self) -> RunReport {
        let pk = self.spec.pk();
        info!("Executing job {} (template '{}')", pk, self.spec.template.name);

        let mut ctx = JobContext::new(
            Arc::clone(&self.spec),
            Arc::clone(&self.env.backend),
            self.env.settings.clone(),
        );
        let mut error = None;
        let mut cancelled = false;

        let pre_run = match self.pre_run(&mut ctx).await {
            Ok(acquired) => acquired,
            Err(e) => {
                let message = format!("Failed to execute pre-run code:\n{:#}", e);
                ctx.log_error(message.clone());
                error = Some(message);
                false
            }
        };

        let mut do_run = false;
        if pre_run {
            self.transition(ExecutorState::Running(RunPhase::DoRun));
            self.ping(&mut ctx).await;
            match self.do_run(&mut ctx).await {
                Ok(()) => do_run = true,
                Err(RunError::Cancelled) => {
                    ctx.log_warning(CANCELLED_MARKER);
                    cancelled = true;
                    error = Some(CANCELLED_MARKER.to_string());
                }
                Err(RunError::Failed(e)) => {
                    let message = format!("Failed to execute do-run code:\n{:#}", e);
                    ctx.log_error(message.clone());
                    error = Some(message);
                }
            }
        }

        self.transition(ExecutorState::Running(RunPhase::PostRun));
        self.ping(&mut ctx).await;

        let success = pre_run && do_run;
        let error = if success {
            None
        } else {
            Some(error.unwrap_or_else(|| {
                if pre_run { RUN_ERROR } else { PRE_RUN_ERROR }.to_string()
            }))
        };
        self.post_run(&mut ctx, success, error.as_deref()).await;
        self.transition(ExecutorState::Finished);

        info!(
            "Job {} finished: {}",
            pk,
            if success { "success" } else { "failure" }
        );

        RunReport {
            job_pk: pk,
            success,
            cancelled,
            error,
            outputs: ctx.uploaded_outputs().to_vec(),
            states: self.states,
        }
    }

    /// Claims and starts the job, then prepares its image
    ///
    /// `Ok(false)` means the job could not be acquired or started; any
    /// error after that fails the pre-run.
    async fn pre_run(&mut self, ctx: &mut JobContext) -> Result<bool> {
        self.transition(ExecutorState::Acquiring);

        let spec = Arc::clone(&self.spec);
        let env = Arc::clone(&self.env);
        let pk = spec.pk();

        ctx.log_info(format!("Node IP: {}", env.node.ip));
        ctx.log_info(format!(
            "use_sudo: {}, ask_sudo_pw: {}",
            env.settings.use_sudo, env.settings.ask_sudo_pw
        ));
        ctx.log_info(format!("Job:\n{}", serde_json::to_string_pretty(&spec.job)?));
        ctx.log_info(format!(
            "Template:\n{}",
            serde_json::to_string_pretty(&spec.template)?
        ));

        ctx.create_job_dir()?;

        if let Err(e) = env.backend.acquire_job(pk, env.node.pk).await {
            ctx.log_error(format!("Failed to acquire job {}:\n{:#}", pk, e));
            return Ok(false);
        }
        if let Err(e) = env.backend.start_job(pk, NOTIFICATION).await {
            ctx.log_error(format!("Failed to start job {}:\n{:#}", pk, e));
            return Ok(false);
        }
        ctx.log_info(format!("Job {} acquired by node {}", pk, env.node.pk));

        self.transition(ExecutorState::Running(RunPhase::PreRun));

        if let Some(image) = &spec.image {
            if let Some((username, password)) = image.registry_credentials() {
                let result = env
                    .containers
                    .login(ctx, &image.registry_url, username, password)
                    .await;
                if !result.success() {
                    bail!(
                        "Failed to log into registry '{}' (return code {})",
                        image.registry_url,
                        result.returncode
                    );
                }
                self.registry_login = Some(image.registry_url.clone());
            }

            let result = env.containers.pull(ctx, image).await;
            if !result.success() {
                bail!(
                    "Failed to pull image {} (return code {})",
                    image.url,
                    result.returncode
                );
            }
        }

        Ok(true)
    }

    async fn do_run(&self, ctx: &mut JobContext) -> Result<(), RunError> {
        if ctx.is_cancelled(true).await {
            return Err(RunError::Cancelled);
        }
        self.runner.do_run(ctx, &self.env.containers).await
    }

    /// Logs out, uploads the job log and reports the outcome
    async fn post_run(&mut self, ctx: &mut JobContext, success: bool, error: Option<&str>) {
        let pk = self.spec.pk();

        if let Some(registry) = self.registry_login.take() {
            let result = self.env.containers.logout(ctx, &registry).await;
            if !result.success() {
                ctx.log_warning(format!("Failed to log out of registry '{}'", registry));
            }
        }

        self.upload_log(ctx).await;

        match self
            .env
            .backend
            .finish_job(pk, success, NOTIFICATION, error)
            .await
        {
            Ok(_) => info!("Reported job {} as finished (success: {})", pk, success),
            Err(e) => error!("Failed to finish job {}: {:#}", pk, e),
        }

        ctx.close_job_dir();
    }

    async fn upload_log(&self, ctx: &mut JobContext) {
        let dir = match ctx.ensure_job_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Job {}: no directory for the log: {:#}", ctx.job_pk(), e);
                return;
            }
        };

        let log_path = dir.join("log.json");
        if let Err(e) = ctx.write_log(&log_path) {
            error!("Job {}: {:#}", ctx.job_pk(), e);
            return;
        }

        let packager = ctx.packager();
        let uploaded = packager
            .compress_and_upload(
                ctx,
                "log",
                "json",
                &[log_path],
                &dir.join("log.zip"),
                StripPath::Basename,
            )
            .await;
        if !uploaded {
            warn!("Job {}: log was not uploaded", ctx.job_pk());
        }
    }

    async fn ping(&self, ctx: &mut JobContext) {
        if let Err(e) = self.env.backend.ping_node(self.env.node.pk).await {
            ctx.log_warning(format!("Failed to ping backend: {:#}", e));
        }
    }
}
