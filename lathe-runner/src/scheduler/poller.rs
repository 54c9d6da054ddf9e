//! Job poller
//!
//! Asks the backend for unclaimed jobs whose template contract has a
//! registered runner, prepares each candidate in list order and hands out
//! the first one this node's hardware can run. Empty rounds back off
//! according to the poll interval schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use lathe_core::domain::hardware::HardwareSnapshot;
use lathe_core::domain::job::Job;
use lathe_core::dto::filter::{CompareOp, FilterExpression, FilterSpec};
use tracing::{debug, info, warn};

use crate::backoff::{BackoffMode, BackoffScheduler};
use crate::executor::spec::{JobSpec, docker_image_pk};
use crate::executor::{ExecutorEnv, JobExecutor, RunnerRegistry};

#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Waits between empty rounds
    pub interval: Vec<Duration>,
    pub backoff_mode: BackoffMode,
    /// Also filter by hardware on the backend
    pub hardware_filter: bool,
}

pub struct JobPoller {
    env: Arc<ExecutorEnv>,
    registry: RunnerRegistry,
    snapshot: Arc<HardwareSnapshot>,
    filter: FilterSpec,
    interval: BackoffScheduler,
}

impl JobPoller {
    /// Creates a poller
    ///
    /// # Arguments
    /// * `env` - Shared by every executor the poller hands out
    /// * `registry` - Contracts this node can run
    /// * `snapshot` - This node's hardware
    /// * `settings` - Poll interval schedule and filtering
    pub fn new(
        env: Arc<ExecutorEnv>,
        registry: RunnerRegistry,
        snapshot: Arc<HardwareSnapshot>,
        settings: &PollSettings,
    ) -> Self {
        let filter = job_filter(&registry, &snapshot, settings.hardware_filter);
        let interval = BackoffScheduler::new("poll", settings.interval.clone(), settings.backoff_mode);
        Self {
            env,
            registry,
            snapshot,
            filter,
            interval,
        }
    }

    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    /// Waits until there is a job this node can run
    ///
    /// A failed listing is returned to the caller; everything else about a
    /// single candidate only skips that candidate.
    pub async fn poll(&mut self) -> Result<JobExecutor> {
        loop {
            if let Some(executor) = self.poll_once().await? {
                self.interval.reset();
                return Ok(executor);
            }
            self.interval.sleep().await;
            self.interval.advance();
        }
    }

    /// One polling round
    pub async fn poll_once(&self) -> Result<Option<JobExecutor>> {
        let jobs = self.candidates().await?;
        if jobs.is_empty() {
            debug!("No jobs available");
            return Ok(None);
        }
        debug!("Found {} candidate job(s)", jobs.len());

        let ownership = ownership_filter();
        for job in jobs {
            let pk = job.pk;

            let record = serde_json::to_value(&job).context("Failed to serialize job")?;
            if !ownership.matches(&record) {
                debug!("Skipping job {}: already claimed", pk);
                continue;
            }

            match self.prepare(job).await {
                Ok(executor) => match executor.can_run(&self.snapshot) {
                    None => {
                        info!("Selected job {}", pk);
                        return Ok(Some(executor));
                    }
                    Some(reason) => info!("Skipping job {}: {}", pk, reason),
                },
                Err(e) => warn!("Skipping job {}: {:#}", pk, e),
            }
        }

        Ok(None)
    }

    /// Jobs matching this node's filter, in backend order
    pub async fn candidates(&self) -> Result<Vec<Job>> {
        self.env
            .backend
            .list_jobs(&self.filter)
            .await
            .context("Failed to list jobs")
    }

    /// Resolves template, image and runner of a candidate
    async fn prepare(&self, job: Job) -> Result<JobExecutor> {
        let backend = &self.env.backend;

        let template = backend
            .retrieve_template(job.template.pk)
            .await
            .with_context(|| format!("Failed to retrieve template {}", job.template.pk))?;

        let factory = self
            .registry
            .resolve(&template.contract)
            .ok_or_else(|| anyhow!("No runner for contract '{}'", template.contract))?;

        let image = match job.docker_image.clone() {
            Some(image) => Some(image),
            None => match docker_image_pk(&job, Some(&template)) {
                Some(pk) => Some(
                    backend
                        .retrieve_docker_image(pk)
                        .await
                        .with_context(|| format!("Failed to retrieve docker image {}", pk))?,
                ),
                None => None,
            },
        };

        let spec = JobSpec::build(job, template, image)?;
        let runner = factory.create(&spec)?;
        Ok(JobExecutor::new(spec, runner, Arc::clone(&self.env)))
    }
}

/// Jobs nobody started, failed or claimed yet
pub fn ownership_filter() -> FilterExpression {
    FilterExpression::and(vec![
        FilterExpression::is_null("start_time"),
        FilterExpression::is_null("error_reason"),
        FilterExpression::is_null("node"),
    ])
}

/// Jobs whose template contract is one of the registered ones
pub fn contract_filter(registry: &RunnerRegistry) -> FilterExpression {
    FilterExpression::or(
        registry
            .contracts()
            .map(|contract| FilterExpression::contains("template.type", contract))
            .collect(),
    )
}

/// Jobs whose docker image this node's hardware can run
///
/// Without full GPU information only CPU-only images qualify.
pub fn hardware_filter(snapshot: &HardwareSnapshot) -> FilterExpression {
    let cpu_only = FilterExpression::exact("docker_image.cpu", true);

    let (Some(cuda), Some(driver), Some(compute)) = (
        snapshot.cuda.as_deref(),
        snapshot.driver.as_deref(),
        snapshot.primary_compute(),
    ) else {
        return cpu_only;
    };

    let cuda_ok = FilterExpression::or(vec![
        FilterExpression::is_null("docker_image.cuda_version"),
        FilterExpression::and(vec![
            FilterExpression::compare("docker_image.cuda_version.version", CompareOp::Le, cuda),
            FilterExpression::compare(
                "docker_image.cuda_version.min_driver_version",
                CompareOp::Le,
                driver,
            ),
        ]),
    ]);
    let generation_ok = FilterExpression::or(vec![
        FilterExpression::is_null("docker_image.min_hardware_generation"),
        FilterExpression::compare(
            "docker_image.min_hardware_generation.min_compute_capability",
            CompareOp::Le,
            compute,
        ),
    ]);

    FilterExpression::or(vec![
        cpu_only,
        FilterExpression::and(vec![cuda_ok, generation_ok]),
    ])
}

/// The filter sent with every job listing
pub fn job_filter(
    registry: &RunnerRegistry,
    snapshot: &HardwareSnapshot,
    with_hardware: bool,
) -> FilterSpec {
    let mut expressions = vec![ownership_filter(), contract_filter(registry)];
    if with_hardware {
        expressions.push(hardware_filter(snapshot));
    }
    FilterSpec::new(expressions)
}
