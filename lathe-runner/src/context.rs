//! Execution context for a single job
//!
//! Contains all state one executor needs while it runs a job:
//! - Structured log, uploaded with the job's outputs at the end
//! - Private working directory inside `docker.work_dir`
//! - Cancellation monitor
//! - Progress reporting
//!
//! The context is owned by exactly one executor and passed to runners by
//! `&mut`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use lathe_core::domain::log::{CommandRecord, LogEntry, LogLevel};
use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactPackager;
use crate::backend::Backend;
use crate::cancellation::CancellationMonitor;
use crate::executor::ExecutorSettings;
use crate::executor::spec::JobSpec;

pub struct JobContext {
    spec: Arc<JobSpec>,
    backend: Arc<dyn Backend>,
    settings: ExecutorSettings,
    job_dir: Option<TempDir>,
    log: Vec<LogEntry>,
    outputs: Vec<String>,
    cancellation: CancellationMonitor,
}

impl JobContext {
    /// Creates the context for one job run
    ///
    /// # Arguments
    /// * `spec` - The job being executed
    /// * `backend` - Backend used for progress and cancellation checks
    /// * `settings` - Node-wide executor settings
    pub fn new(spec: Arc<JobSpec>, backend: Arc<dyn Backend>, settings: ExecutorSettings) -> Self {
        let cancellation =
            CancellationMonitor::new(Arc::clone(&backend), spec.pk(), settings.cancel_check_wait);
        Self {
            spec,
            backend,
            settings,
            job_dir: None,
            log: Vec::new(),
            outputs: Vec::new(),
            cancellation,
        }
    }

    pub fn job_pk(&self) -> i64 {
        self.spec.pk()
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn packager(&self) -> ArtifactPackager {
        ArtifactPackager::new(self.settings.compression)
    }

    // =============================================================================
    // Structured log
    // =============================================================================

    /// Adds a log entry
    pub fn add_log(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    fn push(&mut self, level: LogLevel, message: String, command: Option<CommandRecord>) {
        self.add_log(LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            message,
            command,
        });
    }

    /// Logs a debug message
    pub fn log_debug(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Debug, message.into(), None);
    }

    /// Logs an info message
    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into(), None);
    }

    /// Logs a warning message
    pub fn log_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Job {}: {}", self.job_pk(), message);
        self.push(LogLevel::Warning, message, None);
    }

    /// Logs an error message
    pub fn log_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("Job {}: {}", self.job_pk(), message);
        self.push(LogLevel::Error, message, None);
    }

    /// Records an external command together with its output
    pub fn log_command(&mut self, record: CommandRecord) {
        let level = if record.returncode == 0 {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        let message = format!("Command exited with {}: {}", record.returncode, record.cmd.join(" "));
        self.push(level, message, Some(record));
    }

    pub fn log_entries(&self) -> &[LogEntry] {
        &self.log
    }

    /// Writes the structured log as JSON
    pub fn write_log(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.log).context("Failed to serialize job log")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write job log to {}", path.display()))
    }

    /// Remembers an output uploaded for this job
    pub fn record_output(&mut self, name: &str) {
        self.outputs.push(name.to_string());
    }

    /// Names of the outputs uploaded so far, in upload order
    pub fn uploaded_outputs(&self) -> &[String] {
        &self.outputs
    }

    // =============================================================================
    // Working directory
    // =============================================================================

    /// Creates the private working directory inside `work_dir`
    pub fn create_job_dir(&mut self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", self.job_pk()))
            .tempdir_in(&self.settings.work_dir)
            .with_context(|| {
                format!(
                    "Failed to create job directory in {}",
                    self.settings.work_dir.display()
                )
            })?;
        let path = dir.path().to_path_buf();
        debug!("Job {} working in {}", self.job_pk(), path.display());
        self.log_info(format!("Created job directory: {}", path.display()));
        self.job_dir = Some(dir);
        Ok(path)
    }

    pub fn job_dir(&self) -> Option<&Path> {
        self.job_dir.as_ref().map(TempDir::path)
    }

    /// The job directory, created on demand
    pub fn ensure_job_dir(&mut self) -> Result<PathBuf> {
        match self.job_dir() {
            Some(dir) => Ok(dir.to_path_buf()),
            None => self.create_job_dir(),
        }
    }

    /// Removes the job directory, or keeps it if `keep_job_dirs` is set
    pub fn close_job_dir(&mut self) {
        let Some(dir) = self.job_dir.take() else {
            return;
        };

        if self.settings.keep_job_dirs {
            let path = dir.keep();
            info!("Keeping job directory {}", path.display());
            return;
        }

        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            warn!("Failed to remove job directory {}: {}", path.display(), e);
        }
    }

    // =============================================================================
    // Cancellation and progress
    // =============================================================================

    /// Checks whether the job was cancelled
    ///
    /// Backend errors are logged and treated as "not cancelled".
    pub async fn is_cancelled(&mut self, immediate: bool) -> bool {
        match self.cancellation.check(immediate).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                self.log_warning(format!("Failed to check for cancellation: {:#}", e));
                false
            }
        }
    }

    /// Reports progress to the backend
    ///
    /// Skipped once the job is known to be cancelled. A failed report
    /// triggers an immediate cancellation check.
    ///
    /// # Arguments
    /// * `fraction` - Fraction complete, clamped to `[0, 1]`
    /// * `metadata` - Free-form details sent with the progress
    pub async fn report_progress(&mut self, fraction: f64, metadata: Map<String, Value>) {
        if self.cancellation.is_known_cancelled() {
            return;
        }

        let fraction = fraction.clamp(0.0, 1.0);
        let pk = self.job_pk();
        if let Err(e) = self.backend.progress_job(pk, fraction, metadata).await {
            self.log_warning(format!("Failed to report progress {:.3}: {:#}", fraction, e));
            self.is_cancelled(true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Compression;
    use crate::backend::MemoryBackend;
    use lathe_core::domain::job::{Job, TemplateRef};
    use lathe_core::domain::template::Template;
    use std::time::Duration;

    fn settings(work_dir: &Path, keep_job_dirs: bool) -> ExecutorSettings {
        ExecutorSettings {
            work_dir: work_dir.to_path_buf(),
            cache_dir: work_dir.join("cache"),
            keep_job_dirs,
            cancel_check_wait: Duration::from_secs(30),
            compression: Compression::Deflated,
            use_sudo: false,
            ask_sudo_pw: false,
        }
    }

    fn spec() -> Arc<JobSpec> {
        let job = Job {
            pk: 9,
            template: TemplateRef { pk: 1, name: None },
            input_values: Default::default(),
            parameter_values: Default::default(),
            node: Some(1),
            start_time: None,
            end_time: None,
            error_reason: None,
            is_cancelled: false,
            docker_image: None,
        };
        let template = Template {
            pk: 1,
            name: "t".to_string(),
            version: 1,
            contract: "Train".to_string(),
            parameters: Default::default(),
            description: String::new(),
        };
        Arc::new(JobSpec::build(job, template, None).unwrap())
    }

    fn context(backend: &MemoryBackend, work_dir: &Path, keep: bool) -> JobContext {
        backend.insert_job(spec().job.clone());
        JobContext::new(spec(), Arc::new(backend.clone()), settings(work_dir, keep))
    }

    #[test]
    fn test_job_dir_removed_on_close() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(&MemoryBackend::new(), work.path(), false);

        let dir = ctx.create_job_dir().unwrap();
        assert!(dir.starts_with(work.path()));
        assert!(dir.exists());

        ctx.close_job_dir();
        assert!(!dir.exists());
        assert!(ctx.job_dir().is_none());
    }

    #[test]
    fn test_job_dir_kept_when_configured() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(&MemoryBackend::new(), work.path(), true);

        let dir = ctx.create_job_dir().unwrap();
        ctx.close_job_dir();
        assert!(dir.exists());
    }

    #[test]
    fn test_write_log() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(&MemoryBackend::new(), work.path(), false);
        ctx.log_info("hello");
        ctx.log_command(CommandRecord {
            cmd: vec!["docker".into(), "pull".into(), "img".into()],
            returncode: 1,
            output: vec!["denied".into()],
        });

        let path = work.path().join("log.json");
        ctx.write_log(&path).unwrap();
        let entries: Vec<LogEntry> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(entries[1].command.as_ref().unwrap().output, vec!["denied"]);
    }

    #[tokio::test]
    async fn test_progress_suppressed_after_cancellation() {
        let work = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, work.path(), false);

        ctx.report_progress(0.5, Map::new()).await;
        backend.cancel_job(9);
        assert!(ctx.is_cancelled(true).await);
        ctx.report_progress(0.75, Map::new()).await;

        assert_eq!(backend.progress_reports(), vec![(9, 0.5)]);
    }

    #[tokio::test]
    async fn test_failed_progress_checks_cancellation() {
        let work = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, work.path(), false);
        backend.fail("progress_job");
        backend.cancel_job(9);

        ctx.report_progress(1.5, Map::new()).await;

        assert_eq!(backend.call_count("retrieve_job"), 1);
        assert!(ctx.is_cancelled(false).await);
    }
}
