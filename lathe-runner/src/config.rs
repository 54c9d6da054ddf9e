//! Runner configuration
//!
//! Loaded from a TOML file with four sections:
//!
//! ```toml
//! [general]
//! debug = false
//! keep_job_dirs = false
//! compression = "deflated"   # or "stored"
//! gpu_id = 0
//! cancel_check_wait = 30     # seconds
//! backend_error_wait = [10, 30, 60]
//!
//! [backend]
//! url = "https://lathe.example.com/api"
//! user = "node"
//! password = "secret"
//! timeout_secs = 30
//!
//! [docker]
//! engine = "docker"
//! work_dir = "/var/lib/lathe/work"
//! cache_dir = "/var/lib/lathe/cache"
//! use_sudo = false
//! ask_sudo_pw = false
//! use_current_user = true
//! additional_gpu_flags = []
//!
//! [poll]
//! method = "simple"
//! interval = [5, 10, 30]
//! backoff_mode = "clamp"     # or "wrap"
//! hardware_filter = false
//! ```
//!
//! `backend` and the `docker` directories are required. Environment
//! variables override the file:
//! - LATHE_BACKEND_URL
//! - LATHE_BACKEND_USER
//! - LATHE_BACKEND_PASSWORD
//! - LATHE_GPU_ID

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use serde::Deserialize;

use crate::artifact::Compression;
use crate::backoff::BackoffMode;
use crate::container::ContainerSettings;
use crate::executor::ExecutorSettings;
use crate::scheduler::PollSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub backend: BackendConfig,
    pub docker: DockerConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Switches the default log filter to debug
    pub debug: bool,
    /// Keep job directories after the job finished
    pub keep_job_dirs: bool,
    pub compression: Compression,
    /// GPU this agent drives
    pub gpu_id: u32,
    /// Seconds between two cancellation queries for a running job
    pub cancel_check_wait: u64,
    /// Seconds to wait after consecutive backend errors
    pub backend_error_wait: Vec<u64>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debug: false,
            keep_job_dirs: false,
            compression: Compression::default(),
            gpu_id: 0,
            cancel_check_wait: 30,
            backend_error_wait: vec![10],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_engine")]
    pub engine: String,
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default)]
    pub ask_sudo_pw: bool,
    #[serde(default)]
    pub use_current_user: bool,
    #[serde(default)]
    pub additional_gpu_flags: Vec<String>,
}

fn default_engine() -> String {
    "docker".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMethod {
    /// Ask the backend for the job list on every round
    #[default]
    Simple,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub method: PollMethod,
    /// Seconds between empty polling rounds
    pub interval: Vec<u64>,
    pub backoff_mode: BackoffMode,
    /// Let the backend drop jobs this node's hardware cannot run
    pub hardware_filter: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            method: PollMethod::Simple,
            interval: vec![10],
            backoff_mode: BackoffMode::Clamp,
            hardware_filter: false,
        }
    }
}

impl Config {
    /// Loads, overrides from the environment and validates
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file
    ///
    /// Environment overrides are applied separately via
    /// `apply_env_overrides()`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("Failed to parse config file: {}", e))
    }

    /// Applies `LATHE_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from any variable source
    ///
    /// # Arguments
    /// * `lookup` - Returns the value of a variable, if set
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("LATHE_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(user) = lookup("LATHE_BACKEND_USER") {
            self.backend.user = user;
        }
        if let Some(password) = lookup("LATHE_BACKEND_PASSWORD") {
            self.backend.password = password;
        }
        if let Some(gpu_id) = lookup("LATHE_GPU_ID") {
            self.general.gpu_id = gpu_id
                .trim()
                .parse()
                .with_context(|| format!("LATHE_GPU_ID must be a GPU index, got '{}'", gpu_id))?;
        }
        Ok(())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend.url.is_empty() {
            bail!("backend.url cannot be empty");
        }

        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            bail!("backend.url must start with http:// or https://");
        }

        if self.backend.timeout_secs == 0 {
            bail!("backend.timeout_secs must be greater than 0");
        }

        if self.docker.engine.trim().is_empty() {
            bail!("docker.engine cannot be empty");
        }

        if self.docker.work_dir.as_os_str().is_empty() || self.docker.cache_dir.as_os_str().is_empty() {
            bail!("docker.work_dir and docker.cache_dir must be set");
        }

        if self.docker.ask_sudo_pw && !self.docker.use_sudo {
            bail!("docker.ask_sudo_pw requires docker.use_sudo");
        }

        if self.general.cancel_check_wait == 0 {
            bail!("general.cancel_check_wait must be greater than 0");
        }

        if self.general.backend_error_wait.is_empty() {
            bail!("general.backend_error_wait cannot be empty");
        }

        if self.poll.interval.is_empty() {
            bail!("poll.interval cannot be empty");
        }

        Ok(())
    }

    pub fn backend_error_wait(&self) -> Vec<Duration> {
        seconds(&self.general.backend_error_wait)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            work_dir: self.docker.work_dir.clone(),
            cache_dir: self.docker.cache_dir.clone(),
            keep_job_dirs: self.general.keep_job_dirs,
            cancel_check_wait: Duration::from_secs(self.general.cancel_check_wait),
            compression: self.general.compression,
            use_sudo: self.docker.use_sudo,
            ask_sudo_pw: self.docker.ask_sudo_pw,
        }
    }

    pub fn container_settings(&self) -> ContainerSettings {
        ContainerSettings {
            engine: self.docker.engine.clone(),
            use_sudo: self.docker.use_sudo,
            ask_sudo_pw: self.docker.ask_sudo_pw,
            use_current_user: self.docker.use_current_user,
            gpu_id: self.general.gpu_id,
            additional_gpu_flags: self.docker.additional_gpu_flags.clone(),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: seconds(&self.poll.interval),
            backoff_mode: self.poll.backoff_mode,
            hardware_filter: self.poll.hardware_filter,
        }
    }
}

fn seconds(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_secs).collect()
}
