//! Lathe Runner
//!
//! Entry point: loads the configuration, prepares the node's directories
//! and backend client, then runs the launcher until it finishes or the
//! process is interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lathe_client::BackendClient;
use lathe_runner::backend::Backend;
use lathe_runner::config::Config;
use lathe_runner::executor::RunnerRegistry;
use lathe_runner::scheduler::Launcher;

/// Worker-node agent for the Lathe job platform
#[derive(Parser, Debug)]
#[command(name = "lathe-runner")]
#[command(about = "Polls the job backend and runs jobs in containers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short = 'C', long, env = "LATHE_CONFIG", default_value = "/etc/lathe/runner.toml")]
    config: PathBuf,

    /// Keep polling for jobs instead of exiting after the first one
    #[arg(short, long)]
    continuous: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    // Initialize logging
    let default_filter = if config.general.debug {
        "lathe_runner=debug,lathe_client=debug"
    } else {
        "lathe_runner=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Lathe Runner");
    info!(
        "Loaded configuration: backend={}, engine={}, gpu_id={}",
        config.backend.url, config.docker.engine, config.general.gpu_id
    );

    for dir in [&config.docker.work_dir, &config.docker.cache_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.backend.timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;
    let backend: Arc<dyn Backend> = Arc::new(BackendClient::with_client(
        config.backend.url.clone(),
        config.backend.user.clone(),
        config.backend.password.clone(),
        http,
    ));

    let mut launcher = Launcher::new(&config, backend, RunnerRegistry::with_builtin());

    tokio::select! {
        result = launcher.run(cli.continuous) => {
            let reports = result?;
            info!("Executed {} job(s), exiting", reports.len());
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
        }
    }

    Ok(())
}
