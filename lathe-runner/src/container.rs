//! Container engine invocations
//!
//! Drives `docker` (or a compatible engine such as `podman`) as a
//! subprocess:
//! - Logging into registries and pulling images
//! - Selecting GPU flags from the engine version
//! - Running images with volumes and the current user
//! - Streaming output while watching for cancellation
//!
//! Every invocation is recorded in the job's structured log with secrets
//! replaced by `***`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use lathe_core::domain::docker::DockerImageSpec;
use lathe_core::domain::log::CommandRecord;
use lathe_core::domain::version::Version;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{OnceCell, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::context::JobContext;
use crate::executor::RunError;
use crate::progress::ProgressParser;

/// Line appended to the output of a command killed by cancellation
pub const CANCELLED_MARKER: &str = "Job was cancelled";

/// Exit code used when a command could not run to completion
pub const FAILED_EXIT_CODE: i32 = 255;

const MASK: &str = "***";
const VERSION_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_CANCEL_TICK: Duration = Duration::from_millis(250);

/// First engine version that understands `--gpus`
const GPUS_FLAG_VERSION: [u64; 2] = [19, 3];

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Engine executable, e.g. `docker` or `podman`
    pub engine: String,
    pub use_sudo: bool,
    /// Run `sudo -S` and let sudo prompt on the terminal
    pub ask_sudo_pw: bool,
    /// Run containers as the invoking user instead of root
    pub use_current_user: bool,
    pub gpu_id: u32,
    pub additional_gpu_flags: Vec<String>,
}

/// Outcome of one external command
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The command line, secrets masked
    pub cmd: Vec<String>,
    pub returncode: i32,
    /// Merged stdout and stderr, secrets masked
    pub output: Vec<String>,
    pub cancelled: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.cancelled && self.returncode == 0
    }

    /// Converts the result for use inside a job runner
    ///
    /// # Arguments
    /// * `what` - Short description used in the error message
    pub fn check(&self, what: &str) -> Result<(), RunError> {
        if self.cancelled {
            return Err(RunError::Cancelled);
        }
        if self.returncode != 0 {
            return Err(RunError::Failed(anyhow!(
                "{} failed with return code {}: {}",
                what,
                self.returncode,
                self.cmd.join(" ")
            )));
        }
        Ok(())
    }
}

/// Per-invocation options of [`ContainerRunner::execute`]
#[derive(Default, Clone, Copy)]
pub struct ExecOptions<'a> {
    /// Never prefix with sudo
    pub no_sudo: bool,
    /// Written to the process' stdin, which is then closed
    pub stdin: Option<&'a str>,
    /// Command-line arguments masked when equal to one of these
    pub hide: &'a [&'a str],
    /// Masked wherever it occurs in the command line and output
    pub secret: Option<&'a str>,
    pub parser: Option<&'a dyn ProgressParser>,
}

enum Exit {
    Code(i32),
    Cancelled,
}

pub struct ContainerRunner {
    settings: ContainerSettings,
    version: OnceCell<Option<Version>>,
}

impl ContainerRunner {
    pub fn new(settings: ContainerSettings) -> Self {
        Self {
            settings,
            version: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    /// Whether secrets can be passed on stdin
    ///
    /// Not when sudo prompts for its password, since the prompt owns stdin.
    pub fn can_use_stdin(&self, no_sudo: bool) -> bool {
        !(self.settings.use_sudo && self.settings.ask_sudo_pw && !no_sudo)
    }

    // =============================================================================
    // Engine version and GPU flags
    // =============================================================================

    /// The engine's version, queried once and cached
    pub async fn engine_version(&self) -> Option<Version> {
        self.version
            .get_or_init(|| self.query_version())
            .await
            .clone()
    }

    async fn query_version(&self) -> Option<Version> {
        let output = tokio::time::timeout(
            VERSION_TIMEOUT,
            Command::new(&self.settings.engine)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                let version = parse_engine_version(&text);
                info!("Container engine: {} (version {:?})", text.trim(), version.as_ref().map(Version::to_string));
                version
            }
            Ok(Ok(output)) => {
                warn!(
                    "'{} --version' exited with {}",
                    self.settings.engine, output.status
                );
                None
            }
            Ok(Err(e)) => {
                warn!("Failed to run '{} --version': {}", self.settings.engine, e);
                None
            }
            Err(_) => {
                warn!("'{} --version' timed out", self.settings.engine);
                None
            }
        }
    }

    /// Flags giving a container access to the configured GPU
    ///
    /// Empty for CPU-only images.
    pub async fn gpu_flags(&self, image: &DockerImageSpec) -> Vec<String> {
        if image.cpu {
            return Vec::new();
        }

        let version = self.engine_version().await;
        let mut flags = gpu_flags_for(version.as_ref(), self.settings.gpu_id);
        flags.extend(self.settings.additional_gpu_flags.iter().cloned());
        flags
    }

    // =============================================================================
    // Registry and images
    // =============================================================================

    /// Logs into a registry
    ///
    /// # Arguments
    /// * `ctx` - Job context receiving the command record
    /// * `registry` - Registry host; empty for the engine's default
    /// * `username` - Registry user
    /// * `password` - Registry password, sent on stdin when possible
    pub async fn login(
        &self,
        ctx: &mut JobContext,
        registry: &str,
        username: &str,
        password: &str,
    ) -> ExecResult {
        let mut cmd = self.command(&["login", "-u", username]);
        let hide = [username, password];
        let use_stdin = self.can_use_stdin(false);

        if use_stdin {
            cmd.push("--password-stdin".to_string());
        } else {
            cmd.push("-p".to_string());
            cmd.push(password.to_string());
        }
        if !registry.is_empty() {
            cmd.push(registry.to_string());
        }

        let options = ExecOptions {
            stdin: use_stdin.then_some(password),
            hide: &hide,
            secret: Some(password),
            ..Default::default()
        };
        self.execute(ctx, cmd, options).await
    }

    pub async fn logout(&self, ctx: &mut JobContext, registry: &str) -> ExecResult {
        let mut cmd = self.command(&["logout"]);
        if !registry.is_empty() {
            cmd.push(registry.to_string());
        }
        self.execute(ctx, cmd, ExecOptions::default()).await
    }

    pub async fn pull(&self, ctx: &mut JobContext, image: &DockerImageSpec) -> ExecResult {
        let cmd = self.command(&["pull", &image.url]);
        self.execute(ctx, cmd, ExecOptions::default()).await
    }

    /// Runs an image to completion
    ///
    /// # Arguments
    /// * `ctx` - Job context for logging, progress and cancellation
    /// * `image` - Image to run; decides whether GPU flags are added
    /// * `docker_args` - Extra engine arguments placed before the image
    /// * `volumes` - `host:container` mounts
    /// * `image_args` - Arguments passed to the image's entrypoint
    /// * `parser` - Optional progress parser fed every output line
    pub async fn run(
        &self,
        ctx: &mut JobContext,
        image: &DockerImageSpec,
        docker_args: &[String],
        volumes: &[String],
        image_args: &[String],
        parser: Option<&dyn ProgressParser>,
    ) -> ExecResult {
        let mut cmd = self.command(&["run", "--rm"]);
        cmd.extend(self.gpu_flags(image).await);

        if self.settings.use_current_user {
            match current_user() {
                Ok((uid, gid, name)) => {
                    cmd.push("-u".to_string());
                    cmd.push(format!("{}:{}", uid, gid));
                    cmd.push("-e".to_string());
                    cmd.push(format!("USER={}", name));
                }
                Err(e) => ctx.log_warning(format!("Running container as image user: {:#}", e)),
            }
        }

        for volume in volumes {
            cmd.push("-v".to_string());
            cmd.push(volume.clone());
        }

        cmd.extend(docker_args.iter().cloned());
        cmd.push(image.url.clone());
        cmd.extend(image_args.iter().cloned());

        let options = ExecOptions {
            parser,
            ..Default::default()
        };
        self.execute(ctx, cmd, options).await
    }

    fn command(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.settings.engine.as_str())
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    // =============================================================================
    // Execution
    // =============================================================================

    /// Runs a command, streaming its output into the job log
    ///
    /// stdout and stderr are merged line by line. Until the process exits
    /// the job's cancellation flag is checked between lines and on every
    /// tick; a cancelled job has its process killed and gets exit code 255
    /// with [`CANCELLED_MARKER`] appended to the output. Spawn and I/O
    /// failures also yield 255.
    pub async fn execute(
        &self,
        ctx: &mut JobContext,
        cmd: Vec<String>,
        options: ExecOptions<'_>,
    ) -> ExecResult {
        let mut argv = Vec::with_capacity(cmd.len() + 2);
        let sudo = self.settings.use_sudo && !options.no_sudo;
        if sudo {
            argv.push("sudo".to_string());
            if self.settings.ask_sudo_pw {
                argv.push("-S".to_string());
            }
        }
        argv.extend(cmd);

        let shown = mask_args(&argv, options.hide, options.secret);
        debug!("Job {}: executing {}", ctx.job_pk(), shown.join(" "));

        let prompt = sudo && self.settings.ask_sudo_pw;
        let mut output = Vec::new();
        let (returncode, cancelled) = match supervise(ctx, &argv, &options, prompt, &mut output).await {
            Ok(Exit::Code(code)) => (code, false),
            Ok(Exit::Cancelled) => (FAILED_EXIT_CODE, true),
            Err(e) => {
                output.push(format!("{:#}", e));
                (FAILED_EXIT_CODE, false)
            }
        };

        let output: Vec<String> = output.iter().map(|line| mask(line, options.secret)).collect();
        ctx.log_command(CommandRecord {
            cmd: shown.clone(),
            returncode,
            output: output.clone(),
        });

        ExecResult {
            cmd: shown,
            returncode,
            output,
            cancelled,
        }
    }
}

async fn supervise(
    ctx: &mut JobContext,
    argv: &[String],
    options: &ExecOptions<'_>,
    sudo_prompt: bool,
    output: &mut Vec<String>,
) -> Result<Exit> {
    let (program, args) = argv.split_first().context("Empty command line")?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if options.stdin.is_some() {
        command.stdin(Stdio::piped());
    } else if sudo_prompt {
        command.stdin(Stdio::inherit());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to start '{}'", program))?;

    if let (Some(input), Some(mut stdin)) = (options.stdin, child.stdin.take()) {
        // A process may exit without reading its input
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e).context("Failed to write to stdin");
            }
        }
    }

    let (tx, mut rx) = mpsc::channel(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    let mut ticker = tokio::time::interval(ctx.settings().cancel_check_wait.max(MIN_CANCEL_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut parser = options.parser;
    let mut last = 0.0;
    let mut open = true;

    // Output may close before the process exits
    loop {
        if ctx.is_cancelled(false).await {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill '{}': {}", program, e);
            }
            output.push(CANCELLED_MARKER.to_string());
            return Ok(Exit::Cancelled);
        }

        tokio::select! {
            line = rx.recv(), if open => {
                let Some(line) = line else {
                    open = false;
                    continue;
                };
                if let Some(active) = parser {
                    match active.parse(&line, last) {
                        Ok(progress) if !progress.fraction.is_finite() => {}
                        Ok(progress) => {
                            if progress.fraction != last || !progress.metadata.is_empty() {
                                last = progress.fraction;
                                ctx.report_progress(progress.fraction, progress.metadata).await;
                            }
                        }
                        Err(e) => {
                            ctx.log_warning(format!("Progress parsing disabled: {:#}", e));
                            parser = None;
                        }
                    }
                }
                output.push(line);
            }
            status = child.wait(), if !open => {
                let status = status.context("Failed to wait for process")?;
                return Ok(Exit::Code(status.code().unwrap_or(FAILED_EXIT_CODE)));
            }
            _ = ticker.tick() => {}
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Replaces every occurrence of a non-empty secret in `text` with `***`
pub fn mask(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => text.replace(secret, MASK),
        _ => text.to_string(),
    }
}

/// Masks a command line for logging
///
/// Arguments equal to a hidden value are replaced as a whole; the secret
/// is also masked inside other arguments.
pub fn mask_args(argv: &[String], hide: &[&str], secret: Option<&str>) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            if !arg.is_empty() && hide.contains(&arg.as_str()) {
                MASK.to_string()
            } else {
                mask(arg, secret)
            }
        })
        .collect()
}

/// Extracts `major.minor` from `docker --version` style output
///
/// `"Docker version 20.10.7, build f0df350"` gives `20.10`.
pub fn parse_engine_version(text: &str) -> Option<Version> {
    let (_, rest) = text.split_once("version")?;
    let token = rest
        .split(|c: char| c == ',' || c.is_whitespace())
        .find(|token| !token.is_empty())?;
    let numeric = token.split(['-', '+', '~']).next()?;
    numeric.parse::<Version>().ok().map(|version| version.truncated(2))
}

/// GPU flags for an engine version
///
/// Engines from 19.03 on take `--gpus`; older ones need the nvidia
/// runtime. An unknown version is treated as current.
pub fn gpu_flags_for(version: Option<&Version>, gpu_id: u32) -> Vec<String> {
    let modern = version.is_none_or(|v| *v >= Version::new(GPUS_FLAG_VERSION.to_vec()));
    if modern {
        vec![format!("--gpus=device={}", gpu_id)]
    } else {
        vec!["--runtime=nvidia".to_string()]
    }
}

/// uid, gid and login name of the agent process
fn current_user() -> Result<(u32, u32, String)> {
    use std::os::unix::fs::MetadataExt;

    let metadata = std::fs::metadata(Path::new("/proc/self"))
        .context("Failed to determine the current user")?;
    let (uid, gid) = (metadata.uid(), metadata.gid());
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| uid.to_string());
    Ok((uid, gid, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Compression;
    use crate::backend::MemoryBackend;
    use crate::executor::ExecutorSettings;
    use crate::executor::spec::JobSpec;
    use crate::progress::PercentProgressParser;
    use lathe_core::domain::job::{Job, TemplateRef};
    use lathe_core::domain::template::Template;
    use std::sync::Arc;

    fn settings(engine: &str) -> ContainerSettings {
        ContainerSettings {
            engine: engine.to_string(),
            use_sudo: false,
            ask_sudo_pw: false,
            use_current_user: false,
            gpu_id: 1,
            additional_gpu_flags: vec!["--shm-size=8g".to_string()],
        }
    }

    fn context(backend: &MemoryBackend, work_dir: &Path) -> JobContext {
        context_with_wait(backend, work_dir, Duration::from_secs(30))
    }

    fn context_with_wait(backend: &MemoryBackend, work_dir: &Path, wait: Duration) -> JobContext {
        let job = Job {
            pk: 11,
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
        backend.insert_job(job.clone());
        let template = Template {
            pk: 1,
            name: "t".to_string(),
            version: 1,
            contract: "Train".to_string(),
            parameters: Default::default(),
            description: String::new(),
        };
        let settings = ExecutorSettings {
            work_dir: work_dir.to_path_buf(),
            cache_dir: work_dir.to_path_buf(),
            keep_job_dirs: false,
            cancel_check_wait: wait,
            compression: Compression::Deflated,
            use_sudo: false,
            ask_sudo_pw: false,
        };
        JobContext::new(
            Arc::new(JobSpec::build(job, template, None).unwrap()),
            Arc::new(backend.clone()),
            settings,
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_parse_engine_version() {
        let v = |s: &str| parse_engine_version(s).map(|v| v.to_string());
        assert_eq!(v("Docker version 20.10.7, build f0df350").as_deref(), Some("20.10"));
        assert_eq!(v("Docker version 18.09.1-ce, build 4c52b90").as_deref(), Some("18.9"));
        assert_eq!(v("podman version 4.3.1").as_deref(), Some("4.3"));
        assert_eq!(v("garbage"), None);
    }

    #[test]
    fn test_gpu_flags_by_version() {
        let v = |s: &str| s.parse::<Version>().unwrap();
        assert_eq!(gpu_flags_for(Some(&v("19.03")), 0), vec!["--gpus=device=0"]);
        assert_eq!(gpu_flags_for(Some(&v("20.10")), 2), vec!["--gpus=device=2"]);
        assert_eq!(gpu_flags_for(Some(&v("18.09")), 0), vec!["--runtime=nvidia"]);
        assert_eq!(gpu_flags_for(None, 0), vec!["--gpus=device=0"]);
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("-p hunter2", Some("hunter2")), "-p ***");
        assert_eq!(mask("nothing", Some("")), "nothing");
        assert_eq!(mask("nothing", None), "nothing");
    }

    #[test]
    fn test_mask_args_hides_whole_arguments() {
        let argv: Vec<String> = ["docker", "login", "-u", "bob", "-p", "pw1", "bob.example.com/pw1"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        assert_eq!(
            mask_args(&argv, &["bob", "pw1", ""], Some("pw1")),
            vec!["docker", "login", "-u", "***", "-p", "***", "bob.example.com/***"]
        );
    }

    #[test]
    fn test_stdin_policy() {
        let mut s = settings("docker");
        assert!(ContainerRunner::new(s.clone()).can_use_stdin(false));
        s.use_sudo = true;
        assert!(ContainerRunner::new(s.clone()).can_use_stdin(false));
        s.ask_sudo_pw = true;
        let runner = ContainerRunner::new(s);
        assert!(!runner.can_use_stdin(false));
        assert!(runner.can_use_stdin(true));
    }

    #[tokio::test]
    async fn test_execute_merges_output_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        let runner = ContainerRunner::new(settings("docker"));

        let result = runner
            .execute(&mut ctx, sh("echo out; echo err >&2; exit 3"), ExecOptions::default())
            .await;

        assert_eq!(result.returncode, 3);
        assert!(!result.success());
        let mut output = result.output.clone();
        output.sort();
        assert_eq!(output, vec!["err", "out"]);
        let record = ctx.log_entries().last().unwrap().command.clone().unwrap();
        assert_eq!(record.returncode, 3);
        assert_eq!(record.cmd[0], "sh");
    }

    #[tokio::test]
    async fn test_execute_masks_and_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        let runner = ContainerRunner::new(settings("docker"));

        let options = ExecOptions {
            stdin: Some("s3cret"),
            secret: Some("s3cret"),
            ..Default::default()
        };
        let result = runner
            .execute(&mut ctx, sh("read pw; echo got $pw # s3cret"), options)
            .await;

        assert!(result.success());
        assert_eq!(result.output, vec!["got ***"]);
        assert_eq!(result.cmd[2], "read pw; echo got $pw # ***");
    }

    #[tokio::test]
    async fn test_execute_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        let runner = ContainerRunner::new(settings("docker"));

        let options = ExecOptions {
            parser: Some(&PercentProgressParser),
            ..Default::default()
        };
        let result = runner
            .execute(&mut ctx, sh("echo 25%; echo 25%; echo working; echo 100%"), options)
            .await;

        assert!(result.success());
        assert_eq!(backend.progress_reports(), vec![(11, 0.25), (11, 1.0)]);
    }

    #[tokio::test]
    async fn test_execute_kills_cancelled_job() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        backend.cancel_job(11);
        let runner = ContainerRunner::new(settings("docker"));

        let started = std::time::Instant::now();
        let result = runner
            .execute(&mut ctx, sh("sleep 30; echo late"), ExecOptions::default())
            .await;

        assert!(result.cancelled);
        assert_eq!(result.returncode, FAILED_EXIT_CODE);
        assert_eq!(result.output.last().map(String::as_str), Some(CANCELLED_MARKER));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(result.check("run"), Err(RunError::Cancelled)));
    }

    #[tokio::test]
    async fn test_execute_hidden_values_stay_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        let runner = ContainerRunner::new(settings("docker"));

        let options = ExecOptions {
            hide: &["bob"],
            ..Default::default()
        };
        let cmd = ["echo", "bob", "bobcat"].iter().map(|a| a.to_string()).collect();
        let result = runner.execute(&mut ctx, cmd, options).await;

        assert_eq!(result.cmd, vec!["echo", "***", "bobcat"]);
        assert_eq!(result.output, vec!["bob bobcat"]);
    }

    #[tokio::test]
    async fn test_execute_cancelled_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context_with_wait(&backend, dir.path(), Duration::from_millis(250));
        let runner = ContainerRunner::new(settings("docker"));

        let canceller = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel_job(11);
        });

        let started = std::time::Instant::now();
        let result = runner
            .execute(&mut ctx, sh("echo first; sleep 60"), ExecOptions::default())
            .await;

        assert!(result.cancelled);
        assert_eq!(result.returncode, FAILED_EXIT_CODE);
        assert_eq!(result.output, vec!["first", CANCELLED_MARKER]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_execute_cancelled_after_output_closed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context_with_wait(&backend, dir.path(), Duration::from_millis(250));
        let runner = ContainerRunner::new(settings("docker"));

        let canceller = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel_job(11);
        });

        let started = std::time::Instant::now();
        let result = runner
            .execute(&mut ctx, sh("echo closing; exec >&- 2>&-; sleep 60"), ExecOptions::default())
            .await;

        assert!(result.cancelled);
        assert_eq!(result.output, vec!["closing", CANCELLED_MARKER]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_execute_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        let runner = ContainerRunner::new(settings("docker"));

        let result = runner
            .execute(
                &mut ctx,
                vec!["/nonexistent/lathe-engine".to_string()],
                ExecOptions::default(),
            )
            .await;

        assert_eq!(result.returncode, FAILED_EXIT_CODE);
        assert!(!result.cancelled);
        assert!(result.output[0].starts_with("Failed to start"));
    }

    #[tokio::test]
    async fn test_run_builds_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        // `echo` as the engine prints the command line it was given
        let runner = ContainerRunner::new(settings("echo"));
        let image = DockerImageSpec {
            pk: 1,
            name: "cpu".to_string(),
            version: "1".to_string(),
            url: "example.com/cpu:1".to_string(),
            registry_url: String::new(),
            registry_username: None,
            registry_password: None,
            cpu: true,
            cuda_version: None,
            min_hardware_generation: None,
        };

        let result = runner
            .run(
                &mut ctx,
                &image,
                &["--network=none".to_string()],
                &["/tmp/out:/output".to_string()],
                &["train".to_string()],
                None,
            )
            .await;

        assert!(result.success());
        assert_eq!(
            result.output,
            vec!["run --rm -v /tmp/out:/output --network=none example.com/cpu:1 train"]
        );
    }

    #[tokio::test]
    async fn test_login_hides_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        let runner = ContainerRunner::new(settings("echo"));

        let result = runner.login(&mut ctx, "registry.example.com", "bob", "pw123").await;

        assert!(result.success());
        assert_eq!(
            result.cmd,
            vec!["echo", "login", "-u", "***", "--password-stdin", "registry.example.com"]
        );
        assert!(!result.output.iter().any(|line| line.contains("pw123")));
    }

    #[tokio::test]
    async fn test_login_keeps_registry_containing_username() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut ctx = context(&backend, dir.path());
        let runner = ContainerRunner::new(settings("echo"));

        let result = runner.login(&mut ctx, "bob.example.com", "bob", "pw123").await;

        assert_eq!(result.cmd[3], "***");
        assert_eq!(result.cmd[5], "bob.example.com");
        assert_eq!(result.output, vec!["login -u bob --password-stdin bob.example.com"]);
    }
}
