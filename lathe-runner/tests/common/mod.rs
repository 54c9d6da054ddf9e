//! Shared fixtures for the runner integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use lathe_core::domain::docker::DockerImageSpec;
use lathe_core::domain::job::{Job, TemplateRef};
use lathe_core::domain::log::LogEntry;
use lathe_core::domain::node::Node;
use lathe_core::domain::template::{Template, TemplateParameter};
use lathe_runner::artifact::Compression;
use lathe_runner::backend::MemoryBackend;
use lathe_runner::container::{ContainerRunner, ContainerSettings, ExecOptions};
use lathe_runner::context::JobContext;
use lathe_runner::executor::{ExecutorEnv, ExecutorSettings, JobRunner, RunError};
use lathe_runner::node::NodeIdentity;
use serde_json::{Value, json};

pub const JOB_PK: i64 = 42;
pub const TEMPLATE_PK: i64 = 1;
pub const CPU_IMAGE_PK: i64 = 7;
pub const GPU_IMAGE_PK: i64 = 8;
pub const NODE_PK: i64 = 1;

pub fn cpu_image() -> DockerImageSpec {
    DockerImageSpec {
        pk: CPU_IMAGE_PK,
        name: "trainer-cpu".to_string(),
        version: "1.0".to_string(),
        url: "registry.example.com/trainer-cpu:1.0".to_string(),
        registry_url: "registry.example.com".to_string(),
        registry_username: None,
        registry_password: None,
        cpu: true,
        cuda_version: None,
        min_hardware_generation: None,
    }
}

pub fn gpu_image() -> DockerImageSpec {
    DockerImageSpec {
        pk: GPU_IMAGE_PK,
        name: "trainer-gpu".to_string(),
        cpu: false,
        url: "registry.example.com/trainer-gpu:1.0".to_string(),
        ..cpu_image()
    }
}

fn parameter(default: Option<Value>) -> TemplateParameter {
    TemplateParameter {
        default,
        default_type: None,
        types: vec![],
        help: String::new(),
    }
}

/// `Train` template running `train --epochs <epochs>` in image `image_pk`
pub fn template(pk: i64, contract: &str, image_pk: i64) -> Template {
    let mut parameters = HashMap::new();
    parameters.insert("docker_image".to_string(), parameter(Some(json!(image_pk))));
    parameters.insert(
        "body".to_string(),
        parameter(Some(json!("train --epochs ${epochs} ${+verbose:--verbose}"))),
    );
    parameters.insert("epochs".to_string(), parameter(Some(json!(3))));
    parameters.insert("verbose".to_string(), parameter(Some(json!(false))));

    Template {
        pk,
        name: format!("template-{}", pk),
        version: 1,
        contract: contract.to_string(),
        parameters,
        description: String::new(),
    }
}

pub fn pending_job(pk: i64, template: i64) -> Job {
    Job {
        pk,
        template: TemplateRef {
            pk: template,
            name: None,
        },
        input_values: Default::default(),
        parameter_values: Default::default(),
        node: None,
        start_time: None,
        end_time: None,
        error_reason: None,
        is_cancelled: false,
        docker_image: None,
    }
}

pub fn node_record(pk: i64, ip: &str) -> Node {
    Node {
        pk,
        ip: ip.to_string(),
        index: 0,
        driver_version: None,
        hardware_generation: None,
        gpu_mem: None,
        cpu_mem: None,
        last_seen: None,
        current_job: None,
    }
}

/// Backend holding job 42, a CPU-only `Train` template and node 1
pub fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.insert_docker_image(cpu_image());
    backend.insert_docker_image(gpu_image());
    backend.insert_template(template(TEMPLATE_PK, "Train<ImageClassification>", CPU_IMAGE_PK));
    backend.insert_job(pending_job(JOB_PK, TEMPLATE_PK));
    backend.insert_node(node_record(NODE_PK, "10.0.0.5"));
    backend
}

pub fn executor_settings(work_dir: &Path) -> ExecutorSettings {
    ExecutorSettings {
        work_dir: work_dir.join("work"),
        cache_dir: work_dir.join("cache"),
        keep_job_dirs: false,
        cancel_check_wait: Duration::from_secs(30),
        compression: Compression::Deflated,
        use_sudo: false,
        ask_sudo_pw: false,
    }
}

/// Container settings with a stand-in engine executable
pub fn container_settings(engine: &str) -> ContainerSettings {
    ContainerSettings {
        engine: engine.to_string(),
        use_sudo: false,
        ask_sudo_pw: false,
        use_current_user: false,
        gpu_id: 0,
        additional_gpu_flags: vec![],
    }
}

/// Executor environment for node 1, with `work` and `cache` created below
/// `root`
pub fn env(backend: &MemoryBackend, root: &Path, engine: &str) -> Arc<ExecutorEnv> {
    let settings = executor_settings(root);
    std::fs::create_dir_all(&settings.work_dir).unwrap();
    std::fs::create_dir_all(&settings.cache_dir).unwrap();

    Arc::new(ExecutorEnv {
        backend: Arc::new(backend.clone()),
        containers: Arc::new(ContainerRunner::new(container_settings(engine))),
        settings,
        node: NodeIdentity {
            pk: NODE_PK,
            ip: "10.0.0.5".to_string(),
            gpu_id: 0,
        },
    })
}

/// Runner counting its invocations
pub struct CountingRunner {
    pub calls: Arc<AtomicUsize>,
    pub fail: bool,
}

impl CountingRunner {
    pub fn new(fail: bool) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
                fail,
            },
            calls,
        )
    }
}

#[async_trait]
impl JobRunner for CountingRunner {
    async fn do_run(&self, ctx: &mut JobContext, _: &ContainerRunner) -> Result<(), RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.log_info("counting runner invoked");
        if self.fail {
            return Err(RunError::Failed(anyhow!("model diverged")));
        }
        Ok(())
    }
}

/// Runner executing a shell script through the container runner
pub struct ShellRunner {
    pub script: String,
}

#[async_trait]
impl JobRunner for ShellRunner {
    async fn do_run(
        &self,
        ctx: &mut JobContext,
        containers: &ContainerRunner,
    ) -> Result<(), RunError> {
        let cmd = vec!["sh".to_string(), "-c".to_string(), self.script.clone()];
        containers
            .execute(ctx, cmd, ExecOptions::default())
            .await
            .check("Script")
    }
}

pub fn count(calls: &AtomicUsize) -> usize {
    calls.load(Ordering::SeqCst)
}

/// Decodes the structured log uploaded for a job
pub fn uploaded_log(backend: &MemoryBackend, job: i64) -> Vec<LogEntry> {
    let output = backend
        .outputs()
        .into_iter()
        .find(|output| output.job == job && output.name == "log")
        .expect("log was uploaded");
    assert_eq!(output.output_type, "json");

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(output.data)).unwrap();
    let mut entry = archive.by_name("log.json").unwrap();
    let mut json = String::new();
    entry.read_to_string(&mut json).unwrap();
    serde_json::from_str(&json).unwrap()
}
