//! In-process backend
//!
//! Keeps jobs, templates, images and nodes in memory and applies the same
//! filter and ownership rules as the server. Used by the test suites to
//! drive the poller and executor without a network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use lathe_core::domain::docker::DockerImageSpec;
use lathe_core::domain::hardware::HardwareGeneration;
use lathe_core::domain::job::Job;
use lathe_core::domain::node::Node;
use lathe_core::domain::template::Template;
use lathe_core::dto::filter::FilterSpec;
use lathe_core::dto::node::NodeUpdate;
use serde_json::{Map, Value};

use super::Backend;
use crate::executor::spec::docker_image_pk;

/// An output uploaded to a job
#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub job: i64,
    pub name: String,
    pub output_type: String,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<i64, Job>,
    templates: HashMap<i64, Template>,
    images: HashMap<i64, DockerImageSpec>,
    generations: Vec<HardwareGeneration>,
    nodes: BTreeMap<i64, Node>,
    outputs: Vec<StoredOutput>,
    progress: Vec<(i64, f64)>,
    calls: Vec<String>,
    failing: HashSet<String>,
}

impl State {
    /// Job JSON with the template and docker image expanded, the way the
    /// server evaluates filters against it
    fn expanded(&self, job: &Job) -> Value {
        let mut value = serde_json::to_value(job).unwrap_or(Value::Null);
        if let Some(object) = value.as_object_mut() {
            if let Some(template) = self.templates.get(&job.template.pk) {
                let mut template_value = serde_json::to_value(template).unwrap_or(Value::Null);
                if let Some(template_object) = template_value.as_object_mut() {
                    template_object.insert("pk".to_string(), Value::from(job.template.pk));
                }
                object.insert("template".to_string(), template_value);
            }

            let image = job.docker_image.clone().or_else(|| {
                let pk = docker_image_pk(job, self.templates.get(&job.template.pk))?;
                self.images.get(&pk).cloned()
            });
            if let Some(image) = image {
                object.insert(
                    "docker_image".to_string(),
                    serde_json::to_value(image).unwrap_or(Value::Null),
                );
            }
        }
        value
    }

    fn job_mut(&mut self, pk: i64) -> Result<&mut Job> {
        self.jobs.get_mut(&pk).ok_or_else(|| anyhow!("job {} not found", pk))
    }
}

/// Shared in-memory backend; clones see the same state
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a call and fails it if the operation was marked failing
    fn call(&self, operation: &str, pk: Option<i64>) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(match pk {
            Some(pk) => format!("{}:{}", operation, pk),
            None => operation.to_string(),
        });
        if state.failing.contains(operation) {
            bail!("{} failed: backend unavailable", operation);
        }
        Ok(state)
    }

    pub fn insert_job(&self, job: Job) {
        self.state().jobs.insert(job.pk, job);
    }

    pub fn insert_template(&self, template: Template) {
        self.state().templates.insert(template.pk, template);
    }

    pub fn insert_docker_image(&self, image: DockerImageSpec) {
        self.state().images.insert(image.pk, image);
    }

    pub fn insert_generation(&self, generation: HardwareGeneration) {
        self.state().generations.push(generation);
    }

    pub fn insert_node(&self, node: Node) {
        self.state().nodes.insert(node.pk, node);
    }

    /// Makes every later call of `operation` fail
    pub fn fail(&self, operation: &str) {
        self.state().failing.insert(operation.to_string());
    }

    pub fn recover(&self, operation: &str) {
        self.state().failing.remove(operation);
    }

    /// Flags a job as cancelled by its owner
    pub fn cancel_job(&self, pk: i64) {
        if let Some(job) = self.state().jobs.get_mut(&pk) {
            job.is_cancelled = true;
        }
    }

    pub fn job(&self, pk: i64) -> Option<Job> {
        self.state().jobs.get(&pk).cloned()
    }

    pub fn node(&self, pk: i64) -> Option<Node> {
        self.state().nodes.get(&pk).cloned()
    }

    pub fn outputs(&self) -> Vec<StoredOutput> {
        self.state().outputs.clone()
    }

    pub fn progress_reports(&self) -> Vec<(i64, f64)> {
        self.state().progress.clone()
    }

    /// Every call made so far, as `operation` or `operation:pk`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.state()
            .calls
            .iter()
            .filter(|call| *call == operation || call.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_jobs(&self, filter: &FilterSpec) -> Result<Vec<Job>> {
        let state = self.call("list_jobs", None)?;
        Ok(state
            .jobs
            .values()
            .filter(|job| filter.matches(&state.expanded(job)))
            .cloned()
            .collect())
    }

    async fn retrieve_job(&self, pk: i64) -> Result<Job> {
        let state = self.call("retrieve_job", Some(pk))?;
        state.jobs.get(&pk).cloned().ok_or_else(|| anyhow!("job {} not found", pk))
    }

    async fn retrieve_template(&self, pk: i64) -> Result<Template> {
        let state = self.call("retrieve_template", Some(pk))?;
        state
            .templates
            .get(&pk)
            .cloned()
            .ok_or_else(|| anyhow!("job template {} not found", pk))
    }

    async fn retrieve_docker_image(&self, pk: i64) -> Result<DockerImageSpec> {
        let state = self.call("retrieve_docker_image", Some(pk))?;
        state
            .images
            .get(&pk)
            .cloned()
            .ok_or_else(|| anyhow!("docker image {} not found", pk))
    }

    async fn list_hardware_generations(&self) -> Result<Vec<HardwareGeneration>> {
        let state = self.call("list_hardware_generations", None)?;
        Ok(state.generations.clone())
    }

    async fn acquire_job(&self, pk: i64, node: i64) -> Result<Job> {
        let mut state = self.call("acquire_job", Some(pk))?;
        let job = state.job_mut(pk)?;
        if let Some(owner) = job.node {
            bail!("job {} is already acquired by node {}", pk, owner);
        }
        job.node = Some(node);
        let job = job.clone();
        if let Some(record) = state.nodes.get_mut(&node) {
            record.current_job = Some(pk);
        }
        Ok(job)
    }

    async fn start_job(&self, pk: i64, _notification: &str) -> Result<Job> {
        let mut state = self.call("start_job", Some(pk))?;
        let job = state.job_mut(pk)?;
        if job.node.is_none() {
            bail!("job {} has not been acquired", pk);
        }
        if job.start_time.is_some() {
            bail!("job {} has already started", pk);
        }
        job.start_time = Some(chrono::Utc::now());
        Ok(job.clone())
    }

    async fn progress_job(&self, pk: i64, progress: f64, _metadata: Map<String, Value>) -> Result<()> {
        let mut state = self.call("progress_job", Some(pk))?;
        state.job_mut(pk)?;
        state.progress.push((pk, progress));
        Ok(())
    }

    async fn finish_job(
        &self,
        pk: i64,
        success: bool,
        _notification: &str,
        error: Option<&str>,
    ) -> Result<Job> {
        let mut state = self.call("finish_job", Some(pk))?;
        let job = state.job_mut(pk)?;
        job.end_time = Some(chrono::Utc::now());
        job.error_reason = if success { None } else { error.map(str::to_string) };
        let job = job.clone();
        for node in state.nodes.values_mut() {
            if node.current_job == Some(pk) {
                node.current_job = None;
            }
        }
        Ok(job)
    }

    async fn reset_job(&self, pk: i64) -> Result<Job> {
        let mut state = self.call("reset_job", Some(pk))?;
        let job = state.job_mut(pk)?;
        job.start_time = None;
        job.end_time = None;
        job.error_reason = None;
        Ok(job.clone())
    }

    async fn release_job(&self, pk: i64) -> Result<Job> {
        let mut state = self.call("release_job", Some(pk))?;
        let job = state.job_mut(pk)?;
        job.node = None;
        Ok(job.clone())
    }

    async fn add_output(&self, pk: i64, name: &str, output_type: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.call("add_output", Some(pk))?;
        state.job_mut(pk)?;
        state.outputs.push(StoredOutput {
            job: pk,
            name: name.to_string(),
            output_type: output_type.to_string(),
            data,
        });
        Ok(())
    }

    async fn list_nodes(&self, filter: &FilterSpec) -> Result<Vec<Node>> {
        let state = self.call("list_nodes", None)?;
        Ok(state
            .nodes
            .values()
            .filter(|node| filter.matches(&serde_json::to_value(node).unwrap_or(Value::Null)))
            .cloned()
            .collect())
    }

    async fn create_node(&self, update: &NodeUpdate) -> Result<Node> {
        let mut state = self.call("create_node", None)?;
        let pk = state.nodes.keys().next_back().map_or(1, |last| last + 1);
        let node = Node {
            pk,
            ip: update.ip.clone(),
            index: update.index,
            driver_version: update.driver_version.clone(),
            hardware_generation: update.hardware_generation,
            gpu_mem: update.gpu_mem,
            cpu_mem: update.cpu_mem,
            last_seen: Some(chrono::Utc::now()),
            current_job: None,
        };
        state.nodes.insert(pk, node.clone());
        Ok(node)
    }

    async fn update_node(&self, pk: i64, update: &NodeUpdate) -> Result<Node> {
        let mut state = self.call("update_node", Some(pk))?;
        let node = state
            .nodes
            .get_mut(&pk)
            .ok_or_else(|| anyhow!("node {} not found", pk))?;
        node.ip = update.ip.clone();
        node.index = update.index;
        node.driver_version = update.driver_version.clone();
        node.hardware_generation = update.hardware_generation;
        node.gpu_mem = update.gpu_mem;
        node.cpu_mem = update.cpu_mem;
        node.last_seen = Some(chrono::Utc::now());
        Ok(node.clone())
    }

    async fn ping_node(&self, pk: i64) -> Result<()> {
        let mut state = self.call("ping_node", Some(pk))?;
        let node = state
            .nodes
            .get_mut(&pk)
            .ok_or_else(|| anyhow!("node {} not found", pk))?;
        node.last_seen = Some(chrono::Utc::now());
        Ok(())
    }
}
