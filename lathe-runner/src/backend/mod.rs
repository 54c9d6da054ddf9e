//! Backend access
//!
//! Everything the agent asks of the job backend goes through the
//! [`Backend`] trait so the poller and executor can be driven against an
//! in-process backend in tests. [`BackendClient`] is the HTTP
//! implementation used in production.

#[cfg(any(test, feature = "test-util"))]
mod memory;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBackend;

use anyhow::Result;
use async_trait::async_trait;
use lathe_client::BackendClient;
use lathe_core::domain::docker::DockerImageSpec;
use lathe_core::domain::hardware::HardwareGeneration;
use lathe_core::domain::job::Job;
use lathe_core::domain::node::Node;
use lathe_core::domain::template::Template;
use lathe_core::dto::filter::FilterSpec;
use lathe_core::dto::job::{FinishJob, ProgressUpdate};
use lathe_core::dto::node::NodeUpdate;
use serde_json::{Map, Value};

/// Notification type requested on start and finish
pub const NOTIFICATION: &str = "email";

#[async_trait]
pub trait Backend: Send + Sync {
    /// Lists jobs matching a server-side filter
    async fn list_jobs(&self, filter: &FilterSpec) -> Result<Vec<Job>>;

    async fn retrieve_job(&self, pk: i64) -> Result<Job>;

    async fn retrieve_template(&self, pk: i64) -> Result<Template>;

    async fn retrieve_docker_image(&self, pk: i64) -> Result<DockerImageSpec>;

    async fn list_hardware_generations(&self) -> Result<Vec<HardwareGeneration>>;

    /// Claims a job for a node; fails if another node got there first
    ///
    /// # Arguments
    /// * `pk` - The job to claim
    /// * `node` - The claiming node
    async fn acquire_job(&self, pk: i64, node: i64) -> Result<Job>;

    async fn start_job(&self, pk: i64, notification: &str) -> Result<Job>;

    /// Reports progress of a running job
    ///
    /// # Arguments
    /// * `pk` - The running job
    /// * `progress` - Fraction complete, between 0 and 1
    /// * `metadata` - Free-form details shown next to the progress
    async fn progress_job(&self, pk: i64, progress: f64, metadata: Map<String, Value>) -> Result<()>;

    async fn finish_job(
        &self,
        pk: i64,
        success: bool,
        notification: &str,
        error: Option<&str>,
    ) -> Result<Job>;

    async fn reset_job(&self, pk: i64) -> Result<Job>;

    async fn release_job(&self, pk: i64) -> Result<Job>;

    /// Attaches a named binary output to a job
    async fn add_output(&self, pk: i64, name: &str, output_type: &str, data: Vec<u8>) -> Result<()>;

    async fn list_nodes(&self, filter: &FilterSpec) -> Result<Vec<Node>>;

    async fn create_node(&self, node: &NodeUpdate) -> Result<Node>;

    async fn update_node(&self, pk: i64, node: &NodeUpdate) -> Result<Node>;

    async fn ping_node(&self, pk: i64) -> Result<()>;
}

#[async_trait]
impl Backend for BackendClient {
    async fn list_jobs(&self, filter: &FilterSpec) -> Result<Vec<Job>> {
        Ok(BackendClient::list_jobs(self, filter).await?)
    }

    async fn retrieve_job(&self, pk: i64) -> Result<Job> {
        Ok(BackendClient::retrieve_job(self, pk).await?)
    }

    async fn retrieve_template(&self, pk: i64) -> Result<Template> {
        Ok(BackendClient::retrieve_template(self, pk).await?)
    }

    async fn retrieve_docker_image(&self, pk: i64) -> Result<DockerImageSpec> {
        Ok(BackendClient::retrieve_docker_image(self, pk).await?)
    }

    async fn list_hardware_generations(&self) -> Result<Vec<HardwareGeneration>> {
        Ok(BackendClient::list_hardware_generations(self).await?)
    }

    async fn acquire_job(&self, pk: i64, node: i64) -> Result<Job> {
        Ok(BackendClient::acquire_job(self, pk, node).await?)
    }

    async fn start_job(&self, pk: i64, notification: &str) -> Result<Job> {
        Ok(BackendClient::start_job(self, pk, notification).await?)
    }

    async fn progress_job(&self, pk: i64, progress: f64, metadata: Map<String, Value>) -> Result<()> {
        let update = ProgressUpdate { progress, metadata };
        Ok(BackendClient::progress_job(self, pk, &update).await?)
    }

    async fn finish_job(
        &self,
        pk: i64,
        success: bool,
        notification: &str,
        error: Option<&str>,
    ) -> Result<Job> {
        let request = FinishJob {
            success,
            send_notification: notification.to_string(),
            error: error.map(str::to_string),
        };
        Ok(BackendClient::finish_job(self, pk, &request).await?)
    }

    async fn reset_job(&self, pk: i64) -> Result<Job> {
        Ok(BackendClient::reset_job(self, pk).await?)
    }

    async fn release_job(&self, pk: i64) -> Result<Job> {
        Ok(BackendClient::release_job(self, pk).await?)
    }

    async fn add_output(&self, pk: i64, name: &str, output_type: &str, data: Vec<u8>) -> Result<()> {
        Ok(BackendClient::add_output(self, pk, name, output_type, data).await?)
    }

    async fn list_nodes(&self, filter: &FilterSpec) -> Result<Vec<Node>> {
        Ok(BackendClient::list_nodes(self, filter).await?)
    }

    async fn create_node(&self, node: &NodeUpdate) -> Result<Node> {
        Ok(BackendClient::create_node(self, node).await?)
    }

    async fn update_node(&self, pk: i64, node: &NodeUpdate) -> Result<Node> {
        Ok(BackendClient::update_node(self, pk, node).await?)
    }

    async fn ping_node(&self, pk: i64) -> Result<()> {
        Ok(BackendClient::ping_node(self, pk).await?)
    }
}
