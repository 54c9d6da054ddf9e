//! Job-related API endpoints

use crate::BackendClient;
use crate::error::{ClientError, Result};
use lathe_core::domain::job::Job;
use lathe_core::dto::filter::FilterSpec;
use lathe_core::dto::job::{AcquireJob, FinishJob, ProgressUpdate, StartJob};
use reqwest::{Method, StatusCode};

impl BackendClient {
    // =============================================================================
    // Job Queries
    // =============================================================================

    /// List jobs matching a filter
    ///
    /// # Arguments
    /// * `filter` - Server-side filter restricting the listing
    ///
    /// # Example
    /// ```no_run
    /// # use lathe_client::BackendClient;
    /// # use lathe_core::dto::filter::{FilterExpression, FilterSpec};
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = BackendClient::new("http://localhost:8000", "node", "secret");
    /// let jobs = client
    ///     .list_jobs(&FilterSpec::new(vec![FilterExpression::is_null("start_time")]))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn list_jobs(&self, filter: &FilterSpec) -> Result<Vec<Job>> {
        let response = self
            .request(Method::POST, "v1/jobs/list")
            .json(filter)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a job by primary key
    pub async fn retrieve_job(&self, pk: i64) -> Result<Job> {
        let response = self
            .request(Method::GET, &format!("v1/jobs/{}", pk))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!("job {}", pk)));
        }

        self.handle_response(response).await
    }

    // =============================================================================
    // Job Lifecycle
    // =============================================================================

    /// Claim a pending job for a node
    ///
    /// Only one node can acquire a job. Losing the race surfaces as an API
    /// error from the backend.
    ///
    /// # Arguments
    /// * `pk` - The job to claim
    /// * `node` - The node claiming it
    pub async fn acquire_job(&self, pk: i64, node: i64) -> Result<Job> {
        let response = self
            .request(Method::PATCH, &format!("v1/jobs/{}/acquire", pk))
            .json(&AcquireJob { node })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Mark an acquired job as started
    pub async fn start_job(&self, pk: i64, send_notification: &str) -> Result<Job> {
        let response = self
            .request(Method::POST, &format!("v1/jobs/{}/start", pk))
            .json(&StartJob {
                send_notification: send_notification.to_string(),
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Report progress of a running job
    ///
    /// # Arguments
    /// * `pk` - The running job
    /// * `update` - Fraction complete plus optional metadata
    pub async fn progress_job(&self, pk: i64, update: &ProgressUpdate) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("v1/jobs/{}/progress", pk))
            .json(update)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Complete a job
    ///
    /// # Arguments
    /// * `pk` - The job to finish
    /// * `request` - Outcome, notification type and error message
    pub async fn finish_job(&self, pk: i64, request: &FinishJob) -> Result<Job> {
        let response = self
            .request(Method::POST, &format!("v1/jobs/{}/finish", pk))
            .json(request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Return a finished job to the pending state
    pub async fn reset_job(&self, pk: i64) -> Result<Job> {
        let response = self
            .request(Method::DELETE, &format!("v1/jobs/{}/reset", pk))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Drop the node assignment of a job
    pub async fn release_job(&self, pk: i64) -> Result<Job> {
        let response = self
            .request(Method::DELETE, &format!("v1/jobs/{}/release", pk))
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Job Outputs
    // =============================================================================

    /// Attach a named, typed binary output to a job
    ///
    /// # Arguments
    /// * `pk` - The job the output belongs to
    /// * `name` - Output name (e.g. "log")
    /// * `output_type` - Type name of the output (e.g. "json")
    /// * `data` - Raw bytes of the output
    pub async fn add_output(
        &self,
        pk: i64,
        name: &str,
        output_type: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("v1/jobs/{}/outputs/{}", pk, name))
            .query(&[("type", output_type)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
