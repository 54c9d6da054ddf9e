//! Cancellation polling
//!
//! Users cancel jobs through the backend, so a running job has to ask.
//! [`CancellationMonitor`] throttles those queries to one per
//! `cancel_check_wait` and remembers a positive answer for good.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use crate::backend::Backend;

pub struct CancellationMonitor {
    backend: Arc<dyn Backend>,
    job_pk: i64,
    wait: Duration,
    last_check: Option<Instant>,
    cancelled: bool,
}

impl CancellationMonitor {
    /// # Arguments
    /// * `backend` - Where the job record is re-read from
    /// * `job_pk` - The job being watched
    /// * `wait` - Minimum time between two backend queries
    pub fn new(backend: Arc<dyn Backend>, job_pk: i64, wait: Duration) -> Self {
        Self {
            backend,
            job_pk,
            wait,
            last_check: None,
            cancelled: false,
        }
    }

    /// Last known state, without asking the backend
    pub fn is_known_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Checks whether the job has been cancelled
    ///
    /// Queries the backend on the first call, when `immediate` is set, or
    /// once `wait` has passed since the previous query. Otherwise returns
    /// `false` without a query. Once cancelled, always `true`.
    pub async fn check(&mut self, immediate: bool) -> Result<bool> {
        if self.cancelled {
            return Ok(true);
        }

        let now = Instant::now();
        let due = self
            .last_check
            .is_none_or(|last| now.duration_since(last) >= self.wait);
        if !immediate && !due {
            return Ok(false);
        }

        // Failed queries count towards the throttle too
        self.last_check = Some(now);
        let job = self.backend.retrieve_job(self.job_pk).await?;
        self.cancelled = job.is_cancelled;

        Ok(self.cancelled)
    }
}
