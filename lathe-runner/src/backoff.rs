//! Retry interval sequencing
//!
//! A [`BackoffScheduler`] walks through a configured list of wait
//! durations. Each failure advances it by one entry and a success resets
//! it to the first entry. The same type drives both the backend-error
//! retries and the poll interval.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// What happens when `advance` is called on the last entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    /// Stay on the last (longest) entry
    #[default]
    Clamp,
    /// Start over at the first entry
    Wrap,
}

#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    name: &'static str,
    schedule: Vec<Duration>,
    mode: BackoffMode,
    index: usize,
}

impl BackoffScheduler {
    /// Creates a scheduler positioned at the first entry
    ///
    /// # Arguments
    /// * `name` - Used in log messages
    /// * `schedule` - Wait durations in order; an empty list falls back to
    ///   a single one-second entry
    /// * `mode` - Behaviour past the last entry
    pub fn new(name: &'static str, schedule: Vec<Duration>, mode: BackoffMode) -> Self {
        let schedule = if schedule.is_empty() {
            vec![Duration::from_secs(1)]
        } else {
            schedule
        };

        Self {
            name,
            schedule,
            mode,
            index: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.schedule[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn advance(&mut self) {
        let last = self.schedule.len() - 1;
        self.index = match self.mode {
            BackoffMode::Clamp => (self.index + 1).min(last),
            BackoffMode::Wrap if self.index >= last => 0,
            BackoffMode::Wrap => self.index + 1,
        };
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Sleeps for the current interval without advancing
    pub async fn sleep(&self) {
        let wait = self.current();
        debug!("{}: waiting {:?}", self.name, wait);
        tokio::time::sleep(wait).await;
    }
}
