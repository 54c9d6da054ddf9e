//! Job DTOs for node/backend communication

use serde::{Deserialize, Serialize};

/// Claims a pending job for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireJob {
    pub node: i64,
}

/// Marks an acquired job as started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJob {
    pub send_notification: String,
}

/// Progress report for a running job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Fraction complete, between 0 and 1
    pub progress: f64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Completes a job, successfully or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishJob {
    pub success: bool,
    pub send_notification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
