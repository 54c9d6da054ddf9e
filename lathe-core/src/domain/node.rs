//! Node domain types

use serde::{Deserialize, Serialize};

/// A worker node as recorded by the backend
///
/// Nodes are keyed by IP address and GPU index, so one host can register a
/// separate node per GPU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub pk: i64,
    pub ip: String,
    pub index: u32,
    #[serde(default)]
    pub driver_version: Option<String>,
    #[serde(default)]
    pub hardware_generation: Option<i64>,
    #[serde(default)]
    pub gpu_mem: Option<u64>,
    #[serde(default)]
    pub cpu_mem: Option<u64>,
    #[serde(default)]
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
    /// Job the backend believes this node is running
    #[serde(default)]
    pub current_job: Option<i64>,
}
