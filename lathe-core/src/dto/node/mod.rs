//! Node DTOs for node/backend communication

use serde::{Deserialize, Serialize};

/// Fields sent when a node registers or refreshes its record
///
/// Used for both create and partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub ip: String,
    pub index: u32,
    pub driver_version: Option<String>,
    pub hardware_generation: Option<i64>,
    /// Total GPU memory in MiB
    pub gpu_mem: Option<u64>,
    /// Total CPU memory in MiB
    pub cpu_mem: Option<u64>,
}
