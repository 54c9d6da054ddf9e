//! Log domain types

use serde::{Deserialize, Serialize};

/// A log entry recorded while executing a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// An external command run on behalf of a job
///
/// Secrets are already masked in `cmd` and `output` when the record is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub cmd: Vec<String>,
    pub returncode: i32,
    /// Merged stdout and stderr, one entry per line
    pub output: Vec<String>,
}
