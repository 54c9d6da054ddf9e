//! Job domain types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::docker::DockerImageSpec;

/// A unit of work stored by the backend
///
/// A job is pending while `start_time`, `error_reason` and `node` are all
/// unset. The backend assigns `node` atomically on acquire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub pk: i64,
    pub template: TemplateRef,
    #[serde(default)]
    pub input_values: HashMap<String, TypedValue>,
    #[serde(default)]
    pub parameter_values: HashMap<String, TypedValue>,
    #[serde(default)]
    pub node: Option<i64>,
    #[serde(default)]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub is_cancelled: bool,
    /// Docker image resolved by the backend, when it expands it inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<DockerImageSpec>,
}

impl Job {
    /// Looks a value up in the parameters first, then in the inputs
    pub fn value(&self, name: &str) -> Option<&TypedValue> {
        self.parameter_values
            .get(name)
            .or_else(|| self.input_values.get(name))
    }

    /// Whether the backend still considers the job unclaimed
    pub fn is_pending(&self) -> bool {
        self.start_time.is_none() && self.error_reason.is_none() && self.node.is_none()
    }
}

/// Reference to the template a job was created from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRef {
    pub pk: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A job value together with the type name it was supplied as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub value_type: String,
}
