//! Job template domain types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Describes how to run a family of jobs
///
/// `contract` is the contract identifier (for example `Train<Domain>`) that
/// decides which runner executes jobs created from this template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub pk: i64,
    pub name: String,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "type")]
    pub contract: String,
    #[serde(default)]
    pub parameters: HashMap<String, TemplateParameter>,
    #[serde(default)]
    pub description: String,
}

impl Template {
    /// Contract name without its type arguments (`Train<Domain>` -> `Train`)
    pub fn contract_name(&self) -> &str {
        contract_name(&self.contract)
    }
}

/// Strips type arguments from a contract identifier
pub fn contract_name(contract: &str) -> &str {
    contract
        .split_once('<')
        .map_or(contract, |(name, _)| name)
        .trim()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateParameter {
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub default_type: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub help: String,
}
