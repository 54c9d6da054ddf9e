//! Docker image domain types

use serde::{Deserialize, Serialize};

use super::hardware::HardwareGeneration;

/// A container image registered with the backend, plus its requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerImageSpec {
    pub pk: i64,
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub registry_url: String,
    #[serde(default)]
    pub registry_username: Option<String>,
    #[serde(default)]
    pub registry_password: Option<String>,
    /// Image runs without any GPU
    #[serde(default)]
    pub cpu: bool,
    #[serde(default)]
    pub cuda_version: Option<CudaVersion>,
    #[serde(default)]
    pub min_hardware_generation: Option<HardwareGeneration>,
}

impl DockerImageSpec {
    /// Registry credentials, if a login is required before pulling
    pub fn registry_credentials(&self) -> Option<(&str, &str)> {
        let username = self.registry_username.as_deref().filter(|u| !u.is_empty())?;
        Some((username, self.registry_password.as_deref().unwrap_or("")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CudaVersion {
    pub version: String,
    pub min_driver_version: String,
}
