//! Hardware generation endpoints

use crate::BackendClient;
use crate::error::Result;
use lathe_core::domain::hardware::HardwareGeneration;
use lathe_core::dto::filter::FilterSpec;
use reqwest::Method;

impl BackendClient {
    /// List every known hardware generation
    pub async fn list_hardware_generations(&self) -> Result<Vec<HardwareGeneration>> {
        let response = self
            .request(Method::POST, "v1/hardware/list")
            .json(&FilterSpec::default())
            .send()
            .await?;

        self.handle_response(response).await
    }
}
