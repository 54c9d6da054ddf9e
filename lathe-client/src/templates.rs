//! Template and docker image endpoints

use crate::BackendClient;
use crate::error::{ClientError, Result};
use lathe_core::domain::docker::DockerImageSpec;
use lathe_core::domain::template::Template;
use reqwest::{Method, StatusCode};

impl BackendClient {
    /// Get a job template by primary key
    pub async fn retrieve_template(&self, pk: i64) -> Result<Template> {
        let response = self
            .request(Method::GET, &format!("v1/job-templates/{}", pk))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!("job template {}", pk)));
        }

        self.handle_response(response).await
    }

    /// Get a docker image by primary key
    pub async fn retrieve_docker_image(&self, pk: i64) -> Result<DockerImageSpec> {
        let response = self
            .request(Method::GET, &format!("v1/docker/{}", pk))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!("docker image {}", pk)));
        }

        self.handle_response(response).await
    }
}
