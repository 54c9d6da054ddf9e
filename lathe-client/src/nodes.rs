//! Node registration endpoints

use crate::BackendClient;
use crate::error::Result;
use lathe_core::domain::node::Node;
use lathe_core::dto::filter::FilterSpec;
use lathe_core::dto::node::NodeUpdate;
use reqwest::Method;

impl BackendClient {
    /// List nodes matching a filter
    pub async fn list_nodes(&self, filter: &FilterSpec) -> Result<Vec<Node>> {
        let response = self
            .request(Method::POST, "v1/nodes/list")
            .json(filter)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Register a new node
    pub async fn create_node(&self, node: &NodeUpdate) -> Result<Node> {
        let response = self
            .request(Method::POST, "v1/nodes/create")
            .json(node)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Refresh the record of an existing node
    pub async fn update_node(&self, pk: i64, node: &NodeUpdate) -> Result<Node> {
        let response = self
            .request(Method::PATCH, &format!("v1/nodes/{}/partial", pk))
            .json(node)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Tell the backend the node is alive
    pub async fn ping_node(&self, pk: i64) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("v1/nodes/{}/ping", pk))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
