//! HTTP client for the agent running on each node.
//!
//! Non-success responses are classified here rather than by message
//! heuristics: 408, 429 and 5xx are transient, any other 4xx is permanent.
//! A 409 on create means the resource already exists and counts as success.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use sam_id::{AgentSessionId, WorkspaceId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::models::NodeRecord;
use crate::error::StepError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    pub workspace_id: WorkspaceId,
    pub repository: String,
    pub branch: String,
    /// Bearer credential the workspace presents on its ready callback.
    pub callback_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_user_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentSessionRequest {
    pub session_id: AgentSessionId,
    pub workspace_id: WorkspaceId,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_branch: Option<String>,
}

/// Operations the orchestrator performs against a node's agent.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// One health probe, bounded by `timeout`.
    async fn check_health(&self, node: &NodeRecord, timeout: Duration) -> Result<()>;

    async fn create_workspace(&self, node: &NodeRecord, request: &CreateWorkspaceRequest)
        -> Result<()>;

    async fn delete_workspace(&self, node: &NodeRecord, workspace_id: WorkspaceId) -> Result<()>;

    async fn create_agent_session(
        &self,
        node: &NodeRecord,
        request: &CreateAgentSessionRequest,
    ) -> Result<()>;
}

pub struct HttpNodeAgentClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpNodeAgentClient {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, port })
    }

    fn base_url(&self, node: &NodeRecord) -> Result<String> {
        let ip = node
            .ip_address
            .as_deref()
            .ok_or_else(|| StepError::new(format!("node {} has no ip address yet", node.id)))?;
        Ok(format!("http://{}:{}", ip, self.port))
    }

    async fn check(response: reqwest::Response, what: &str, conflict_ok: bool) -> Result<()> {
        let status = response.status();
        if status.is_success() || (conflict_ok && status == StatusCode::CONFLICT) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "Node agent {what} failed");
        Err(classify_status(status, &format!("node agent {what} failed: {status} {body}")).into())
    }
}

/// Maps an HTTP status to a classified step error.
pub fn classify_status(status: StatusCode, message: &str) -> StepError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        StepError::transient(message)
    } else if status.is_client_error() {
        StepError::permanent(message)
    } else {
        StepError::new(message)
    }
}

fn send_error(what: &str, err: reqwest::Error) -> anyhow::Error {
    let reason = if err.is_timeout() { "timed out" } else { "connection failed" };
    StepError::transient(format!("node agent {what} {reason}: {err}")).into()
}

#[async_trait]
impl NodeAgent for HttpNodeAgentClient {
    async fn check_health(&self, node: &NodeRecord, timeout: Duration) -> Result<()> {
        let url = format!("{}/health", self.base_url(node)?);
        debug!(url = %url, "Probing node agent");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error("health probe", e))?;
        Self::check(response, "health probe", false).await
    }

    async fn create_workspace(
        &self,
        node: &NodeRecord,
        request: &CreateWorkspaceRequest,
    ) -> Result<()> {
        let url = format!("{}/workspaces", self.base_url(node)?);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| send_error("create workspace", e))?;
        Self::check(response, "create workspace", true).await
    }

    async fn delete_workspace(&self, node: &NodeRecord, workspace_id: WorkspaceId) -> Result<()> {
        let url = format!("{}/workspaces/{}", self.base_url(node)?, workspace_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| send_error("delete workspace", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, "delete workspace", false).await
    }

    async fn create_agent_session(
        &self,
        node: &NodeRecord,
        request: &CreateAgentSessionRequest,
    ) -> Result<()> {
        let url = format!(
            "{}/workspaces/{}/agent-sessions",
            self.base_url(node)?,
            request.workspace_id
        );
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| send_error("create agent session", e))?;
        Self::check(response, "create agent session", true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NodeStatus;
    use crate::retry::is_transient_error;
    use chrono::Utc;
    use sam_id::{NodeId, UserId};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node_at(server: &MockServer) -> (HttpNodeAgentClient, NodeRecord) {
        let client = HttpNodeAgentClient::new(server.address().port()).unwrap();
        let node = NodeRecord {
            id: NodeId::new(),
            user_id: UserId::new(),
            name: "node".to_string(),
            status: NodeStatus::Running,
            health_status: None,
            vm_size: "medium".to_string(),
            vm_location: "nbg1".to_string(),
            ip_address: Some(server.address().ip().to_string()),
            metrics: None,
            warm_since: None,
            created_at: Utc::now(),
        };
        (client, node)
    }

    fn step_error(err: anyhow::Error) -> StepError {
        StepError::from(err)
    }

    #[tokio::test]
    async fn test_health_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (client, node) = node_at(&server);
        client
            .check_health(&node, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_probe_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let (client, node) = node_at(&server);
        let err = step_error(
            client
                .check_health(&node, Duration::from_millis(50))
                .await
                .unwrap_err(),
        );
        assert_eq!(err.permanent_flag(), Some(false));
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn test_create_workspace_conflict_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces"))
            .and(body_partial_json(serde_json::json!({ "branch": "main" })))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let (client, node) = node_at(&server);
        let request = CreateWorkspaceRequest {
            workspace_id: WorkspaceId::new(),
            repository: "acme/app".to_string(),
            branch: "main".to_string(),
            callback_token: "token".to_string(),
            installation_id: None,
            git_user_name: None,
            git_user_email: None,
            github_id: None,
        };
        client.create_workspace(&node, &request).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad repo"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/workspaces"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (client, node) = node_at(&server);
        let request = CreateWorkspaceRequest {
            workspace_id: WorkspaceId::new(),
            repository: "acme/app".to_string(),
            branch: "main".to_string(),
            callback_token: "token".to_string(),
            installation_id: None,
            git_user_name: None,
            git_user_email: None,
            github_id: None,
        };

        let first = step_error(client.create_workspace(&node, &request).await.unwrap_err());
        assert!(!is_transient_error(&first));
        assert!(first.message().contains("bad repo"));

        let second = step_error(client.create_workspace(&node, &request).await.unwrap_err());
        assert!(is_transient_error(&second));
    }

    #[tokio::test]
    async fn test_delete_missing_workspace_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (client, node) = node_at(&server);
        client
            .delete_workspace(&node, WorkspaceId::new())
            .await
            .unwrap();
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "x").permanent_flag(),
            Some(false)
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT, "x").permanent_flag(),
            Some(false)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, "x").permanent_flag(),
            Some(true)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, "x").permanent_flag(),
            Some(false)
        );
    }
}
