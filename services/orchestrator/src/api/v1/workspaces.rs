//! Workspace callbacks.
//!
//! The workspace reports readiness (or a provisioning failure) with the
//! bearer token it was given at creation. Both routes feed the owning task
//! runner's mailbox.

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use sam_id::WorkspaceId;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::actors::task_runner::WorkspaceReadyStatus;
use crate::api::error::ApiError;
use crate::state::AppState;

/// /v1/workspaces
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{workspace_id}/ready", post(workspace_ready))
        .route(
            "/{workspace_id}/provisioning-failed",
            post(provisioning_failed),
        )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyRequest {
    /// `running` unless the workspace came up from a recovery snapshot.
    #[serde(default)]
    pub status: Option<ReadyStatus>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyStatus {
    Running,
    Recovery,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningFailedRequest {
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    /// Whether a live runner took the signal.
    pub accepted: bool,
}

/// Parses the path id and checks the bearer token against it.
fn authorize(state: &AppState, headers: &HeaderMap, raw_id: &str) -> Result<WorkspaceId, ApiError> {
    let workspace_id: WorkspaceId = raw_id.parse().map_err(|_| {
        ApiError::bad_request("invalid_workspace_id", "Invalid workspace ID format")
    })?;

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("missing_token", "Bearer token required"))?;

    state
        .signer()
        .verify(token.trim(), workspace_id, Utc::now())
        .map_err(|e| {
            warn!(%workspace_id, error = %e, "Rejected workspace callback");
            ApiError::unauthorized("invalid_token", "Invalid callback token")
        })?;
    Ok(workspace_id)
}

/// POST /v1/workspaces/{workspace_id}/ready
async fn workspace_ready(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReadyRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace_id = authorize(&state, &headers, &workspace_id)?;
    let status = match body.and_then(|Json(req)| req.status) {
        Some(ReadyStatus::Recovery) => WorkspaceReadyStatus::Recovery,
        Some(ReadyStatus::Running) | None => WorkspaceReadyStatus::Running,
    };

    let accepted = state
        .task_runners()
        .workspace_callback(workspace_id, status, None)
        .await?;
    Ok(Json(CallbackResponse { accepted }))
}

/// POST /v1/workspaces/{workspace_id}/provisioning-failed
async fn provisioning_failed(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ProvisioningFailedRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace_id = authorize(&state, &headers, &workspace_id)?;
    let message = body
        .and_then(|Json(req)| req.error_message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| "Workspace provisioning failed".to_string());

    let accepted = state
        .task_runners()
        .workspace_callback(workspace_id, WorkspaceReadyStatus::Error, Some(message))
        .await?;
    Ok(Json(CallbackResponse { accepted }))
}
