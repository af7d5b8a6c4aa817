//! Node lifecycle endpoints.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use sam_id::{NodeId, UserId};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::service::NodeLifecycle;
use crate::state::AppState;

/// /v1/nodes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{node_id}/lifecycle", get(get_lifecycle))
        .route("/{node_id}/lifecycle/idle", post(mark_idle))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkIdleRequest {
    pub user_id: UserId,
}

fn parse_node_id(raw: &str) -> Result<NodeId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid_node_id", "Invalid node ID format"))
}

/// POST /v1/nodes/{node_id}/lifecycle/idle
async fn mark_idle(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(req): Json<MarkIdleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let lifecycle = state.node_lifecycle().mark_idle(node_id, req.user_id).await?;
    Ok(Json(lifecycle))
}

/// GET /v1/nodes/{node_id}/lifecycle
async fn get_lifecycle(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    match state.node_lifecycle().get_status(node_id).await? {
        Some(lifecycle) => Ok(Json(lifecycle)),
        None => Err(ApiError::not_found(
            "lifecycle_not_found",
            format!("Node {node_id} has no lifecycle state"),
        )),
    }
}
