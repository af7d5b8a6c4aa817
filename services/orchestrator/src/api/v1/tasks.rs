//! Task runner endpoints.
//!
//! Called by the task queue to start a runner and by operators to inspect
//! or cancel one.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use sam_id::TaskId;
use serde::{Deserialize, Serialize};

use crate::actors::task_runner::TaskRunInput;
use crate::api::error::ApiError;
use crate::state::AppState;

/// /v1/tasks
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{task_id}/runner", post(start_runner).get(get_runner))
        .route("/{task_id}/runner/cancel", post(cancel_runner))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid_task_id", "Invalid task ID format"))
}

/// POST /v1/tasks/{task_id}/runner
async fn start_runner(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(input): Json<TaskRunInput>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    if input.task_id != task_id {
        return Err(ApiError::bad_request(
            "task_id_mismatch",
            "Body taskId does not match the path",
        ));
    }

    let run_state = state.task_runners().start(input).await?;
    Ok((StatusCode::CREATED, Json(run_state)))
}

/// GET /v1/tasks/{task_id}/runner
async fn get_runner(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    match state.task_runners().get_status(task_id).await? {
        Some(run_state) => Ok(Json(run_state)),
        None => Err(ApiError::not_found(
            "runner_not_found",
            format!("No runner for task {task_id}"),
        )),
    }
}

/// POST /v1/tasks/{task_id}/runner/cancel
async fn cancel_runner(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "Cancelled by user".to_string());

    let cancelled = state.task_runners().cancel(task_id, reason).await?;
    Ok(Json(CancelResponse { cancelled }))
}
