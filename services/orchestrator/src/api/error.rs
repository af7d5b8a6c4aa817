//! RFC 7807 problem responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::actors::ActorError;
use crate::db::DbError;
use crate::error::OrchestratorError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://sam.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            problem: Box::new(ProblemDetails::new(status, code, message)),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.retryable = true;
        err
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let code = err.code();
        match &err {
            OrchestratorError::AlreadyInitialized { .. }
            | OrchestratorError::NodeLifecycleConflict { .. } => {
                ApiError::conflict(code, err.to_string())
            }
            OrchestratorError::Db(DbError::NotFound(what)) => {
                ApiError::not_found("not_found", format!("{what} not found"))
            }
            OrchestratorError::Actor(ActorError::ActorStopped) => {
                ApiError::service_unavailable(code, err.to_string())
            }
            OrchestratorError::Actor(_) | OrchestratorError::Db(_) => {
                tracing::error!(error = %err, "Orchestrator request failed");
                ApiError::internal(code, "internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sam_id::{NodeId, TaskId};

    #[test]
    fn test_conflicts_map_to_409() {
        let err = ApiError::from(OrchestratorError::AlreadyInitialized {
            task_id: TaskId::new(),
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.problem.code, "already_initialized");

        let err = ApiError::from(OrchestratorError::NodeLifecycleConflict {
            node_id: NodeId::new(),
            status: "destroying".to_string(),
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.problem.code, "node_lifecycle_conflict");
    }

    #[test]
    fn test_missing_row_maps_to_404() {
        let err = ApiError::from(OrchestratorError::Db(DbError::NotFound(
            "workspace ws_1".to_string(),
        )));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_stopped_actor_is_retryable() {
        let err = ApiError::from(OrchestratorError::Actor(ActorError::ActorStopped));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.problem.retryable);
    }
}
