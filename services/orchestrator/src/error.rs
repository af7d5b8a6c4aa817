//! Error types shared by the orchestration core.
//!
//! Step handlers fail with [`StepError`]; the task runner's dispatch loop is
//! the only place that classifies one as transient or permanent (see
//! [`crate::retry::is_transient_error`]). Callers of the actor RPC surface
//! see [`OrchestratorError`].

use sam_id::{NodeId, TaskId};
use thiserror::Error;

use crate::actors::ActorError;
use crate::db::DbError;

/// Failure of a single step handler invocation.
///
/// `permanent` is an explicit classification. When it is `None` the message
/// is classified heuristically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StepError {
    message: String,
    permanent: Option<bool>,
}

impl StepError {
    /// An error with no explicit classification.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: None,
        }
    }

    /// An error that must fail the task without retrying.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: Some(true),
        }
    }

    /// An error that is always retried while retries remain.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: Some(false),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The explicit classification flag, if one was set.
    pub fn permanent_flag(&self) -> Option<bool> {
        self.permanent
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        // Collaborators wrap a classified StepError to carry the flag through anyhow.
        match err.downcast_ref::<StepError>() {
            Some(step) => step.clone(),
            None => StepError::new(format!("{err:#}")),
        }
    }
}

impl From<DbError> for StepError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(_) => StepError::permanent(err.to_string()),
            other => StepError::new(other.to_string()),
        }
    }
}

impl From<ActorError> for StepError {
    fn from(err: ActorError) -> Self {
        StepError::new(err.to_string())
    }
}

/// Errors surfaced to callers of the actor bridge.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// `start` was called for a task that already has runner state.
    #[error("already_initialized: task runner for {task_id} already exists")]
    AlreadyInitialized { task_id: TaskId },

    /// A lifecycle operation is not valid for the node's current status.
    #[error("node_lifecycle_conflict: node {node_id} is {status}")]
    NodeLifecycleConflict { node_id: NodeId, status: String },

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl OrchestratorError {
    /// Stable machine-readable code for HTTP problem responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInitialized { .. } => "already_initialized",
            Self::NodeLifecycleConflict { .. } => "node_lifecycle_conflict",
            Self::Actor(_) => "actor_unavailable",
            Self::Db(_) => "store_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_from_anyhow_keeps_flag() {
        let wrapped = anyhow::Error::new(StepError::permanent("quota gone"));
        let step = StepError::from(wrapped);
        assert_eq!(step.permanent_flag(), Some(true));
        assert_eq!(step.message(), "quota gone");
    }

    #[test]
    fn test_step_error_from_plain_anyhow_is_unclassified() {
        let step = StepError::from(anyhow::anyhow!("socket closed"));
        assert_eq!(step.permanent_flag(), None);
        assert_eq!(step.message(), "socket closed");
    }

    #[test]
    fn test_not_found_row_is_permanent() {
        let step = StepError::from(DbError::NotFound("node node_x".to_string()));
        assert_eq!(step.permanent_flag(), Some(true));
    }

    #[test]
    fn test_orchestrator_error_codes() {
        let err = OrchestratorError::AlreadyInitialized {
            task_id: TaskId::new(),
        };
        assert_eq!(err.code(), "already_initialized");
        assert!(err.to_string().starts_with("already_initialized"));
    }
}
