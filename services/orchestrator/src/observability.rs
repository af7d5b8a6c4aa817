//! Operator-facing error sink.
//!
//! Failures are logged and written to the store's error table. Writing is
//! best-effort: a failed write is logged and swallowed.

use std::sync::Arc;

use chrono::Utc;
use sam_id::{NodeId, TaskId};
use tracing::{error, warn};

use crate::db::models::ErrorEvent;
use crate::db::ControlPlaneStore;

#[derive(Clone)]
pub struct ErrorReporter {
    store: Arc<dyn ControlPlaneStore>,
}

impl ErrorReporter {
    pub fn new(store: Arc<dyn ControlPlaneStore>) -> Self {
        Self { store }
    }

    pub async fn report(
        &self,
        source: &str,
        message: &str,
        task_id: Option<TaskId>,
        node_id: Option<NodeId>,
        context: serde_json::Value,
    ) {
        error!(
            source,
            task_id = ?task_id,
            node_id = ?node_id,
            error = %message,
            "Recorded orchestration failure"
        );

        let event = ErrorEvent {
            source: source.to_string(),
            message: message.to_string(),
            task_id,
            node_id,
            context,
            occurred_at: Utc::now(),
        };
        if let Err(e) = self.store.record_error(&event).await {
            warn!(source, error = %e, "Failed to persist error event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_report_persists_event() {
        let store = Arc::new(MemoryStore::new());
        let reporter = ErrorReporter::new(store.clone());
        let task_id = TaskId::new();

        reporter
            .report(
                "task_runner",
                "boom",
                Some(task_id),
                None,
                serde_json::json!({ "step": "workspace_ready" }),
            )
            .await;

        let errors = store.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task_id, Some(task_id));
        assert_eq!(errors[0].context["step"], "workspace_ready");
    }

    #[tokio::test]
    async fn test_report_survives_store_failure() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure("record_error", 1);
        ErrorReporter::new(store.clone())
            .report("task_runner", "boom", None, None, serde_json::Value::Null)
            .await;
        assert!(store.errors().is_empty());
    }
}
