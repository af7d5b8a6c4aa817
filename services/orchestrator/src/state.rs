//! Application state shared across request handlers.

use std::sync::Arc;

use crate::callback::CallbackSigner;
use crate::db::Database;
use crate::service::{NodeLifecycleService, TaskRunnerService};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    task_runners: Arc<TaskRunnerService>,
    node_lifecycle: Arc<NodeLifecycleService>,
    signer: CallbackSigner,
    /// Absent when running on the in-memory store.
    db: Option<Database>,
}

impl AppState {
    pub fn new(
        task_runners: Arc<TaskRunnerService>,
        node_lifecycle: Arc<NodeLifecycleService>,
        signer: CallbackSigner,
        db: Option<Database>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                task_runners,
                node_lifecycle,
                signer,
                db,
            }),
        }
    }

    pub fn task_runners(&self) -> &TaskRunnerService {
        &self.inner.task_runners
    }

    pub fn node_lifecycle(&self) -> &NodeLifecycleService {
        &self.inner.node_lifecycle
    }

    pub fn signer(&self) -> &CallbackSigner {
        &self.inner.signer
    }

    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
