//! Actor bridge.
//!
//! Routes a task or node identifier to its actor and invokes one operation.
//! HTTP handlers and the node selector only ever talk to actors through
//! these services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sam_id::{NodeId, TaskId, UserId, WorkspaceId};
use tracing::{info, instrument};

use crate::actors::node_lifecycle::{
    ClaimResult, NodeLifecycleActor, NodeLifecycleConfig, NodeLifecycleMessage, NodeLifecycleState,
};
use crate::actors::task_runner::{
    TaskRunInput, TaskRunState, TaskRunnerActor, TaskRunnerDeps, TaskRunnerMessage,
    WorkspaceReadyStatus,
};
use crate::actors::{ActorError, ActorRegistry};
use crate::clients::Provisioner;
use crate::db::models::WorkspaceStatus;
use crate::db::{ActorStateStore, ControlPlaneStore, DbError};
use crate::error::OrchestratorError;

/// Operations on a node's warm-pool lifecycle.
#[async_trait]
pub trait NodeLifecycle: Send + Sync {
    /// Returns the node to the warm pool.
    async fn mark_idle(
        &self,
        node_id: NodeId,
        user_id: UserId,
    ) -> Result<NodeLifecycleState, OrchestratorError>;

    async fn mark_active(
        &self,
        node_id: NodeId,
        user_id: UserId,
    ) -> Result<NodeLifecycleState, OrchestratorError>;

    /// Claims a warm node for `task_id`. At most one concurrent claim wins.
    async fn try_claim(
        &self,
        node_id: NodeId,
        task_id: TaskId,
    ) -> Result<ClaimResult, OrchestratorError>;

    async fn get_status(
        &self,
        node_id: NodeId,
    ) -> Result<Option<NodeLifecycleState>, OrchestratorError>;
}

/// One lifecycle actor per node, keyed `node_lifecycle:{node_id}`.
pub struct NodeLifecycleService {
    registry: ActorRegistry<NodeId, NodeLifecycleActor>,
}

impl NodeLifecycleService {
    pub fn new(
        actor_store: Arc<dyn ActorStateStore>,
        store: Arc<dyn ControlPlaneStore>,
        provisioner: Arc<dyn Provisioner>,
        config: NodeLifecycleConfig,
    ) -> Self {
        let registry = ActorRegistry::new("node_lifecycle", actor_store, move |node_id| {
            NodeLifecycleActor::new(node_id, store.clone(), provisioner.clone(), config.clone())
        });
        Self { registry }
    }

    /// Respawns nodes with a pending warm timer or teardown retry.
    pub async fn recover(&self) -> Result<usize, ActorError> {
        self.registry.recover().await
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.registry.shutdown(grace).await;
    }
}

#[async_trait]
impl NodeLifecycle for NodeLifecycleService {
    async fn mark_idle(
        &self,
        node_id: NodeId,
        user_id: UserId,
    ) -> Result<NodeLifecycleState, OrchestratorError> {
        self.registry
            .call(node_id, |reply| NodeLifecycleMessage::MarkIdle { user_id, reply })
            .await?
    }

    async fn mark_active(
        &self,
        node_id: NodeId,
        user_id: UserId,
    ) -> Result<NodeLifecycleState, OrchestratorError> {
        self.registry
            .call(node_id, |reply| NodeLifecycleMessage::MarkActive { user_id, reply })
            .await?
    }

    async fn try_claim(
        &self,
        node_id: NodeId,
        task_id: TaskId,
    ) -> Result<ClaimResult, OrchestratorError> {
        self.registry
            .call(node_id, |reply| NodeLifecycleMessage::TryClaim { task_id, reply })
            .await?
    }

    async fn get_status(
        &self,
        node_id: NodeId,
    ) -> Result<Option<NodeLifecycleState>, OrchestratorError> {
        Ok(self
            .registry
            .call(node_id, |reply| NodeLifecycleMessage::GetStatus { reply })
            .await?)
    }
}

/// One task runner per task, keyed `task_runner:{task_id}`.
pub struct TaskRunnerService {
    registry: ActorRegistry<TaskId, TaskRunnerActor>,
    store: Arc<dyn ControlPlaneStore>,
}

impl TaskRunnerService {
    pub fn new(actor_store: Arc<dyn ActorStateStore>, deps: TaskRunnerDeps) -> Self {
        let store = deps.store.clone();
        let registry = ActorRegistry::new("task_runner", actor_store, move |task_id| {
            TaskRunnerActor::new(task_id, deps.clone())
        });
        Self { registry, store }
    }

    #[instrument(skip_all, fields(task_id = %input.task_id))]
    pub async fn start(&self, input: TaskRunInput) -> Result<TaskRunState, OrchestratorError> {
        let input = Box::new(input);
        self.registry
            .call(input.task_id, |reply| TaskRunnerMessage::Start { input, reply })
            .await?
    }

    pub async fn advance_workspace_ready(
        &self,
        task_id: TaskId,
        status: WorkspaceReadyStatus,
        error_message: Option<String>,
    ) -> Result<bool, OrchestratorError> {
        self.registry
            .call(task_id, |reply| TaskRunnerMessage::AdvanceWorkspaceReady {
                status,
                error_message,
                reply,
            })
            .await?
    }

    pub async fn get_status(&self, task_id: TaskId) -> Result<Option<TaskRunState>, OrchestratorError> {
        Ok(self
            .registry
            .call(task_id, |reply| TaskRunnerMessage::GetStatus { reply })
            .await?)
    }

    pub async fn cancel(&self, task_id: TaskId, reason: String) -> Result<bool, OrchestratorError> {
        self.registry
            .call(task_id, |reply| TaskRunnerMessage::Cancel { reason, reply })
            .await?
    }

    /// Applies a workspace callback: updates the workspace row, then signals
    /// the task that owns it. Returns whether a runner took the signal.
    #[instrument(skip(self, error_message))]
    pub async fn workspace_callback(
        &self,
        workspace_id: WorkspaceId,
        status: WorkspaceReadyStatus,
        error_message: Option<String>,
    ) -> Result<bool, OrchestratorError> {
        let workspace = self
            .store
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("workspace {workspace_id}")))?;

        let row_status = match status {
            WorkspaceReadyStatus::Running => WorkspaceStatus::Running,
            WorkspaceReadyStatus::Recovery => WorkspaceStatus::Recovery,
            WorkspaceReadyStatus::Error => WorkspaceStatus::Error,
        };
        self.store
            .set_workspace_status(workspace_id, row_status)
            .await?;

        let Some(task_id) = workspace.task_id else {
            info!("Workspace has no task, nothing to signal");
            return Ok(false);
        };
        self.advance_workspace_ready(task_id, status, error_message)
            .await
    }

    /// Runners currently resident. Completed runners release themselves.
    pub fn live_count(&self) -> usize {
        self.registry.live_count()
    }

    /// Respawns runners with a pending wake-up.
    pub async fn recover(&self) -> Result<usize, ActorError> {
        self.registry.recover().await
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.registry.shutdown(grace).await;
    }
}
