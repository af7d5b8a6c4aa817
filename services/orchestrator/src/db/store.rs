//! The relational store as seen by the orchestration core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sam_id::{ChatSessionId, NodeId, TaskId, UserId, WorkspaceId};

use super::models::{
    ErrorEvent, NewAgentSession, NewNode, NewWorkspace, NodeRecord, NodeStatus, TaskStatus,
    WorkspaceRecord, WorkspaceStatus,
};
use super::DbError;

/// Row-level operations on nodes, tasks, and workspaces.
///
/// Status writes that can race an external recovery sweep are
/// compare-and-set: they report whether the row was actually updated.
#[async_trait]
pub trait ControlPlaneStore: Send + Sync {
    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    async fn insert_node(&self, node: &NewNode) -> Result<(), DbError>;

    async fn get_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>, DbError>;

    /// The user's `running` nodes, in store order.
    async fn list_running_nodes(&self, user_id: UserId) -> Result<Vec<NodeRecord>, DbError>;

    /// The user's `running` nodes with a non-null `warm_since`, in store order.
    async fn list_warm_nodes(&self, user_id: UserId) -> Result<Vec<NodeRecord>, DbError>;

    /// Nodes counted against the per-user cap (`creating` or `running`).
    async fn count_user_nodes(&self, user_id: UserId) -> Result<i64, DbError>;

    async fn update_node_status(
        &self,
        node_id: NodeId,
        status: NodeStatus,
        ip_address: Option<&str>,
    ) -> Result<(), DbError>;

    /// Mirrors the lifecycle actor's warm timestamp.
    async fn set_node_warm_since(
        &self,
        node_id: NodeId,
        warm_since: Option<DateTime<Utc>>,
    ) -> Result<(), DbError>;

    /// Sets `status = 'stopped', warm_since = NULL`.
    async fn mark_node_stopped(&self, node_id: NodeId) -> Result<(), DbError>;

    // -------------------------------------------------------------------------
    // Workspaces
    // -------------------------------------------------------------------------

    /// Workspaces on the node in `running`, `creating`, or `recovery`.
    async fn count_active_workspaces(&self, node_id: NodeId) -> Result<i64, DbError>;

    async fn create_workspace(&self, workspace: &NewWorkspace) -> Result<(), DbError>;

    async fn get_workspace(&self, workspace_id: WorkspaceId)
        -> Result<Option<WorkspaceRecord>, DbError>;

    async fn set_workspace_status(
        &self,
        workspace_id: WorkspaceId,
        status: WorkspaceStatus,
    ) -> Result<(), DbError>;

    async fn create_agent_session(&self, session: &NewAgentSession) -> Result<(), DbError>;

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    async fn get_task_status(&self, task_id: TaskId) -> Result<Option<TaskStatus>, DbError>;

    /// Records which node serves the task.
    async fn set_task_node(
        &self,
        task_id: TaskId,
        node_id: NodeId,
        auto_provisioned: bool,
    ) -> Result<(), DbError>;

    /// `UPDATE ... SET status = to WHERE status = from`; returns whether a row changed.
    async fn transition_task_status(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        workspace_id: Option<WorkspaceId>,
    ) -> Result<bool, DbError>;

    /// Moves a non-terminal task to a terminal status; returns whether a row changed.
    async fn finish_task(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool, DbError>;

    /// The chat session created for the task before it was queued, if any.
    async fn find_chat_session(&self, task_id: TaskId) -> Result<Option<ChatSessionId>, DbError>;

    async fn link_chat_session(
        &self,
        chat_session_id: ChatSessionId,
        workspace_id: WorkspaceId,
    ) -> Result<(), DbError>;

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    async fn record_error(&self, event: &ErrorEvent) -> Result<(), DbError>;
}
