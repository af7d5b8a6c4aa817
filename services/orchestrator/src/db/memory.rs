//! In-process store used by dev mode and tests.
//!
//! Implements both [`ControlPlaneStore`] and [`ActorStateStore`] over plain
//! collections. Nodes keep insertion order so "store order" is deterministic.
//! Individual operations can be made to fail to exercise fallback paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sam_id::{ChatSessionId, NodeId, TaskId, UserId, WorkspaceId};

use super::actor_state::ActorStateStore;
use super::models::{
    ErrorEvent, NewAgentSession, NewNode, NewWorkspace, NodeRecord, NodeStatus, TaskStatus,
    WorkspaceRecord, WorkspaceStatus,
};
use super::store::ControlPlaneStore;
use super::DbError;

/// Task row as kept by the memory store.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub status: TaskStatus,
    pub node_id: Option<NodeId>,
    pub auto_provisioned_node_id: Option<NodeId>,
    pub workspace_id: Option<WorkspaceId>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
struct WorkspaceRow {
    spec: NewWorkspace,
    status: WorkspaceStatus,
}

#[derive(Debug, Clone)]
struct ChatSessionRow {
    id: ChatSessionId,
    task_id: TaskId,
    workspace_id: Option<WorkspaceId>,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<NodeRecord>,
    tasks: HashMap<TaskId, TaskRow>,
    workspaces: Vec<WorkspaceRow>,
    agent_sessions: Vec<NewAgentSession>,
    chat_sessions: Vec<ChatSessionRow>,
    errors: Vec<ErrorEvent>,
    actor_states: HashMap<String, serde_json::Value>,
    actor_alarms: HashMap<String, DateTime<Utc>>,
    faults: HashMap<&'static str, u32>,
}

impl Inner {
    fn node_mut(&mut self, node_id: NodeId) -> Result<&mut NodeRecord, DbError> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| DbError::NotFound(format!("node {node_id}")))
    }

    /// Consumes one injected failure for `op`, if any are pending.
    fn check_fault(&mut self, op: &'static str) -> Result<(), DbError> {
        match self.faults.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(DbError::Query(sqlx::Error::PoolTimedOut))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens in a failing test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `times` calls of the named store operation fail.
    pub fn inject_failure(&self, op: &'static str, times: u32) {
        self.lock().faults.insert(op, times);
    }

    // -------------------------------------------------------------------------
    // Seeding and inspection
    // -------------------------------------------------------------------------

    pub fn put_node(&self, node: NodeRecord) {
        let mut inner = self.lock();
        inner.nodes.retain(|n| n.id != node.id);
        inner.nodes.push(node);
    }

    pub fn node(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.lock().nodes.iter().find(|n| n.id == node_id).cloned()
    }

    pub fn put_task(&self, task_id: TaskId, status: TaskStatus) {
        self.lock().tasks.insert(
            task_id,
            TaskRow {
                status,
                node_id: None,
                auto_provisioned_node_id: None,
                workspace_id: None,
                error_message: None,
            },
        );
    }

    pub fn task(&self, task_id: TaskId) -> Option<TaskRow> {
        self.lock().tasks.get(&task_id).cloned()
    }

    pub fn set_task_status(&self, task_id: TaskId, status: TaskStatus) {
        if let Some(task) = self.lock().tasks.get_mut(&task_id) {
            task.status = status;
        }
    }

    pub fn put_chat_session(&self, task_id: TaskId, chat_session_id: ChatSessionId) {
        self.lock().chat_sessions.push(ChatSessionRow {
            id: chat_session_id,
            task_id,
            workspace_id: None,
        });
    }

    pub fn chat_session_workspace(&self, chat_session_id: ChatSessionId) -> Option<WorkspaceId> {
        self.lock()
            .chat_sessions
            .iter()
            .find(|c| c.id == chat_session_id)
            .and_then(|c| c.workspace_id)
    }

    /// Adds a workspace row directly, bypassing the task flow.
    pub fn put_workspace(&self, workspace: NewWorkspace, status: WorkspaceStatus) {
        self.lock().workspaces.push(WorkspaceRow {
            spec: workspace,
            status,
        });
    }

    pub fn workspace_ids_for_task(&self, task_id: TaskId) -> Vec<WorkspaceId> {
        self.lock()
            .workspaces
            .iter()
            .filter(|w| w.spec.task_id == task_id)
            .map(|w| w.spec.id)
            .collect()
    }

    pub fn agent_sessions(&self) -> Vec<NewAgentSession> {
        self.lock().agent_sessions.clone()
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.lock().errors.clone()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }
}

#[async_trait]
impl ControlPlaneStore for MemoryStore {
    async fn insert_node(&self, node: &NewNode) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("insert_node")?;
        inner.nodes.push(NodeRecord {
            id: node.id,
            user_id: node.user_id,
            name: node.name.clone(),
            status: NodeStatus::Creating,
            health_status: None,
            vm_size: node.vm_size.clone(),
            vm_location: node.vm_location.clone(),
            ip_address: None,
            metrics: None,
            warm_since: None,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>, DbError> {
        let mut inner = self.lock();
        inner.check_fault("get_node")?;
        Ok(inner.nodes.iter().find(|n| n.id == node_id).cloned())
    }

    async fn list_running_nodes(&self, user_id: UserId) -> Result<Vec<NodeRecord>, DbError> {
        let mut inner = self.lock();
        inner.check_fault("list_running_nodes")?;
        Ok(inner
            .nodes
            .iter()
            .filter(|n| n.user_id == user_id && n.status == NodeStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_warm_nodes(&self, user_id: UserId) -> Result<Vec<NodeRecord>, DbError> {
        let mut inner = self.lock();
        inner.check_fault("list_warm_nodes")?;
        Ok(inner
            .nodes
            .iter()
            .filter(|n| {
                n.user_id == user_id && n.status == NodeStatus::Running && n.warm_since.is_some()
            })
            .cloned()
            .collect())
    }

    async fn count_user_nodes(&self, user_id: UserId) -> Result<i64, DbError> {
        let mut inner = self.lock();
        inner.check_fault("count_user_nodes")?;
        Ok(inner
            .nodes
            .iter()
            .filter(|n| {
                n.user_id == user_id
                    && matches!(n.status, NodeStatus::Creating | NodeStatus::Running)
            })
            .count() as i64)
    }

    async fn update_node_status(
        &self,
        node_id: NodeId,
        status: NodeStatus,
        ip_address: Option<&str>,
    ) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("update_node_status")?;
        let node = inner.node_mut(node_id)?;
        node.status = status;
        if let Some(ip) = ip_address {
            node.ip_address = Some(ip.to_string());
        }
        Ok(())
    }

    async fn set_node_warm_since(
        &self,
        node_id: NodeId,
        warm_since: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("set_node_warm_since")?;
        if let Ok(node) = inner.node_mut(node_id) {
            node.warm_since = warm_since;
        }
        Ok(())
    }

    async fn mark_node_stopped(&self, node_id: NodeId) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("mark_node_stopped")?;
        if let Ok(node) = inner.node_mut(node_id) {
            node.status = NodeStatus::Stopped;
            node.warm_since = None;
        }
        Ok(())
    }

    async fn count_active_workspaces(&self, node_id: NodeId) -> Result<i64, DbError> {
        let mut inner = self.lock();
        inner.check_fault("count_active_workspaces")?;
        Ok(inner
            .workspaces
            .iter()
            .filter(|w| w.spec.node_id == node_id && w.status.is_active())
            .count() as i64)
    }

    async fn create_workspace(&self, workspace: &NewWorkspace) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("create_workspace")?;
        if inner.workspaces.iter().all(|w| w.spec.id != workspace.id) {
            inner.workspaces.push(WorkspaceRow {
                spec: workspace.clone(),
                status: WorkspaceStatus::Creating,
            });
        }
        Ok(())
    }

    async fn get_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<WorkspaceRecord>, DbError> {
        let inner = self.lock();
        Ok(inner
            .workspaces
            .iter()
            .find(|w| w.spec.id == workspace_id)
            .map(|w| WorkspaceRecord {
                id: w.spec.id,
                task_id: Some(w.spec.task_id),
                user_id: w.spec.user_id,
                node_id: w.spec.node_id,
                status: w.status,
                chat_session_id: inner
                    .chat_sessions
                    .iter()
                    .find(|c| c.workspace_id == Some(workspace_id))
                    .map(|c| c.id),
            }))
    }

    async fn set_workspace_status(
        &self,
        workspace_id: WorkspaceId,
        status: WorkspaceStatus,
    ) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("set_workspace_status")?;
        if let Some(row) = inner.workspaces.iter_mut().find(|w| w.spec.id == workspace_id) {
            row.status = status;
        }
        Ok(())
    }

    async fn create_agent_session(&self, session: &NewAgentSession) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("create_agent_session")?;
        if inner.agent_sessions.iter().all(|s| s.id != session.id) {
            inner.agent_sessions.push(session.clone());
        }
        Ok(())
    }

    async fn get_task_status(&self, task_id: TaskId) -> Result<Option<TaskStatus>, DbError> {
        let mut inner = self.lock();
        inner.check_fault("get_task_status")?;
        Ok(inner.tasks.get(&task_id).map(|t| t.status))
    }

    async fn set_task_node(
        &self,
        task_id: TaskId,
        node_id: NodeId,
        auto_provisioned: bool,
    ) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("set_task_node")?;
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.node_id = Some(node_id);
            if auto_provisioned {
                task.auto_provisioned_node_id = Some(node_id);
            }
        }
        Ok(())
    }

    async fn transition_task_status(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        workspace_id: Option<WorkspaceId>,
    ) -> Result<bool, DbError> {
        let mut inner = self.lock();
        inner.check_fault("transition_task_status")?;
        match inner.tasks.get_mut(&task_id) {
            Some(task) if task.status == from => {
                task.status = to;
                if workspace_id.is_some() {
                    task.workspace_id = workspace_id;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_task(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool, DbError> {
        let mut inner = self.lock();
        inner.check_fault("finish_task")?;
        match inner.tasks.get_mut(&task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = status;
                if let Some(message) = error_message {
                    task.error_message = Some(message.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_chat_session(&self, task_id: TaskId) -> Result<Option<ChatSessionId>, DbError> {
        let mut inner = self.lock();
        inner.check_fault("find_chat_session")?;
        Ok(inner
            .chat_sessions
            .iter()
            .find(|c| c.task_id == task_id)
            .map(|c| c.id))
    }

    async fn link_chat_session(
        &self,
        chat_session_id: ChatSessionId,
        workspace_id: WorkspaceId,
    ) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("link_chat_session")?;
        if let Some(chat) = inner
            .chat_sessions
            .iter_mut()
            .find(|c| c.id == chat_session_id)
        {
            chat.workspace_id = Some(workspace_id);
        }
        Ok(())
    }

    async fn record_error(&self, event: &ErrorEvent) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("record_error")?;
        inner.errors.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl ActorStateStore for MemoryStore {
    async fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>, DbError> {
        let mut inner = self.lock();
        inner.check_fault("load_state")?;
        Ok(inner.actor_states.get(key).cloned())
    }

    async fn save_state(&self, key: &str, state: &serde_json::Value) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("save_state")?;
        inner.actor_states.insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn load_alarm(&self, key: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        Ok(self.lock().actor_alarms.get(key).copied())
    }

    async fn save_alarm(&self, key: &str, at: Option<DateTime<Utc>>) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.check_fault("save_alarm")?;
        match at {
            Some(at) => inner.actor_alarms.insert(key.to_string(), at),
            None => inner.actor_alarms.remove(key),
        };
        Ok(())
    }

    async fn pending_alarms(&self, prefix: &str) -> Result<Vec<(String, DateTime<Utc>)>, DbError> {
        let mut alarms: Vec<_> = self
            .lock()
            .actor_alarms
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, at)| (key.clone(), *at))
            .collect();
        alarms.sort_by_key(|(_, at)| *at);
        Ok(alarms)
    }
}
