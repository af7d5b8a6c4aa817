//! In-process collaborators for tests and development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sam_id::{NodeId, WorkspaceId};
use tracing::info;

use super::node_agent::{CreateAgentSessionRequest, CreateWorkspaceRequest, NodeAgent};
use super::provisioning::{NodeSpec, ProvisionStatus, Provisioner};
use crate::db::models::{NewNode, NodeRecord, NodeStatus};
use crate::db::ControlPlaneStore;
use crate::error::StepError;

/// Node agent that accepts everything unless told otherwise.
#[derive(Default)]
pub struct MockNodeAgent {
    /// Health probes hang past their timeout.
    health_hangs: AtomicBool,
    health_probes: AtomicU32,
    /// Errors returned by the next `create_workspace` calls, in order.
    workspace_failures: Mutex<VecDeque<StepError>>,
    workspaces: Mutex<Vec<CreateWorkspaceRequest>>,
    deleted: Mutex<Vec<WorkspaceId>>,
    sessions: Mutex<Vec<CreateAgentSessionRequest>>,
}

impl MockNodeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// A node agent whose health endpoint never answers in time.
    pub fn unresponsive() -> Self {
        let agent = Self::default();
        agent.health_hangs.store(true, Ordering::SeqCst);
        agent
    }

    pub fn fail_next_workspace_create(&self, err: StepError) {
        if let Ok(mut failures) = self.workspace_failures.lock() {
            failures.push_back(err);
        }
    }

    pub fn health_probes(&self) -> u32 {
        self.health_probes.load(Ordering::SeqCst)
    }

    pub fn created_workspaces(&self) -> Vec<CreateWorkspaceRequest> {
        self.workspaces.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn deleted_workspaces(&self) -> Vec<WorkspaceId> {
        self.deleted.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn created_sessions(&self) -> Vec<CreateAgentSessionRequest> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NodeAgent for MockNodeAgent {
    async fn check_health(&self, node: &NodeRecord, timeout: Duration) -> Result<()> {
        self.health_probes.fetch_add(1, Ordering::SeqCst);
        if self.health_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(StepError::transient(format!(
                "[MOCK] health probe to node {} timed out",
                node.id
            ))
            .into());
        }
        Ok(())
    }

    async fn create_workspace(
        &self,
        node: &NodeRecord,
        request: &CreateWorkspaceRequest,
    ) -> Result<()> {
        let failure = self
            .workspace_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front());
        if let Some(err) = failure {
            return Err(err.into());
        }
        info!(node_id = %node.id, workspace_id = %request.workspace_id, "[MOCK] Creating workspace");
        if let Ok(mut workspaces) = self.workspaces.lock() {
            workspaces.push(request.clone());
        }
        Ok(())
    }

    async fn delete_workspace(&self, _node: &NodeRecord, workspace_id: WorkspaceId) -> Result<()> {
        if let Ok(mut deleted) = self.deleted.lock() {
            deleted.push(workspace_id);
        }
        Ok(())
    }

    async fn create_agent_session(
        &self,
        _node: &NodeRecord,
        request: &CreateAgentSessionRequest,
    ) -> Result<()> {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(request.clone());
        }
        Ok(())
    }
}

/// Provisioner whose VM status is scripted per call.
///
/// Each `provision_node` call pops the next status; once the script is
/// exhausted the node reports `running`.
pub struct MockProvisioner {
    store: Arc<dyn ControlPlaneStore>,
    script: Mutex<VecDeque<NodeStatus>>,
    created: AtomicU32,
    destroyed: Mutex<Vec<NodeId>>,
    fail_destroy: AtomicBool,
}

impl MockProvisioner {
    pub fn new(store: Arc<dyn ControlPlaneStore>) -> Self {
        Self {
            store,
            script: Mutex::new(VecDeque::new()),
            created: AtomicU32::new(0),
            destroyed: Mutex::new(Vec::new()),
            fail_destroy: AtomicBool::new(false),
        }
    }

    pub fn with_script(self, statuses: impl IntoIterator<Item = NodeStatus>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(statuses);
        }
        self
    }

    pub fn failing_destroy(self) -> Self {
        self.fail_destroy.store(true, Ordering::SeqCst);
        self
    }

    pub fn nodes_created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<NodeId> {
        self.destroyed.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create_node_record(&self, spec: &NodeSpec) -> Result<NodeId> {
        let node = NewNode {
            id: NodeId::new(),
            user_id: spec.user_id,
            name: spec.name.clone(),
            vm_size: spec.vm_size.clone(),
            vm_location: spec.vm_location.clone(),
        };
        self.store.insert_node(&node).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(node.id)
    }

    async fn provision_node(&self, node_id: NodeId) -> Result<ProvisionStatus> {
        let status = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(NodeStatus::Running);
        let ip_address = (status == NodeStatus::Running).then(|| "127.0.0.1".to_string());
        self.store
            .update_node_status(node_id, status, ip_address.as_deref())
            .await?;
        Ok(ProvisionStatus { status, ip_address })
    }

    async fn destroy_node(&self, node_id: NodeId) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            anyhow::bail!("[MOCK] destroy failed for node {node_id}");
        }
        if let Ok(mut destroyed) = self.destroyed.lock() {
            destroyed.push(node_id);
        }
        Ok(())
    }
}
