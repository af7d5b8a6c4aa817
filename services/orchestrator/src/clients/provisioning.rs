//! VM provisioning interface and the dev-mode implementation.
//!
//! The provisioning interface abstracts cloud VM lifecycle:
//! - Creating the node row that tracks a VM
//! - Driving the VM toward `running` (polled by the caller)
//! - Destroying the VM

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sam_id::{NodeId, UserId};
use tracing::info;

use crate::db::models::{NewNode, NodeStatus};
use crate::db::ControlPlaneStore;

/// What to provision.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub user_id: UserId,
    pub name: String,
    pub vm_size: String,
    pub vm_location: String,
}

/// Where a provisioning attempt stands.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionStatus {
    pub status: NodeStatus,
    pub ip_address: Option<String>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Inserts a node row in `creating` and returns its id.
    async fn create_node_record(&self, spec: &NodeSpec) -> Result<NodeId>;

    /// Advances the VM and reports its status. Safe to call repeatedly.
    async fn provision_node(&self, node_id: NodeId) -> Result<ProvisionStatus>;

    async fn destroy_node(&self, node_id: NodeId) -> Result<()>;
}

/// Provisioner for local development.
///
/// Writes node rows through the store and reports every VM as running on a
/// fixed address, where a locally started node agent is expected.
pub struct DevProvisioner {
    store: Arc<dyn ControlPlaneStore>,
    address: String,
}

impl DevProvisioner {
    pub fn new(store: Arc<dyn ControlPlaneStore>, address: impl Into<String>) -> Self {
        Self {
            store,
            address: address.into(),
        }
    }
}

#[async_trait]
impl Provisioner for DevProvisioner {
    async fn create_node_record(&self, spec: &NodeSpec) -> Result<NodeId> {
        let node = NewNode {
            id: NodeId::new(),
            user_id: spec.user_id,
            name: spec.name.clone(),
            vm_size: spec.vm_size.clone(),
            vm_location: spec.vm_location.clone(),
        };
        self.store.insert_node(&node).await?;
        info!(node_id = %node.id, vm_size = %node.vm_size, "[DEV] Created node record");
        Ok(node.id)
    }

    async fn provision_node(&self, node_id: NodeId) -> Result<ProvisionStatus> {
        self.store
            .update_node_status(node_id, NodeStatus::Running, Some(&self.address))
            .await?;
        info!(%node_id, address = %self.address, "[DEV] Node running");
        Ok(ProvisionStatus {
            status: NodeStatus::Running,
            ip_address: Some(self.address.clone()),
        })
    }

    async fn destroy_node(&self, node_id: NodeId) -> Result<()> {
        self.store.mark_node_stopped(node_id).await?;
        info!(%node_id, "[DEV] Node destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_dev_provisioner_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let provisioner = DevProvisioner::new(store.clone(), "127.0.0.1");
        let user = UserId::new();

        let node_id = provisioner
            .create_node_record(&NodeSpec {
                user_id: user,
                name: "task-node".to_string(),
                vm_size: "medium".to_string(),
                vm_location: "nbg1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(store.node(node_id).unwrap().status, NodeStatus::Creating);

        let status = provisioner.provision_node(node_id).await.unwrap();
        assert_eq!(status.status, NodeStatus::Running);
        assert_eq!(store.node(node_id).unwrap().ip_address.as_deref(), Some("127.0.0.1"));

        provisioner.destroy_node(node_id).await.unwrap();
        assert_eq!(store.node(node_id).unwrap().status, NodeStatus::Stopped);
    }
}
