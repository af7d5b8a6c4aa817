//! Collaborators the orchestration core calls out to.
//!
//! - `provisioning`: cloud VM lifecycle
//! - `node_agent`: HTTP API of the agent running on each node
//! - `mock`: in-process implementations for tests and development

pub mod mock;
mod node_agent;
mod provisioning;

pub use node_agent::{
    classify_status, CreateAgentSessionRequest, CreateWorkspaceRequest, HttpNodeAgentClient,
    NodeAgent,
};
pub use provisioning::{DevProvisioner, NodeSpec, ProvisionStatus, Provisioner};
