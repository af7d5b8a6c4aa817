//! Row types for the relational store.
//!
//! The orchestrator only reads most of these; the writes it performs are
//! step-result bookkeeping, status compare-and-set, and the warm-pool mirror.

use chrono::{DateTime, Utc};
use sam_id::{AgentSessionId, ChatSessionId, NodeId, ProjectId, TaskId, UserId, WorkspaceId};
use serde::{Deserialize, Serialize};

use super::DbError;

/// Generates `as_str`/`parse` for a status column stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Result<Self, DbError> {
                match raw {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DbError::Corrupt(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

text_enum!(NodeStatus {
    Creating => "creating",
    Running => "running",
    Stopped => "stopped",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Stale,
    Unhealthy,
}

text_enum!(HealthStatus {
    Healthy => "healthy",
    Stale => "stale",
    Unhealthy => "unhealthy",
});

/// Last metrics snapshot reported by a node's agent.
///
/// Load averages are per-host, so `cpu_load_avg1` may exceed 100 on
/// multi-core machines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    #[serde(default)]
    pub cpu_load_avg1: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub disk_percent: Option<f64>,
}

impl NodeMetrics {
    /// Decodes a stored metrics document; anything unparseable is `None`.
    pub fn from_json(value: Option<serde_json::Value>) -> Option<Self> {
        value
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub user_id: UserId,
    pub name: String,
    pub status: NodeStatus,
    pub health_status: Option<HealthStatus>,
    pub vm_size: String,
    pub vm_location: String,
    pub ip_address: Option<String>,
    pub metrics: Option<NodeMetrics>,
    pub warm_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A node row about to be inserted in `creating` status.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub id: NodeId,
    pub user_id: UserId,
    pub name: String,
    pub vm_size: String,
    pub vm_location: String,
}

// =============================================================================
// Tasks
// =============================================================================

/// Externally visible task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Delegated,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(TaskStatus {
    Queued => "queued",
    Delegated => "delegated",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    pub const TERMINAL: [TaskStatus; 3] = [Self::Completed, Self::Failed, Self::Cancelled];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

// =============================================================================
// Workspaces and sessions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Recovery,
    Stopped,
    Error,
}

text_enum!(WorkspaceStatus {
    Creating => "creating",
    Running => "running",
    Recovery => "recovery",
    Stopped => "stopped",
    Error => "error",
});

impl WorkspaceStatus {
    /// Statuses that occupy a slot on their node.
    pub const ACTIVE: [WorkspaceStatus; 3] = [Self::Running, Self::Creating, Self::Recovery];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkspace {
    pub id: WorkspaceId,
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub name: String,
    pub repository: String,
    pub branch: String,
    pub vm_size: String,
    pub vm_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub id: WorkspaceId,
    pub task_id: Option<TaskId>,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub status: WorkspaceStatus,
    pub chat_session_id: Option<ChatSessionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAgentSession {
    pub id: AgentSessionId,
    pub workspace_id: WorkspaceId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub label: String,
}

// =============================================================================
// Observability
// =============================================================================

/// An error recorded for operators, independent of the task row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub source: String,
    pub message: String,
    pub task_id: Option<TaskId>,
    pub node_id: Option<NodeId>,
    pub context: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}
