//! Persisted task runner state.

use chrono::{DateTime, Utc};
use sam_id::{AgentSessionId, NodeId, ProjectId, TaskId, UserId, WorkspaceId};
use serde::{Deserialize, Serialize};

use crate::db::models::TaskStatus;

/// Current layout of [`TaskRunState`]. Older blobs are upgraded on load.
pub const STATE_VERSION: u32 = 1;

/// Provisioning steps, in the order a task normally visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    NodeSelection,
    NodeProvisioning,
    NodeAgentReady,
    WorkspaceCreation,
    WorkspaceReady,
    AgentSession,
    Running,
    AwaitingFollowup,
    Failed,
    Completed,
    Cancelled,
}

impl TaskStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeSelection => "node_selection",
            Self::NodeProvisioning => "node_provisioning",
            Self::NodeAgentReady => "node_agent_ready",
            Self::WorkspaceCreation => "workspace_creation",
            Self::WorkspaceReady => "workspace_ready",
            Self::AgentSession => "agent_session",
            Self::Running => "running",
            Self::AwaitingFollowup => "awaiting_followup",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// The agent is working; the runner has nothing left to do.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Running | Self::AwaitingFollowup)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_terminal_success() || matches!(self, Self::Failed | Self::Completed | Self::Cancelled)
    }

    /// The step matching a task status set outside the runner, if terminal.
    pub fn for_terminal_status(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::Failed => Some(Self::Failed),
            TaskStatus::Completed => Some(Self::Completed),
            TaskStatus::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Runs to completion unattended.
    #[default]
    Task,
    /// Waits for follow-up messages once the agent is up.
    Conversation,
}

/// Everything needed to run a task, fixed at `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunInput {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    #[serde(default)]
    pub vm_size: Option<String>,
    #[serde(default)]
    pub vm_location: Option<String>,
    pub branch: String,
    #[serde(default)]
    pub preferred_node_id: Option<NodeId>,
    pub repository: String,
    #[serde(default)]
    pub installation_id: Option<String>,
    pub task_title: String,
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub output_branch: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub github_id: Option<String>,
    #[serde(default)]
    pub project_default_vm_size: Option<String>,
    #[serde(default)]
    pub task_mode: TaskMode,
}

impl TaskRunInput {
    /// Explicit size, then the project default, then `fallback`.
    pub fn resolved_vm_size(&self, fallback: &str) -> String {
        non_empty(&self.vm_size)
            .or_else(|| non_empty(&self.project_default_vm_size))
            .unwrap_or(fallback)
            .to_string()
    }

    pub fn resolved_vm_location(&self, fallback: &str) -> String {
        non_empty(&self.vm_location).unwrap_or(fallback).to_string()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Outcome reported by the workspace's ready callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceReadyStatus {
    Running,
    Recovery,
    Error,
}

/// Results of completed steps. Fields are set once and never cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResults {
    pub node_id: Option<NodeId>,
    pub workspace_id: Option<WorkspaceId>,
    pub agent_session_id: Option<AgentSessionId>,
    /// The node came from provisioning or the warm pool and is released on failure.
    #[serde(default)]
    pub auto_provisioned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunState {
    #[serde(default)]
    pub version: u32,
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub current_step: TaskStep,
    #[serde(default)]
    pub step_results: StepResults,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub agent_ready_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workspace_ready_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workspace_ready_received: bool,
    #[serde(default)]
    pub workspace_ready_status: Option<WorkspaceReadyStatus>,
    #[serde(default)]
    pub workspace_error_message: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub input: TaskRunInput,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TaskRunState {
    pub fn new(input: TaskRunInput) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            task_id: input.task_id,
            project_id: input.project_id,
            user_id: input.user_id,
            current_step: TaskStep::NodeSelection,
            step_results: StepResults::default(),
            retry_count: 0,
            agent_ready_started_at: None,
            workspace_ready_started_at: None,
            workspace_ready_received: false,
            workspace_ready_status: None,
            workspace_error_message: None,
            completed: false,
            last_error: None,
            input,
            created_at: now,
            updated_at: now,
        }
    }

    /// Upgrades a state loaded from an older layout. Returns whether it changed.
    pub fn migrate(&mut self) -> bool {
        if self.version >= STATE_VERSION {
            return false;
        }
        // Unversioned states can sit on a terminal step without the flag.
        if self.current_step.is_terminal() {
            self.completed = true;
        }
        self.version = STATE_VERSION;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> TaskRunInput {
        TaskRunInput {
            task_id: TaskId::new(),
            project_id: ProjectId::new(),
            user_id: UserId::new(),
            vm_size: None,
            vm_location: None,
            branch: "main".to_string(),
            preferred_node_id: None,
            repository: "acme/app".to_string(),
            installation_id: None,
            task_title: "Fix the build".to_string(),
            task_description: None,
            output_branch: None,
            user_name: None,
            user_email: None,
            github_id: None,
            project_default_vm_size: None,
            task_mode: TaskMode::Task,
        }
    }

    #[test]
    fn test_vm_size_resolution_order() {
        let mut input = input();
        assert_eq!(input.resolved_vm_size("medium"), "medium");
        input.project_default_vm_size = Some("large".to_string());
        assert_eq!(input.resolved_vm_size("medium"), "large");
        input.vm_size = Some("small".to_string());
        assert_eq!(input.resolved_vm_size("medium"), "small");
        input.vm_size = Some("  ".to_string());
        assert_eq!(input.resolved_vm_size("medium"), "large");
    }

    #[test]
    fn test_input_wire_format() {
        let input: TaskRunInput = serde_json::from_value(serde_json::json!({
            "taskId": TaskId::new().to_string(),
            "projectId": ProjectId::new().to_string(),
            "userId": UserId::new().to_string(),
            "branch": "main",
            "repository": "acme/app",
            "taskTitle": "Add tests",
            "taskMode": "conversation"
        }))
        .unwrap();
        assert_eq!(input.task_mode, TaskMode::Conversation);
        assert_eq!(input.preferred_node_id, None);
    }

    #[test]
    fn test_unversioned_state_is_upgraded() {
        let state = TaskRunState::new(input());
        let mut blob = serde_json::to_value(&state).unwrap();
        let obj = blob.as_object_mut().unwrap();
        for field in ["version", "lastError", "createdAt", "updatedAt", "completed"] {
            obj.remove(field);
        }
        obj.insert("currentStep".to_string(), serde_json::json!("running"));

        let mut loaded: TaskRunState = serde_json::from_value(blob).unwrap();
        assert_eq!(loaded.version, 0);
        assert!(loaded.migrate());
        assert_eq!(loaded.version, STATE_VERSION);
        assert!(loaded.completed);
        assert!(!loaded.migrate());
    }

    #[test]
    fn test_terminal_steps() {
        assert!(TaskStep::AwaitingFollowup.is_terminal_success());
        assert!(TaskStep::Cancelled.is_terminal());
        assert!(!TaskStep::WorkspaceReady.is_terminal());
        assert_eq!(
            TaskStep::for_terminal_status(TaskStatus::Cancelled),
            Some(TaskStep::Cancelled)
        );
        assert_eq!(TaskStep::for_terminal_status(TaskStatus::Delegated), None);
    }
}
