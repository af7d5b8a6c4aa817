//! Step handlers.
//!
//! Each handler runs one attempt of its step and reports a [`StepOutcome`]
//! or a [`StepError`]. Handlers are safe to re-enter: anything created on a
//! previous attempt is recorded in `step_results` before the next external
//! call, and is reused instead of being created twice.

use chrono::Utc;
use sam_id::{AgentSessionId, NodeId, WorkspaceId};
use tracing::{debug, info, warn};

use super::{
    persist, StepOutcome, TaskMode, TaskRunState, TaskRunnerActor, TaskStep, WorkspaceReadyStatus,
};
use crate::actors::framework::ActorContext;
use crate::clients::{CreateAgentSessionRequest, CreateWorkspaceRequest, NodeSpec};
use crate::db::models::{
    HealthStatus, NewAgentSession, NewWorkspace, NodeRecord, NodeStatus, TaskStatus,
};
use crate::error::StepError;
use crate::scheduler::SelectionRequest;

fn millis(duration: std::time::Duration) -> u128 {
    duration.as_millis()
}

/// `in_progress` implies the task was delegated before.
fn already_past(status: TaskStatus, target: TaskStatus) -> bool {
    target == TaskStatus::Delegated && status == TaskStatus::InProgress
}

impl TaskRunnerActor {
    pub(super) async fn node_selection(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<StepOutcome, StepError> {
        let store = &self.deps.store;

        // Re-entry after the node was recorded but before the step advanced.
        if let Some(node_id) = state.step_results.node_id {
            store
                .set_task_node(state.task_id, node_id, state.step_results.auto_provisioned)
                .await?;
            return Ok(StepOutcome::Advance(TaskStep::WorkspaceCreation));
        }

        if let Some(preferred) = state.input.preferred_node_id {
            match store.get_node(preferred).await? {
                Some(node)
                    if node.user_id == state.user_id
                        && node.status == NodeStatus::Running
                        && node.health_status != Some(HealthStatus::Unhealthy) =>
                {
                    state.step_results.node_id = Some(node.id);
                    state.step_results.auto_provisioned = false;
                    persist(state, ctx).await?;
                    store.set_task_node(state.task_id, node.id, false).await?;
                    info!(node_id = %node.id, "Using preferred node");
                    return Ok(StepOutcome::Advance(TaskStep::WorkspaceCreation));
                }
                _ => warn!(node_id = %preferred, "Preferred node unusable, selecting another"),
            }
        }

        let config = self.config();
        let size = state.input.resolved_vm_size(&config.default_vm_size);
        let location = state.input.resolved_vm_location(&config.default_vm_location);
        let request = SelectionRequest {
            user_id: state.user_id,
            task_id: Some(state.task_id),
            preferred_location: Some(location.as_str()),
            preferred_size: Some(size.as_str()),
        };

        let Some(selection) = self.deps.selector.select_node_for_task(request).await? else {
            info!("No node with capacity, provisioning a new one");
            return Ok(StepOutcome::Advance(TaskStep::NodeProvisioning));
        };

        // A warm claim is ours from here on; record it before any other write
        // so a retry re-enters above instead of claiming a second node.
        let node_id = selection.node.id;
        let from_warm_pool = selection.from_warm_pool;
        state.step_results.node_id = Some(node_id);
        state.step_results.auto_provisioned = from_warm_pool;
        persist(state, ctx).await?;
        store
            .set_task_node(state.task_id, node_id, from_warm_pool)
            .await?;
        info!(
            %node_id,
            from_warm_pool,
            active_workspaces = selection.active_workspace_count,
            "Selected node"
        );
        Ok(StepOutcome::Advance(TaskStep::WorkspaceCreation))
    }

    pub(super) async fn node_provisioning(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<StepOutcome, StepError> {
        let store = &self.deps.store;
        let config = self.config();

        let node_id = match state.step_results.node_id {
            Some(node_id) => {
                let node = store
                    .get_node(node_id)
                    .await?
                    .ok_or_else(|| StepError::permanent(format!("node {node_id} not found")))?;
                match node.status {
                    NodeStatus::Running => {
                        debug!(%node_id, "Provisioned node already running");
                        return self.record_provisioned(state, node_id).await;
                    }
                    NodeStatus::Error | NodeStatus::Stopped => {
                        return Err(StepError::permanent(format!(
                            "node {node_id} is {}",
                            node.status
                        )));
                    }
                    NodeStatus::Creating => node_id,
                }
            }
            None => {
                let count = store.count_user_nodes(state.user_id).await?;
                if count >= i64::from(config.max_nodes_per_user) {
                    return Err(StepError::permanent(format!(
                        "Maximum {} nodes per user reached: node limit exceeded",
                        config.max_nodes_per_user
                    )));
                }

                let spec = NodeSpec {
                    user_id: state.user_id,
                    name: format!("node-{}", state.task_id),
                    vm_size: state.input.resolved_vm_size(&config.default_vm_size),
                    vm_location: state.input.resolved_vm_location(&config.default_vm_location),
                };
                let node_id = self.deps.provisioner.create_node_record(&spec).await?;
                state.step_results.node_id = Some(node_id);
                state.step_results.auto_provisioned = true;
                persist(state, ctx).await?;
                info!(
                    %node_id,
                    vm_size = %spec.vm_size,
                    vm_location = %spec.vm_location,
                    "Created node record"
                );
                node_id
            }
        };

        let provisioned = self.deps.provisioner.provision_node(node_id).await?;
        match provisioned.status {
            NodeStatus::Running => self.record_provisioned(state, node_id).await,
            NodeStatus::Creating => Err(StepError::transient(format!(
                "node {node_id} is still being created"
            ))),
            status => Err(StepError::permanent(format!(
                "node {node_id} provisioning ended in {status}"
            ))),
        }
    }

    async fn record_provisioned(
        &self,
        state: &mut TaskRunState,
        node_id: NodeId,
    ) -> Result<StepOutcome, StepError> {
        state.step_results.auto_provisioned = true;
        self.deps
            .store
            .set_task_node(state.task_id, node_id, true)
            .await?;
        info!(%node_id, "Node provisioned");
        Ok(StepOutcome::Advance(TaskStep::NodeAgentReady))
    }

    pub(super) async fn node_agent_ready(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<StepOutcome, StepError> {
        let config = self.config();
        let started_at = match state.agent_ready_started_at {
            Some(at) => at,
            None => {
                let now = Utc::now();
                state.agent_ready_started_at = Some(now);
                persist(state, ctx).await?;
                now
            }
        };

        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        if elapsed > config.agent_ready_timeout {
            return Err(StepError::permanent(format!(
                "Node agent not ready within {}ms",
                millis(config.agent_ready_timeout)
            )));
        }

        let node = self.require_node(state).await?;
        let probe = tokio::time::timeout(
            config.agent_probe_timeout,
            self.deps
                .node_agent
                .check_health(&node, config.agent_probe_timeout),
        )
        .await;

        match probe {
            Ok(Ok(())) => {
                info!(node_id = %node.id, elapsed_ms = elapsed.as_millis() as u64, "Node agent ready");
                Ok(StepOutcome::Advance(TaskStep::WorkspaceCreation))
            }
            Ok(Err(e)) => {
                debug!(node_id = %node.id, error = %e, "Node agent not ready yet");
                Ok(StepOutcome::PollAfter(config.agent_ready_poll_interval))
            }
            Err(_) => {
                debug!(node_id = %node.id, "Node agent health probe timed out");
                Ok(StepOutcome::PollAfter(config.agent_ready_poll_interval))
            }
        }
    }

    pub(super) async fn workspace_creation(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<StepOutcome, StepError> {
        let store = &self.deps.store;
        let config = self.config();

        // A recovery sweep may have ended the task while we were provisioning.
        match store.get_task_status(state.task_id).await? {
            Some(status) => {
                if let Some(terminal) = TaskStep::for_terminal_status(status) {
                    return Ok(StepOutcome::Aborted(terminal));
                }
            }
            None => {
                return Err(StepError::permanent(format!(
                    "task {} not found",
                    state.task_id
                )))
            }
        }

        let node = self.require_node(state).await?;
        let workspace_id = match state.step_results.workspace_id {
            Some(id) => id,
            None => {
                let id = WorkspaceId::new();
                state.step_results.workspace_id = Some(id);
                persist(state, ctx).await?;
                id
            }
        };

        store
            .create_workspace(&NewWorkspace {
                id: workspace_id,
                task_id: state.task_id,
                project_id: state.project_id,
                user_id: state.user_id,
                node_id: node.id,
                name: format!("ws-{}", state.task_id),
                repository: state.input.repository.clone(),
                branch: state.input.branch.clone(),
                vm_size: node.vm_size.clone(),
                vm_location: node.vm_location.clone(),
            })
            .await?;

        match store.find_chat_session(state.task_id).await {
            Ok(Some(chat_session_id)) => {
                if let Err(e) = store.link_chat_session(chat_session_id, workspace_id).await {
                    warn!(%chat_session_id, error = %e, "Failed to link chat session");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to look up chat session"),
        }

        let ttl = chrono::Duration::from_std(config.callback_token_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let callback_token = self
            .deps
            .signer
            .mint(workspace_id, Utc::now() + ttl)
            .map_err(|e| StepError::permanent(format!("callback token: {e}")))?;

        let request = CreateWorkspaceRequest {
            workspace_id,
            repository: state.input.repository.clone(),
            branch: state.input.branch.clone(),
            callback_token,
            installation_id: state.input.installation_id.clone(),
            git_user_name: state.input.user_name.clone(),
            git_user_email: state.input.user_email.clone(),
            github_id: state.input.github_id.clone(),
        };
        self.deps.node_agent.create_workspace(&node, &request).await?;

        if let Some(aborted) = self
            .transition_task(state, TaskStatus::Queued, TaskStatus::Delegated, Some(workspace_id))
            .await?
        {
            return Ok(aborted);
        }

        info!(%workspace_id, node_id = %node.id, "Workspace created");
        Ok(StepOutcome::Advance(TaskStep::WorkspaceReady))
    }

    pub(super) async fn workspace_ready(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<StepOutcome, StepError> {
        let started_at = match state.workspace_ready_started_at {
            Some(at) => at,
            None => {
                let now = Utc::now();
                state.workspace_ready_started_at = Some(now);
                persist(state, ctx).await?;
                now
            }
        };

        if state.workspace_ready_received {
            return match state.workspace_ready_status {
                Some(WorkspaceReadyStatus::Running) | Some(WorkspaceReadyStatus::Recovery) => {
                    Ok(StepOutcome::Advance(TaskStep::AgentSession))
                }
                Some(WorkspaceReadyStatus::Error) | None => Err(StepError::permanent(
                    state
                        .workspace_error_message
                        .clone()
                        .unwrap_or_else(|| "Workspace provisioning failed".to_string()),
                )),
            };
        }

        let timeout = self.config().workspace_ready_timeout;
        let deadline = started_at
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(1));
        if Utc::now() > deadline {
            return Err(StepError::permanent(format!(
                "Workspace not ready within {}ms",
                millis(timeout)
            )));
        }

        debug!(%deadline, "Waiting for workspace ready callback");
        Ok(StepOutcome::WaitUntil(deadline))
    }

    pub(super) async fn agent_session(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<StepOutcome, StepError> {
        let node = self.require_node(state).await?;
        let workspace_id = state
            .step_results
            .workspace_id
            .ok_or_else(|| StepError::permanent("no workspace recorded for agent session"))?;

        let session_id = match state.step_results.agent_session_id {
            Some(id) => id,
            None => {
                let id = AgentSessionId::new();
                state.step_results.agent_session_id = Some(id);
                persist(state, ctx).await?;
                id
            }
        };

        self.deps
            .store
            .create_agent_session(&NewAgentSession {
                id: session_id,
                workspace_id,
                task_id: state.task_id,
                user_id: state.user_id,
                label: state.input.task_title.clone(),
            })
            .await?;

        let request = CreateAgentSessionRequest {
            session_id,
            workspace_id,
            label: state.input.task_title.clone(),
            initial_prompt: Some(
                state
                    .input
                    .task_description
                    .clone()
                    .unwrap_or_else(|| state.input.task_title.clone()),
            ),
            output_branch: state.input.output_branch.clone(),
        };
        self.deps
            .node_agent
            .create_agent_session(&node, &request)
            .await?;

        if let Some(aborted) = self
            .transition_task(state, TaskStatus::Delegated, TaskStatus::InProgress, None)
            .await?
        {
            return Ok(aborted);
        }

        info!(%session_id, %workspace_id, "Agent session started");
        Ok(StepOutcome::Advance(match state.input.task_mode {
            TaskMode::Task => TaskStep::Running,
            TaskMode::Conversation => TaskStep::AwaitingFollowup,
        }))
    }

    /// Compare-and-set on the task status. When the row did not match, a
    /// status at or past `to` is accepted; a terminal one aborts the runner.
    async fn transition_task(
        &self,
        state: &TaskRunState,
        from: TaskStatus,
        to: TaskStatus,
        workspace_id: Option<WorkspaceId>,
    ) -> Result<Option<StepOutcome>, StepError> {
        let store = &self.deps.store;
        if store
            .transition_task_status(state.task_id, from, to, workspace_id)
            .await?
        {
            return Ok(None);
        }

        let current = store.get_task_status(state.task_id).await?;
        match current {
            Some(status) if status.is_terminal() => {
                info!(%status, "Task ended during transition");
                Ok(TaskStep::for_terminal_status(status).map(StepOutcome::Aborted))
            }
            Some(status) if status == to || already_past(status, to) => {
                debug!(%status, "Task status already advanced");
                Ok(None)
            }
            other => Err(StepError::permanent(format!(
                "cannot move task {} from {from} to {to}: status is {}",
                state.task_id,
                other.map(|s| s.to_string()).unwrap_or_else(|| "missing".to_string())
            ))),
        }
    }

    async fn require_node(&self, state: &TaskRunState) -> Result<NodeRecord, StepError> {
        let node_id = state
            .step_results
            .node_id
            .ok_or_else(|| StepError::permanent("no node recorded for task"))?;
        self.deps
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| StepError::permanent(format!("node {node_id} not found")))
    }
}
