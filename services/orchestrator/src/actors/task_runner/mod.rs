//! Task runner actor: one per task.
//!
//! Drives the provisioning workflow
//! `node_selection → node_provisioning → node_agent_ready → workspace_creation
//! → workspace_ready → agent_session → running | awaiting_followup`.
//!
//! Every step runs from the alarm handler. A step either advances (the next
//! step is scheduled immediately), re-arms the alarm for a later poll, or
//! fails. The dispatch loop is the only place that decides retry versus
//! failure. State is persisted before any alarm is armed.

mod state;
mod steps;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sam_id::TaskId;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

pub use state::{
    StepResults, TaskMode, TaskRunInput, TaskRunState, TaskStep, WorkspaceReadyStatus,
    STATE_VERSION,
};

use super::framework::{Actor, ActorContext, ActorError};
use crate::callback::CallbackSigner;
use crate::clients::{NodeAgent, Provisioner};
use crate::db::models::{TaskStatus, WorkspaceStatus};
use crate::db::ControlPlaneStore;
use crate::error::{OrchestratorError, StepError};
use crate::observability::ErrorReporter;
use crate::retry::{backoff_delay, is_transient_error};
use crate::scheduler::NodeSelector;
use crate::service::NodeLifecycle;

/// Orchestration knobs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct TaskRunnerConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub agent_ready_timeout: Duration,
    pub agent_ready_poll_interval: Duration,
    pub agent_probe_timeout: Duration,
    pub workspace_ready_timeout: Duration,
    pub max_nodes_per_user: u32,
    pub default_vm_size: String,
    pub default_vm_location: String,
    pub callback_token_ttl: Duration,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(5_000),
            retry_max_delay: Duration::from_millis(60_000),
            agent_ready_timeout: Duration::from_millis(600_000),
            agent_ready_poll_interval: Duration::from_millis(5_000),
            agent_probe_timeout: Duration::from_millis(5_000),
            workspace_ready_timeout: Duration::from_millis(600_000),
            max_nodes_per_user: 10,
            default_vm_size: "medium".to_string(),
            default_vm_location: "nbg1".to_string(),
            callback_token_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Collaborators shared by every task runner.
#[derive(Clone)]
pub struct TaskRunnerDeps {
    pub store: Arc<dyn ControlPlaneStore>,
    pub selector: Arc<NodeSelector>,
    pub lifecycle: Arc<dyn NodeLifecycle>,
    pub provisioner: Arc<dyn Provisioner>,
    pub node_agent: Arc<dyn NodeAgent>,
    pub signer: CallbackSigner,
    pub reporter: ErrorReporter,
    pub config: TaskRunnerConfig,
}

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

#[derive(Debug)]
pub enum TaskRunnerMessage {
    Start {
        input: Box<TaskRunInput>,
        reply: Reply<TaskRunState>,
    },
    AdvanceWorkspaceReady {
        status: WorkspaceReadyStatus,
        error_message: Option<String>,
        reply: Reply<bool>,
    },
    Cancel {
        reason: String,
        reply: Reply<bool>,
    },
    GetStatus {
        reply: oneshot::Sender<Option<TaskRunState>>,
    },
}

/// What a step handler decided.
#[derive(Debug, Clone, PartialEq)]
enum StepOutcome {
    /// Move to the next step; resets the retry count.
    Advance(TaskStep),
    /// Run the same step again after a steady-state poll interval.
    PollAfter(Duration),
    /// Run the same step again at a deadline unless woken earlier.
    WaitUntil(DateTime<Utc>),
    /// The task was ended outside the runner; settle on the matching step.
    Aborted(TaskStep),
}

pub struct TaskRunnerActor {
    task_id: TaskId,
    state: Option<TaskRunState>,
    deps: TaskRunnerDeps,
}

async fn persist(state: &mut TaskRunState, ctx: &ActorContext) -> Result<(), ActorError> {
    state.updated_at = Utc::now();
    ctx.save(state).await
}

impl TaskRunnerActor {
    pub fn new(task_id: TaskId, deps: TaskRunnerDeps) -> Self {
        Self {
            task_id,
            state: None,
            deps,
        }
    }

    fn config(&self) -> &TaskRunnerConfig {
        &self.deps.config
    }

    async fn start(
        &mut self,
        input: TaskRunInput,
        ctx: &mut ActorContext,
    ) -> Result<TaskRunState, OrchestratorError> {
        if self.state.is_some() {
            return Err(OrchestratorError::AlreadyInitialized {
                task_id: self.task_id,
            });
        }

        let mut state = TaskRunState::new(input);
        persist(&mut state, ctx).await?;
        self.state = Some(state.clone());
        ctx.set_alarm_in(Duration::ZERO).await?;

        info!(task_id = %self.task_id, "Task runner started");
        Ok(state)
    }

    /// Records the callback signal; wakes the runner only if it is waiting on it.
    async fn advance_workspace_ready(
        &mut self,
        status: WorkspaceReadyStatus,
        error_message: Option<String>,
        ctx: &mut ActorContext,
    ) -> Result<bool, OrchestratorError> {
        let Some(state) = self.state.as_mut().filter(|s| !s.completed) else {
            debug!(task_id = %self.task_id, "Ignoring workspace ready signal");
            return Ok(false);
        };

        state.workspace_ready_received = true;
        state.workspace_ready_status = Some(status);
        state.workspace_error_message = error_message;
        persist(state, ctx).await?;

        let waiting = state.current_step == TaskStep::WorkspaceReady;
        if waiting {
            ctx.set_alarm_in(Duration::ZERO).await?;
        }
        info!(
            task_id = %self.task_id,
            status = ?status,
            current_step = %state.current_step,
            waiting,
            "Workspace ready signal recorded"
        );
        Ok(true)
    }

    async fn cancel(
        &mut self,
        reason: String,
        ctx: &mut ActorContext,
    ) -> Result<bool, OrchestratorError> {
        let Some(mut state) = self.state.clone().filter(|s| !s.completed) else {
            return Ok(false);
        };

        let changed = self
            .deps
            .store
            .finish_task(state.task_id, TaskStatus::Cancelled, Some(&reason))
            .await?;
        if !changed {
            debug!(task_id = %self.task_id, "Task already terminal when cancelled");
        }

        state.completed = true;
        state.current_step = TaskStep::Cancelled;
        state.last_error = Some(reason.clone());
        persist(&mut state, ctx).await?;
        self.state = Some(state.clone());
        ctx.delete_alarm().await?;

        info!(task_id = %self.task_id, reason = %reason, "Task cancelled");
        self.cleanup(&state).await;
        Ok(true)
    }

    #[instrument(skip_all, fields(task_id = %state.task_id, step = %state.current_step))]
    async fn dispatch(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<(), ActorError> {
        if state.completed {
            return Ok(());
        }

        match self.run_step(state, ctx).await {
            Ok(StepOutcome::Advance(next)) => self.advance_to_step(state, next, ctx).await,
            Ok(StepOutcome::PollAfter(delay)) => ctx.set_alarm_in(delay).await,
            Ok(StepOutcome::WaitUntil(at)) => ctx.set_alarm(at).await,
            Ok(StepOutcome::Aborted(terminal)) => self.settle_aborted(state, terminal, ctx).await,
            Err(err) => self.handle_step_error(state, err, ctx).await,
        }
    }

    async fn run_step(
        &self,
        state: &mut TaskRunState,
        ctx: &mut ActorContext,
    ) -> Result<StepOutcome, StepError> {
        match state.current_step {
            TaskStep::NodeSelection => self.node_selection(state, ctx).await,
            TaskStep::NodeProvisioning => self.node_provisioning(state, ctx).await,
            TaskStep::NodeAgentReady => self.node_agent_ready(state, ctx).await,
            TaskStep::WorkspaceCreation => self.workspace_creation(state, ctx).await,
            TaskStep::WorkspaceReady => self.workspace_ready(state, ctx).await,
            TaskStep::AgentSession => self.agent_session(state, ctx).await,
            terminal => Err(StepError::permanent(format!(
                "no handler for terminal step {terminal}"
            ))),
        }
    }

    async fn advance_to_step(
        &self,
        state: &mut TaskRunState,
        next: TaskStep,
        ctx: &mut ActorContext,
    ) -> Result<(), ActorError> {
        let from = state.current_step;
        state.current_step = next;
        state.retry_count = 0;

        if next.is_terminal_success() {
            state.completed = true;
            persist(state, ctx).await?;
            ctx.delete_alarm().await?;
            info!(%from, to = %next, "Task runner finished");
            return Ok(());
        }

        persist(state, ctx).await?;
        ctx.set_alarm_in(Duration::ZERO).await?;
        info!(%from, to = %next, "Advanced step");
        Ok(())
    }

    async fn handle_step_error(
        &self,
        state: &mut TaskRunState,
        err: StepError,
        ctx: &mut ActorContext,
    ) -> Result<(), ActorError> {
        let config = self.config();
        if is_transient_error(&err) && state.retry_count < config.max_retries {
            state.retry_count += 1;
            state.last_error = Some(err.message().to_string());
            persist(state, ctx).await?;

            let delay = backoff_delay(
                state.retry_count,
                config.retry_base_delay.as_millis() as u64,
                config.retry_max_delay.as_millis() as u64,
            );
            warn!(
                retry_count = state.retry_count,
                max_retries = config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Step failed, retrying"
            );
            return ctx.set_alarm_in(delay).await;
        }

        self.fail_task(state, err.message(), ctx).await
    }

    /// Fails the task once; a task already terminal in the store is only settled.
    async fn fail_task(
        &self,
        state: &mut TaskRunState,
        message: &str,
        ctx: &mut ActorContext,
    ) -> Result<(), ActorError> {
        let external = match self.deps.store.get_task_status(state.task_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Could not read task status before failing");
                None
            }
        };
        if let Some(terminal) = external.and_then(TaskStep::for_terminal_status) {
            info!(status = %terminal, "Task already terminal, not failing again");
            return self.settle_aborted(state, terminal, ctx).await;
        }

        let failed_step = state.current_step;
        self.deps
            .reporter
            .report(
                "task_runner",
                message,
                Some(state.task_id),
                state.step_results.node_id,
                serde_json::json!({
                    "step": failed_step.as_str(),
                    "retryCount": state.retry_count,
                    "workspaceId": state.step_results.workspace_id,
                }),
            )
            .await;

        if let Err(e) = self
            .deps
            .store
            .finish_task(state.task_id, TaskStatus::Failed, Some(message))
            .await
        {
            warn!(error = %e, "Failed to mark task failed");
        }

        state.completed = true;
        state.current_step = TaskStep::Failed;
        state.last_error = Some(message.to_string());
        ctx.delete_alarm().await?;
        persist(state, ctx).await?;

        warn!(%failed_step, error = %message, "Task failed");
        self.cleanup(state).await;
        Ok(())
    }

    /// Completes with the terminal step recorded by someone else.
    async fn settle_aborted(
        &self,
        state: &mut TaskRunState,
        terminal: TaskStep,
        ctx: &mut ActorContext,
    ) -> Result<(), ActorError> {
        state.completed = true;
        state.current_step = terminal;
        ctx.delete_alarm().await?;
        persist(state, ctx).await?;

        info!(status = %terminal, "Task ended outside the runner");
        if terminal != TaskStep::Completed {
            self.cleanup(state).await;
        }
        Ok(())
    }

    /// Best-effort release of what the task acquired. Never fails.
    async fn cleanup(&self, state: &TaskRunState) {
        let store = &self.deps.store;
        let node = match state.step_results.node_id {
            Some(node_id) => store.get_node(node_id).await.ok().flatten(),
            None => None,
        };

        if let Some(workspace_id) = state.step_results.workspace_id {
            if let Some(node) = &node {
                if let Err(e) = self.deps.node_agent.delete_workspace(node, workspace_id).await {
                    warn!(%workspace_id, error = %e, "Failed to stop workspace on node");
                }
            }
            if let Err(e) = store
                .set_workspace_status(workspace_id, WorkspaceStatus::Stopped)
                .await
            {
                warn!(%workspace_id, error = %e, "Failed to mark workspace stopped");
            }
        }

        let Some(node_id) = state.step_results.node_id else {
            return;
        };
        if !state.step_results.auto_provisioned {
            return;
        }

        match self.deps.lifecycle.mark_idle(node_id, state.user_id).await {
            Ok(_) => info!(%node_id, "Released node to warm pool"),
            Err(e) => {
                warn!(%node_id, error = %e, "Failed to release node, destroying it");
                if let Err(e) = self.deps.provisioner.destroy_node(node_id).await {
                    warn!(%node_id, error = %e, "Fallback node destroy failed");
                }
                if let Err(e) = store.mark_node_stopped(node_id).await {
                    warn!(%node_id, error = %e, "Fallback node stop write failed");
                }
            }
        }
    }
}

#[async_trait]
impl Actor for TaskRunnerActor {
    type Message = TaskRunnerMessage;

    fn name(&self) -> &str {
        "task_runner"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        let Some(mut state) = ctx.load::<TaskRunState>().await? else {
            return Ok(());
        };
        if state.migrate() {
            info!(task_id = %self.task_id, version = state.version, "Upgraded task runner state");
            persist(&mut state, ctx).await?;
        }
        let resume = !state.completed && ctx.alarm().is_none();
        self.state = Some(state);

        // A crash between the state write and the alarm write loses the wake-up.
        if resume {
            ctx.set_alarm_in(Duration::ZERO).await?;
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: TaskRunnerMessage,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            TaskRunnerMessage::Start { input, reply } => {
                let _ = reply.send(self.start(*input, ctx).await);
            }
            TaskRunnerMessage::AdvanceWorkspaceReady {
                status,
                error_message,
                reply,
            } => {
                let result = self.advance_workspace_ready(status, error_message, ctx).await;
                let _ = reply.send(result);
            }
            TaskRunnerMessage::Cancel { reason, reply } => {
                let _ = reply.send(self.cancel(reason, ctx).await);
            }
            TaskRunnerMessage::GetStatus { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
        Ok(true)
    }

    async fn on_alarm(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        let Some(mut state) = self.state.take() else {
            return Ok(());
        };
        let result = self.dispatch(&mut state, ctx).await;
        self.state = Some(state);
        result
    }

    /// A finished runner with nothing scheduled has no reason to stay resident.
    fn is_idle(&self, ctx: &ActorContext) -> bool {
        ctx.alarm().is_none() && self.state.as_ref().is_some_and(|s| s.completed)
    }
}
