//! Node lifecycle actor: one per physical node.
//!
//! Owns the warm-pool state machine:
//!
//! ```text
//! active --mark_idle--> warm --alarm--> destroying
//!   ^                    |
//!   +---try_claim--------+
//! ```
//!
//! The actor is the source of truth; the node row's `warm_since` column is a
//! mirror refreshed on every transition so warm-pool queries see it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sam_id::{NodeId, TaskId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::clients::Provisioner;
use crate::db::ControlPlaneStore;
use crate::error::OrchestratorError;

#[derive(Debug, Clone)]
pub struct NodeLifecycleConfig {
    /// How long an idle node stays claimable before teardown.
    pub warm_timeout: Duration,
    /// Delay before retrying a failed teardown write.
    pub teardown_retry: Duration,
}

impl Default for NodeLifecycleConfig {
    fn default() -> Self {
        Self {
            warm_timeout: Duration::from_secs(30 * 60),
            teardown_retry: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Warm,
    Destroying,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Warm => "warm",
            Self::Destroying => "destroying",
        }
    }
}

/// Persisted lifecycle state. `warm_since` is set exactly when `status` is warm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLifecycleState {
    pub node_id: NodeId,
    pub user_id: UserId,
    pub status: LifecycleStatus,
    pub warm_since: Option<DateTime<Utc>>,
    pub claimed_by_task: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResult {
    pub claimed: bool,
    pub state: Option<NodeLifecycleState>,
}

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

#[derive(Debug)]
pub enum NodeLifecycleMessage {
    MarkIdle {
        user_id: UserId,
        reply: Reply<NodeLifecycleState>,
    },
    MarkActive {
        user_id: UserId,
        reply: Reply<NodeLifecycleState>,
    },
    TryClaim {
        task_id: TaskId,
        reply: Reply<ClaimResult>,
    },
    GetStatus {
        reply: oneshot::Sender<Option<NodeLifecycleState>>,
    },
}

pub struct NodeLifecycleActor {
    node_id: NodeId,
    state: Option<NodeLifecycleState>,
    store: Arc<dyn ControlPlaneStore>,
    provisioner: Arc<dyn Provisioner>,
    config: NodeLifecycleConfig,
}

impl NodeLifecycleActor {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn ControlPlaneStore>,
        provisioner: Arc<dyn Provisioner>,
        config: NodeLifecycleConfig,
    ) -> Self {
        Self {
            node_id,
            state: None,
            store,
            provisioner,
            config,
        }
    }

    fn conflict(&self, status: LifecycleStatus) -> OrchestratorError {
        OrchestratorError::NodeLifecycleConflict {
            node_id: self.node_id,
            status: status.as_str().to_string(),
        }
    }

    fn state_or_new(&self, user_id: UserId) -> NodeLifecycleState {
        self.state.clone().unwrap_or(NodeLifecycleState {
            node_id: self.node_id,
            user_id,
            status: LifecycleStatus::Active,
            warm_since: None,
            claimed_by_task: None,
        })
    }

    #[instrument(skip(self, ctx), fields(node_id = %self.node_id))]
    async fn mark_idle(
        &mut self,
        user_id: UserId,
        ctx: &mut ActorContext,
    ) -> Result<NodeLifecycleState, OrchestratorError> {
        let mut state = self.state_or_new(user_id);
        match state.status {
            LifecycleStatus::Destroying => return Err(self.conflict(state.status)),
            LifecycleStatus::Warm => {
                debug!("Node already warm");
                return Ok(state);
            }
            LifecycleStatus::Active => {}
        }

        let now = Utc::now();
        state.status = LifecycleStatus::Warm;
        state.warm_since = Some(now);
        state.claimed_by_task = None;

        // Nothing is committed until the mirror write lands, so a failure
        // leaves the node active with no warm timer behind it.
        self.store.set_node_warm_since(self.node_id, Some(now)).await?;
        if let Err(e) = ctx.save(&state).await {
            if let Err(clear) = self.store.set_node_warm_since(self.node_id, None).await {
                warn!(error = %clear, "Failed to clear warm mirror");
            }
            return Err(e.into());
        }
        self.state = Some(state.clone());
        ctx.set_alarm_in(self.config.warm_timeout).await?;

        info!(
            warm_timeout_ms = self.config.warm_timeout.as_millis() as u64,
            "Node entered warm pool"
        );
        Ok(state)
    }

    #[instrument(skip(self, ctx), fields(node_id = %self.node_id))]
    async fn mark_active(
        &mut self,
        user_id: UserId,
        ctx: &mut ActorContext,
    ) -> Result<NodeLifecycleState, OrchestratorError> {
        let mut state = self.state_or_new(user_id);
        if state.status == LifecycleStatus::Destroying {
            return Err(self.conflict(state.status));
        }

        state.status = LifecycleStatus::Active;
        state.warm_since = None;
        state.claimed_by_task = None;

        ctx.save(&state).await?;
        self.state = Some(state.clone());
        ctx.delete_alarm().await?;
        self.store.set_node_warm_since(self.node_id, None).await?;

        debug!("Node marked active");
        Ok(state)
    }

    #[instrument(skip(self, ctx), fields(node_id = %self.node_id))]
    async fn try_claim(
        &mut self,
        task_id: TaskId,
        ctx: &mut ActorContext,
    ) -> Result<ClaimResult, OrchestratorError> {
        let Some(mut state) = self.state.clone().filter(|s| s.status == LifecycleStatus::Warm)
        else {
            return Ok(ClaimResult {
                claimed: false,
                state: self.state.clone(),
            });
        };

        state.status = LifecycleStatus::Active;
        state.warm_since = None;
        state.claimed_by_task = Some(task_id);

        ctx.save(&state).await?;
        self.state = Some(state.clone());
        ctx.delete_alarm().await?;

        // The selector re-checks freshness, so a stale mirror is tolerated.
        if let Err(e) = self.store.set_node_warm_since(self.node_id, None).await {
            warn!(error = %e, "Failed to clear warm mirror after claim");
        }

        info!(%task_id, "Warm node claimed");
        Ok(ClaimResult {
            claimed: true,
            state: Some(state),
        })
    }

    /// Mirrors the stop, then asks the provisioner to destroy the VM.
    async fn teardown(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        if let Err(e) = self.store.mark_node_stopped(self.node_id).await {
            warn!(
                node_id = %self.node_id,
                error = %e,
                retry_ms = self.config.teardown_retry.as_millis() as u64,
                "Failed to mark node stopped, retrying"
            );
            ctx.set_alarm_in(self.config.teardown_retry).await?;
            return Ok(());
        }

        if let Err(e) = self.provisioner.destroy_node(self.node_id).await {
            warn!(node_id = %self.node_id, error = %e, "Failed to destroy node VM");
        }
        info!(node_id = %self.node_id, "Warm node torn down");
        Ok(())
    }
}

#[async_trait]
impl Actor for NodeLifecycleActor {
    type Message = NodeLifecycleMessage;

    fn name(&self) -> &str {
        "node_lifecycle"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        self.state = ctx.load().await?;
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: NodeLifecycleMessage,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            NodeLifecycleMessage::MarkIdle { user_id, reply } => {
                let _ = reply.send(self.mark_idle(user_id, ctx).await);
            }
            NodeLifecycleMessage::MarkActive { user_id, reply } => {
                let _ = reply.send(self.mark_active(user_id, ctx).await);
            }
            NodeLifecycleMessage::TryClaim { task_id, reply } => {
                let _ = reply.send(self.try_claim(task_id, ctx).await);
            }
            NodeLifecycleMessage::GetStatus { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
        Ok(true)
    }

    async fn on_alarm(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        let status = state.status;
        match status {
            LifecycleStatus::Active => {
                debug!(node_id = %self.node_id, "Alarm after claim, ignoring");
                Ok(())
            }
            LifecycleStatus::Warm => {
                state.status = LifecycleStatus::Destroying;
                state.warm_since = None;
                let snapshot = state.clone();
                ctx.save(&snapshot).await?;
                info!(node_id = %self.node_id, "Warm timeout elapsed, destroying node");
                self.teardown(ctx).await
            }
            LifecycleStatus::Destroying => self.teardown(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::framework::{run_actor_loop, ActorHandle};
    use crate::clients::mock::MockProvisioner;
    use crate::db::models::{NodeRecord, NodeStatus};
    use crate::db::{ActorStateStore, MemoryStore};
    use tokio::sync::{mpsc, watch};

    struct Harness {
        store: Arc<MemoryStore>,
        provisioner: Arc<MockProvisioner>,
        handle: ActorHandle<NodeLifecycleMessage>,
        node_id: NodeId,
        user_id: UserId,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(config: NodeLifecycleConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(MockProvisioner::new(store.clone()));
        let user_id = UserId::new();
        let node_id = NodeId::new();
        store.put_node(NodeRecord {
            id: node_id,
            user_id,
            name: "node".to_string(),
            status: NodeStatus::Running,
            health_status: None,
            vm_size: "medium".to_string(),
            vm_location: "nbg1".to_string(),
            ip_address: Some("10.0.0.3".to_string()),
            metrics: None,
            warm_since: None,
            created_at: Utc::now(),
        });

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let key = format!("node:{node_id}");
        let ctx = ActorContext::new(key.clone(), store.clone(), shutdown_rx);
        let actor = NodeLifecycleActor::new(node_id, store.clone(), provisioner.clone(), config);
        tokio::spawn(run_actor_loop(actor, rx, ctx));

        Harness {
            store,
            provisioner,
            handle: ActorHandle::new(tx, key),
            node_id,
            user_id,
            _shutdown: shutdown_tx,
        }
    }

    impl Harness {
        async fn mark_idle(&self) -> Result<NodeLifecycleState, OrchestratorError> {
            let user_id = self.user_id;
            self.handle
                .call(|reply| NodeLifecycleMessage::MarkIdle { user_id, reply })
                .await
                .unwrap()
        }

        async fn mark_active(&self) -> Result<NodeLifecycleState, OrchestratorError> {
            let user_id = self.user_id;
            self.handle
                .call(|reply| NodeLifecycleMessage::MarkActive { user_id, reply })
                .await
                .unwrap()
        }

        async fn try_claim(&self, task_id: TaskId) -> ClaimResult {
            self.handle
                .call(|reply| NodeLifecycleMessage::TryClaim { task_id, reply })
                .await
                .unwrap()
                .unwrap()
        }

        async fn status(&self) -> Option<NodeLifecycleState> {
            self.handle
                .call(|reply| NodeLifecycleMessage::GetStatus { reply })
                .await
                .unwrap()
        }
    }

    fn long_warm() -> NodeLifecycleConfig {
        NodeLifecycleConfig {
            warm_timeout: Duration::from_secs(3600),
            teardown_retry: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_mark_idle_mirrors_warm_since() {
        let h = harness(long_warm());
        let state = h.mark_idle().await.unwrap();
        assert_eq!(state.status, LifecycleStatus::Warm);
        assert!(state.warm_since.is_some());
        assert_eq!(h.store.node(h.node_id).unwrap().warm_since, state.warm_since);

        // Idempotent while warm.
        let again = h.mark_idle().await.unwrap();
        assert_eq!(again.warm_since, state.warm_since);
    }

    #[tokio::test]
    async fn test_mark_idle_mirror_failure_leaves_node_active() {
        let h = harness(NodeLifecycleConfig {
            warm_timeout: Duration::from_millis(20),
            teardown_retry: Duration::from_millis(20),
        });
        h.mark_active().await.unwrap();
        h.store.inject_failure("set_node_warm_since", 1);

        assert!(h.mark_idle().await.is_err());
        let state = h.status().await.unwrap();
        assert_eq!(state.status, LifecycleStatus::Active);
        assert!(state.warm_since.is_none());
        let key = h.handle.actor_key();
        assert!(h.store.load_alarm(key).await.unwrap().is_none());
        assert!(h.store.node(h.node_id).unwrap().warm_since.is_none());

        // No timer was left behind to destroy the node.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.provisioner.destroyed().is_empty());
        assert_eq!(h.store.node(h.node_id).unwrap().status, NodeStatus::Running);

        assert_eq!(h.mark_idle().await.unwrap().status, LifecycleStatus::Warm);
    }

    #[tokio::test]
    async fn test_mark_idle_state_write_failure_clears_mirror() {
        let h = harness(long_warm());
        h.store.inject_failure("save_state", 1);

        assert!(h.mark_idle().await.is_err());
        assert!(h.status().await.is_none());
        assert!(h.store.node(h.node_id).unwrap().warm_since.is_none());
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let h = harness(long_warm());
        h.mark_idle().await.unwrap();

        let first_task = TaskId::new();
        let first = h.try_claim(first_task).await;
        let second = h.try_claim(TaskId::new()).await;

        assert!(first.claimed);
        assert!(!second.claimed);
        let state = h.status().await.unwrap();
        assert_eq!(state.status, LifecycleStatus::Active);
        assert_eq!(state.claimed_by_task, Some(first_task));
        assert!(state.warm_since.is_none());
        assert!(h.store.node(h.node_id).unwrap().warm_since.is_none());
    }

    #[tokio::test]
    async fn test_claim_unknown_node_is_refused() {
        let h = harness(long_warm());
        let result = h.try_claim(TaskId::new()).await;
        assert!(!result.claimed);
        assert!(result.state.is_none());
    }

    #[tokio::test]
    async fn test_warm_timeout_tears_down() {
        let h = harness(NodeLifecycleConfig {
            warm_timeout: Duration::from_millis(20),
            teardown_retry: Duration::from_millis(20),
        });
        h.mark_idle().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let state = h.status().await.unwrap();
        assert_eq!(state.status, LifecycleStatus::Destroying);
        assert!(state.warm_since.is_none());
        let node = h.store.node(h.node_id).unwrap();
        assert_eq!(node.status, NodeStatus::Stopped);
        assert!(node.warm_since.is_none());
        assert_eq!(h.provisioner.destroyed(), vec![h.node_id]);

        let err = h.mark_idle().await.unwrap_err();
        assert_eq!(err.code(), "node_lifecycle_conflict");
        let err = h.mark_active().await.unwrap_err();
        assert_eq!(err.code(), "node_lifecycle_conflict");
        assert!(!h.try_claim(TaskId::new()).await.claimed);
    }

    #[tokio::test]
    async fn test_teardown_write_failure_retries() {
        let h = harness(NodeLifecycleConfig {
            warm_timeout: Duration::from_millis(10),
            teardown_retry: Duration::from_millis(20),
        });
        h.store.inject_failure("mark_node_stopped", 2);
        h.mark_idle().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(h.store.node(h.node_id).unwrap().status, NodeStatus::Stopped);
        assert_eq!(h.provisioner.destroyed(), vec![h.node_id]);
    }

    #[tokio::test]
    async fn test_claim_cancels_timer() {
        let h = harness(NodeLifecycleConfig {
            warm_timeout: Duration::from_millis(30),
            teardown_retry: Duration::from_millis(20),
        });
        h.mark_idle().await.unwrap();
        assert!(h.try_claim(TaskId::new()).await.claimed);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.status().await.unwrap().status, LifecycleStatus::Active);
        assert_eq!(h.store.node(h.node_id).unwrap().status, NodeStatus::Running);
        assert!(h.provisioner.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_mark_active_clears_warm() {
        let h = harness(long_warm());
        h.mark_idle().await.unwrap();
        let state = h.mark_active().await.unwrap();
        assert_eq!(state.status, LifecycleStatus::Active);
        assert!(state.warm_since.is_none());
        assert!(h.store.node(h.node_id).unwrap().warm_since.is_none());
    }
}
