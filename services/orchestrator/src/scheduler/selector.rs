//! Node selection for a single task.
//!
//! Two passes, in order:
//! 1. Warm pool: claim an idle node through its lifecycle actor.
//! 2. Capacity: rank the user's running nodes by locality, size, and load.
//!
//! The two passes order candidates differently. Warm nodes rank by size
//! before location because an idle VM cannot be resized; cold placement
//! ranks by location first.

use std::cmp::Ordering;
use std::sync::Arc;

use sam_id::{TaskId, UserId};
use tracing::{debug, info, instrument, warn};

use super::scoring::{node_has_capacity, score_node_load, CapacityThresholds};
use crate::db::models::{HealthStatus, NodeRecord, NodeStatus};
use crate::db::{ControlPlaneStore, DbError};
use crate::service::NodeLifecycle;

/// What the caller is asking for.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    pub user_id: UserId,
    /// Required for the warm path.
    pub task_id: Option<TaskId>,
    pub preferred_location: Option<&'a str>,
    pub preferred_size: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSelection {
    pub node: NodeRecord,
    pub active_workspace_count: u32,
    pub from_warm_pool: bool,
}

pub struct NodeSelector {
    store: Arc<dyn ControlPlaneStore>,
    lifecycle: Option<Arc<dyn NodeLifecycle>>,
    thresholds: CapacityThresholds,
}

fn matches(preferred: Option<&str>, actual: &str) -> bool {
    preferred.is_some_and(|p| p == actual)
}

impl NodeSelector {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        lifecycle: Option<Arc<dyn NodeLifecycle>>,
        thresholds: CapacityThresholds,
    ) -> Self {
        Self {
            store,
            lifecycle,
            thresholds,
        }
    }

    /// Warm claim first, then capacity search.
    #[instrument(skip(self), fields(user_id = %request.user_id))]
    pub async fn select_node_for_task(
        &self,
        request: SelectionRequest<'_>,
    ) -> Result<Option<NodeSelection>, DbError> {
        if let Some(selection) = self.claim_warm_node(request).await? {
            return Ok(Some(selection));
        }
        self.find_node_with_capacity(request).await
    }

    /// Tries to claim one of the user's warm nodes for the task.
    ///
    /// Skipped without a lifecycle binding or a task id. Claim failures on one
    /// node move on to the next candidate.
    pub async fn claim_warm_node(
        &self,
        request: SelectionRequest<'_>,
    ) -> Result<Option<NodeSelection>, DbError> {
        let (Some(lifecycle), Some(task_id)) = (&self.lifecycle, request.task_id) else {
            return Ok(None);
        };

        let mut candidates = self.store.list_warm_nodes(request.user_id).await?;
        // Stable sort keeps store order within each tier.
        candidates.sort_by_key(|node| {
            (
                !matches(request.preferred_size, &node.vm_size),
                !matches(request.preferred_location, &node.vm_location),
            )
        });
        debug!(candidates = candidates.len(), "Warm pool candidates");

        for candidate in candidates {
            let fresh = match self.store.get_node(candidate.id).await {
                Ok(Some(node)) if node.status == NodeStatus::Running && node.warm_since.is_some() => {
                    node
                }
                Ok(_) => {
                    debug!(node_id = %candidate.id, "Warm candidate no longer warm");
                    continue;
                }
                Err(e) => {
                    warn!(node_id = %candidate.id, error = %e, "Failed to re-read warm candidate");
                    continue;
                }
            };

            match lifecycle.try_claim(fresh.id, task_id).await {
                Ok(claim) if claim.claimed => {
                    info!(node_id = %fresh.id, %task_id, "Claimed warm node");
                    return Ok(Some(NodeSelection {
                        node: fresh,
                        active_workspace_count: 0,
                        from_warm_pool: true,
                    }));
                }
                Ok(_) => debug!(node_id = %fresh.id, "Warm node claimed by another task"),
                Err(e) => warn!(node_id = %fresh.id, error = %e, "Warm claim failed"),
            }
        }

        Ok(None)
    }

    /// Picks the best running node that still has capacity.
    pub async fn find_node_with_capacity(
        &self,
        request: SelectionRequest<'_>,
    ) -> Result<Option<NodeSelection>, DbError> {
        let nodes = self.store.list_running_nodes(request.user_id).await?;

        let mut candidates = Vec::new();
        for node in nodes {
            if node.health_status == Some(HealthStatus::Unhealthy) {
                continue;
            }
            let active = self.store.count_active_workspaces(node.id).await?;
            let active = u32::try_from(active).unwrap_or(u32::MAX);
            if node_has_capacity(node.metrics.as_ref(), active, &self.thresholds) {
                candidates.push((node, active));
            }
        }

        candidates.sort_by(|(a, _), (b, _)| {
            let location = |n: &NodeRecord| !matches(request.preferred_location, &n.vm_location);
            let size = |n: &NodeRecord| !matches(request.preferred_size, &n.vm_size);
            location(a)
                .cmp(&location(b))
                .then_with(|| size(a).cmp(&size(b)))
                .then_with(|| {
                    compare_scores(
                        score_node_load(a.metrics.as_ref()),
                        score_node_load(b.metrics.as_ref()),
                    )
                })
        });

        Ok(candidates
            .into_iter()
            .next()
            .map(|(node, active_workspace_count)| NodeSelection {
                node,
                active_workspace_count,
                from_warm_pool: false,
            }))
    }
}

/// Ascending load; nodes without a score sort last.
fn compare_scores(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::node_lifecycle::{ClaimResult, NodeLifecycleState};
    use crate::db::models::{NewWorkspace, NodeMetrics, WorkspaceStatus};
    use crate::db::MemoryStore;
    use crate::error::OrchestratorError;
    use async_trait::async_trait;
    use chrono::Utc;
    use sam_id::{NodeId, ProjectId, WorkspaceId};
    use std::sync::Mutex;

    fn node(user_id: UserId, size: &str, location: &str, metrics: Option<(f64, f64)>) -> NodeRecord {
        NodeRecord {
            id: NodeId::new(),
            user_id,
            name: format!("{size}-{location}"),
            status: NodeStatus::Running,
            health_status: Some(HealthStatus::Healthy),
            vm_size: size.to_string(),
            vm_location: location.to_string(),
            ip_address: Some("10.0.0.2".to_string()),
            metrics: metrics.map(|(cpu, mem)| NodeMetrics {
                cpu_load_avg1: Some(cpu),
                memory_percent: Some(mem),
                disk_percent: None,
            }),
            warm_since: None,
            created_at: Utc::now(),
        }
    }

    fn request(user_id: UserId, task_id: Option<TaskId>) -> SelectionRequest<'static> {
        SelectionRequest {
            user_id,
            task_id,
            preferred_location: Some("fsn1"),
            preferred_size: Some("large"),
        }
    }

    /// Claims nodes listed in `grant`, records every attempt.
    #[derive(Default)]
    struct ScriptedLifecycle {
        grant: Vec<NodeId>,
        fail: Vec<NodeId>,
        attempts: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl NodeLifecycle for ScriptedLifecycle {
        async fn mark_idle(
            &self,
            _node_id: NodeId,
            _user_id: UserId,
        ) -> Result<NodeLifecycleState, OrchestratorError> {
            unimplemented!()
        }

        async fn mark_active(
            &self,
            _node_id: NodeId,
            _user_id: UserId,
        ) -> Result<NodeLifecycleState, OrchestratorError> {
            unimplemented!()
        }

        async fn try_claim(
            &self,
            node_id: NodeId,
            _task_id: TaskId,
        ) -> Result<ClaimResult, OrchestratorError> {
            self.attempts.lock().unwrap().push(node_id);
            if self.fail.contains(&node_id) {
                return Err(OrchestratorError::Actor(crate::actors::ActorError::ActorStopped));
            }
            Ok(ClaimResult {
                claimed: self.grant.contains(&node_id),
                state: None,
            })
        }

        async fn get_status(
            &self,
            _node_id: NodeId,
        ) -> Result<Option<NodeLifecycleState>, OrchestratorError> {
            Ok(None)
        }
    }

    fn selector(store: Arc<MemoryStore>, lifecycle: Option<Arc<ScriptedLifecycle>>) -> NodeSelector {
        NodeSelector::new(
            store,
            lifecycle.map(|l| l as Arc<dyn NodeLifecycle>),
            CapacityThresholds::default(),
        )
    }

    #[tokio::test]
    async fn test_capacity_prefers_location_then_size_then_load() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let wrong_location = node(user, "large", "nbg1", Some((1.0, 1.0)));
        let right_location_busy = node(user, "large", "fsn1", Some((50.0, 50.0)));
        let right_location_idle = node(user, "large", "fsn1", Some((5.0, 5.0)));
        let right_location_small = node(user, "small", "fsn1", Some((0.0, 0.0)));
        for n in [&wrong_location, &right_location_busy, &right_location_small, &right_location_idle] {
            store.put_node(n.clone());
        }

        let selection = selector(store, None)
            .find_node_with_capacity(request(user, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.node.id, right_location_idle.id);
        assert!(!selection.from_warm_pool);
    }

    #[tokio::test]
    async fn test_capacity_ranks_missing_metrics_last() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let unknown = node(user, "large", "fsn1", None);
        let loaded = node(user, "large", "fsn1", Some((70.0, 70.0)));
        store.put_node(unknown);
        store.put_node(loaded.clone());

        let selection = selector(store, None)
            .find_node_with_capacity(request(user, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.node.id, loaded.id);
    }

    #[tokio::test]
    async fn test_capacity_skips_unhealthy_and_full_nodes() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let mut unhealthy = node(user, "large", "fsn1", Some((1.0, 1.0)));
        unhealthy.health_status = Some(HealthStatus::Unhealthy);
        let hot = node(user, "large", "fsn1", Some((85.0, 1.0)));
        let full = node(user, "large", "fsn1", None);
        store.put_node(unhealthy);
        store.put_node(hot);
        store.put_node(full.clone());
        for _ in 0..10 {
            store.put_workspace(
                NewWorkspace {
                    id: WorkspaceId::new(),
                    task_id: TaskId::new(),
                    project_id: ProjectId::new(),
                    user_id: user,
                    node_id: full.id,
                    name: "ws".to_string(),
                    repository: "acme/app".to_string(),
                    branch: "main".to_string(),
                    vm_size: "large".to_string(),
                    vm_location: "fsn1".to_string(),
                },
                WorkspaceStatus::Running,
            );
        }

        let selection = selector(store, None)
            .find_node_with_capacity(request(user, None))
            .await
            .unwrap();
        assert!(selection.is_none());
    }

    #[tokio::test]
    async fn test_warm_ordering_is_size_then_location() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let mut location_only = node(user, "small", "fsn1", None);
        let mut size_only = node(user, "large", "nbg1", None);
        location_only.warm_since = Some(Utc::now());
        size_only.warm_since = Some(Utc::now());
        store.put_node(location_only.clone());
        store.put_node(size_only.clone());

        let lifecycle = Arc::new(ScriptedLifecycle::default());
        let result = selector(store, Some(lifecycle.clone()))
            .claim_warm_node(request(user, Some(TaskId::new())))
            .await
            .unwrap();
        assert!(result.is_none());
        // Warm pool ranks size first, unlike the capacity pass.
        assert_eq!(
            *lifecycle.attempts.lock().unwrap(),
            vec![size_only.id, location_only.id]
        );
    }

    #[tokio::test]
    async fn test_warm_claim_continues_past_failures() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let mut broken = node(user, "large", "fsn1", None);
        let mut good = node(user, "large", "fsn1", None);
        broken.warm_since = Some(Utc::now());
        good.warm_since = Some(Utc::now());
        store.put_node(broken.clone());
        store.put_node(good.clone());

        let lifecycle = Arc::new(ScriptedLifecycle {
            grant: vec![good.id],
            fail: vec![broken.id],
            ..Default::default()
        });
        let selection = selector(store, Some(lifecycle))
            .select_node_for_task(request(user, Some(TaskId::new())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.node.id, good.id);
        assert!(selection.from_warm_pool);
        assert_eq!(selection.active_workspace_count, 0);
    }

    #[tokio::test]
    async fn test_warm_path_needs_task_id() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let mut warm = node(user, "large", "fsn1", None);
        warm.warm_since = Some(Utc::now());
        store.put_node(warm.clone());

        let lifecycle = Arc::new(ScriptedLifecycle {
            grant: vec![warm.id],
            ..Default::default()
        });
        let selection = selector(store, Some(lifecycle.clone()))
            .select_node_for_task(request(user, None))
            .await
            .unwrap()
            .unwrap();
        assert!(!selection.from_warm_pool);
        assert!(lifecycle.attempts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_compare_scores_none_last() {
        assert_eq!(compare_scores(Some(90.0), None), Ordering::Less);
        assert_eq!(compare_scores(None, Some(0.0)), Ordering::Greater);
        assert_eq!(compare_scores(Some(1.0), Some(2.0)), Ordering::Less);
    }
}
