//! Shared harness: the real actors over the in-memory store with mock
//! collaborators and millisecond timeouts.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sam_id::{NodeId, ProjectId, TaskId, UserId};
use sam_orchestrator::actors::node_lifecycle::NodeLifecycleConfig;
use sam_orchestrator::actors::task_runner::{
    TaskMode, TaskRunInput, TaskRunState, TaskRunnerConfig, TaskRunnerDeps,
};
use sam_orchestrator::callback::CallbackSigner;
use sam_orchestrator::clients::mock::{MockNodeAgent, MockProvisioner};
use sam_orchestrator::db::models::{HealthStatus, NodeMetrics, NodeRecord, NodeStatus, TaskStatus};
use sam_orchestrator::db::MemoryStore;
use sam_orchestrator::observability::ErrorReporter;
use sam_orchestrator::scheduler::{CapacityThresholds, NodeSelector};
use sam_orchestrator::service::{NodeLifecycle, NodeLifecycleService, TaskRunnerService};

pub const CALLBACK_SECRET: &str = "test-callback-secret";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sam_orchestrator=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Orchestration knobs scaled down to milliseconds.
pub fn fast_config() -> TaskRunnerConfig {
    TaskRunnerConfig {
        max_retries: 3,
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(50),
        agent_ready_timeout: Duration::from_secs(5),
        agent_ready_poll_interval: Duration::from_millis(10),
        agent_probe_timeout: Duration::from_millis(10),
        workspace_ready_timeout: Duration::from_secs(5),
        max_nodes_per_user: 10,
        default_vm_size: "medium".to_string(),
        default_vm_location: "nbg1".to_string(),
        callback_token_ttl: Duration::from_secs(3600),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provisioner: Arc<MockProvisioner>,
    pub node_agent: Arc<MockNodeAgent>,
    pub lifecycle: Arc<NodeLifecycleService>,
    pub runners: Arc<TaskRunnerService>,
    pub signer: CallbackSigner,
    pub user_id: UserId,
    deps: TaskRunnerDeps,
}

impl Harness {
    pub fn new(config: TaskRunnerConfig) -> Self {
        Self::with_agent(config, MockNodeAgent::new())
    }

    pub fn with_agent(config: TaskRunnerConfig, node_agent: MockNodeAgent) -> Self {
        Self::with_collaborators(config, node_agent, |provisioner| provisioner)
    }

    /// Lets a test script the provisioner before it is wired in.
    pub fn with_collaborators(
        config: TaskRunnerConfig,
        node_agent: MockNodeAgent,
        provisioner: impl FnOnce(MockProvisioner) -> MockProvisioner,
    ) -> Self {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(provisioner(MockProvisioner::new(store.clone())));
        let node_agent = Arc::new(node_agent);
        let lifecycle = Arc::new(NodeLifecycleService::new(
            store.clone(),
            store.clone(),
            provisioner.clone(),
            NodeLifecycleConfig::default(),
        ));
        let lifecycle_dyn: Arc<dyn NodeLifecycle> = lifecycle.clone();
        let selector = Arc::new(NodeSelector::new(
            store.clone(),
            Some(lifecycle_dyn.clone()),
            CapacityThresholds::default(),
        ));
        let signer = CallbackSigner::new(CALLBACK_SECRET);

        let deps = TaskRunnerDeps {
            store: store.clone(),
            selector,
            lifecycle: lifecycle_dyn,
            provisioner: provisioner.clone(),
            node_agent: node_agent.clone(),
            signer: signer.clone(),
            reporter: ErrorReporter::new(store.clone()),
            config,
        };
        let runners = Arc::new(TaskRunnerService::new(store.clone(), deps.clone()));

        Self {
            store,
            provisioner,
            node_agent,
            lifecycle,
            runners,
            signer,
            user_id: UserId::new(),
            deps,
        }
    }

    /// A fresh runner service over the same stores, as after a restart.
    pub fn restarted_runners(&self) -> TaskRunnerService {
        TaskRunnerService::new(self.store.clone(), self.deps.clone())
    }

    /// Seeds a healthy running node under every capacity threshold.
    pub fn running_node(&self) -> NodeId {
        let node_id = NodeId::new();
        self.store.put_node(NodeRecord {
            id: node_id,
            user_id: self.user_id,
            name: "existing".to_string(),
            status: NodeStatus::Running,
            health_status: Some(HealthStatus::Healthy),
            vm_size: "medium".to_string(),
            vm_location: "nbg1".to_string(),
            ip_address: Some("10.0.0.7".to_string()),
            metrics: Some(NodeMetrics {
                cpu_load_avg1: Some(20.0),
                memory_percent: Some(30.0),
                disk_percent: Some(10.0),
            }),
            warm_since: None,
            created_at: Utc::now(),
        });
        node_id
    }

    /// Overrides a seeded node's load.
    pub fn set_load(&self, node_id: NodeId, cpu: f64, memory: f64) {
        let mut node = self.store.node(node_id).expect("seeded node");
        node.metrics = Some(NodeMetrics {
            cpu_load_avg1: Some(cpu),
            memory_percent: Some(memory),
            disk_percent: Some(10.0),
        });
        self.store.put_node(node);
    }

    /// A queued task row plus matching runner input.
    pub fn queued_task(&self) -> TaskRunInput {
        let task_id = TaskId::new();
        self.store.put_task(task_id, TaskStatus::Queued);
        TaskRunInput {
            task_id,
            project_id: ProjectId::new(),
            user_id: self.user_id,
            vm_size: None,
            vm_location: None,
            branch: "main".to_string(),
            preferred_node_id: None,
            repository: "acme/widgets".to_string(),
            installation_id: Some("42".to_string()),
            task_title: "Fix flaky test".to_string(),
            task_description: Some("The login test fails on CI".to_string()),
            output_branch: Some("sam/fix-flaky-test".to_string()),
            user_name: Some("Dev".to_string()),
            user_email: Some("dev@example.com".to_string()),
            github_id: None,
            project_default_vm_size: None,
            task_mode: TaskMode::Task,
        }
    }

    pub async fn status(&self, task_id: TaskId) -> TaskRunState {
        self.runners
            .get_status(task_id)
            .await
            .unwrap()
            .expect("runner state")
    }

    /// Polls the runner until `done` holds, failing after five seconds.
    pub async fn wait_for(
        &self,
        task_id: TaskId,
        what: &str,
        done: impl Fn(&TaskRunState) -> bool,
    ) -> TaskRunState {
        let runners = self.runners.clone();
        eventually(what, || {
            let runners = runners.clone();
            async move { runners.get_status(task_id).await.unwrap() }
        }, |state| state.as_ref().is_some_and(&done))
        .await
        .expect("runner state")
    }
}

/// Polls `poll` until `done` accepts its output.
pub async fn eventually<T, F, Fut>(what: &str, poll: F, done: impl Fn(&T) -> bool) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let value = poll().await;
        if done(&value) {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
