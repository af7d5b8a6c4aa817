//! Orchestrator configuration.
//!
//! Every knob is resolved once at startup into explicit structs that are
//! threaded into actor construction; nothing below reads the environment
//! after `Config::from_env` returns.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::actors::node_lifecycle::NodeLifecycleConfig;
use crate::actors::task_runner::TaskRunnerConfig;
use crate::db::DbConfig;
use crate::scheduler::CapacityThresholds;

/// Default node-agent port on provisioned VMs.
pub const DEFAULT_NODE_AGENT_PORT: u16 = 8083;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    /// Secret used to sign workspace callback tokens.
    pub callback_secret: String,
    /// Port the node agent listens on inside each VM.
    pub node_agent_port: u16,
    /// Address the dev provisioner reports for every node.
    pub dev_node_address: String,
    pub task_runner: TaskRunnerConfig,
    pub capacity: CapacityThresholds,
    pub node_lifecycle: NodeLifecycleConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let int = |key: &str, fallback: u64, max: u64| {
            parse_bounded_int(lookup(key).as_deref(), fallback, max)
        };
        let millis = |key: &str, fallback: u64| Duration::from_millis(int(key, fallback, MAX_MS));

        let listen_addr = lookup("SAM_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("SAM_LISTEN_ADDR is not a socket address")?;

        let log_level = lookup("SAM_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("SAM_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let callback_secret = match lookup("SAM_CALLBACK_SECRET") {
            Some(secret) if !secret.is_empty() => secret,
            _ if dev_mode => "dev-callback-secret".to_string(),
            _ => anyhow::bail!("SAM_CALLBACK_SECRET must be set outside dev mode"),
        };

        let node_agent_port = int(
            "SAM_NODE_AGENT_PORT",
            u64::from(DEFAULT_NODE_AGENT_PORT),
            u64::from(u16::MAX),
        ) as u16;

        let dev_node_address =
            lookup("SAM_DEV_NODE_ADDRESS").unwrap_or_else(|| "127.0.0.1".to_string());

        let defaults = TaskRunnerConfig::default();
        let task_runner = TaskRunnerConfig {
            max_retries: int("SAM_TASK_MAX_RETRIES", u64::from(defaults.max_retries), 100) as u32,
            retry_base_delay: millis(
                "SAM_TASK_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            ),
            retry_max_delay: millis(
                "SAM_TASK_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay.as_millis() as u64,
            ),
            agent_ready_timeout: millis(
                "SAM_AGENT_READY_TIMEOUT_MS",
                defaults.agent_ready_timeout.as_millis() as u64,
            ),
            agent_ready_poll_interval: millis(
                "SAM_AGENT_READY_POLL_MS",
                defaults.agent_ready_poll_interval.as_millis() as u64,
            ),
            agent_probe_timeout: millis(
                "SAM_AGENT_PROBE_TIMEOUT_MS",
                defaults.agent_probe_timeout.as_millis() as u64,
            ),
            workspace_ready_timeout: millis(
                "SAM_WORKSPACE_READY_TIMEOUT_MS",
                defaults.workspace_ready_timeout.as_millis() as u64,
            ),
            max_nodes_per_user: int(
                "SAM_MAX_NODES_PER_USER",
                u64::from(defaults.max_nodes_per_user),
                10_000,
            ) as u32,
            default_vm_size: lookup("SAM_DEFAULT_VM_SIZE").unwrap_or(defaults.default_vm_size),
            default_vm_location: lookup("SAM_DEFAULT_VM_LOCATION")
                .unwrap_or(defaults.default_vm_location),
            callback_token_ttl: millis(
                "SAM_CALLBACK_TOKEN_TTL_MS",
                defaults.callback_token_ttl.as_millis() as u64,
            ),
        };

        let thresholds = CapacityThresholds::default();
        let capacity = CapacityThresholds {
            max_workspaces: int(
                "SAM_MAX_WORKSPACES_PER_NODE",
                u64::from(thresholds.max_workspaces),
                10_000,
            ) as u32,
            cpu_threshold: int("SAM_NODE_CPU_THRESHOLD", thresholds.cpu_threshold as u64, 10_000)
                as f64,
            memory_threshold: int(
                "SAM_NODE_MEMORY_THRESHOLD",
                thresholds.memory_threshold as u64,
                100,
            ) as f64,
        };

        let lifecycle = NodeLifecycleConfig::default();
        let node_lifecycle = NodeLifecycleConfig {
            warm_timeout: millis(
                "SAM_NODE_WARM_TIMEOUT_MS",
                lifecycle.warm_timeout.as_millis() as u64,
            ),
            teardown_retry: millis(
                "SAM_NODE_TEARDOWN_RETRY_MS",
                lifecycle.teardown_retry.as_millis() as u64,
            ),
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database: DbConfig::from_lookup(&lookup),
            callback_secret,
            node_agent_port,
            dev_node_address,
            task_runner,
            capacity,
            node_lifecycle,
        })
    }
}

/// Upper bound for any millisecond knob (one week).
const MAX_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Parses a positive integer no larger than `max`, falling back otherwise.
///
/// Absent, non-numeric, zero, negative, and out-of-range values all yield
/// `fallback`.
pub fn parse_bounded_int(raw: Option<&str>, fallback: u64, max: u64) -> u64 {
    raw.map(str::trim)
        .and_then(|s| s.parse::<i128>().ok())
        .filter(|v| *v > 0 && *v <= i128::from(max))
        .map(|v| v as u64)
        .unwrap_or(fallback)
}
