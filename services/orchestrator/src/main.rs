//! SAM orchestrator
//!
//! Runs the task runner and node lifecycle actors behind a small HTTP
//! surface. Actors with pending wake-ups are recovered at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sam_orchestrator::{
    actors::task_runner::TaskRunnerDeps,
    api,
    callback::CallbackSigner,
    clients::{DevProvisioner, HttpNodeAgentClient, NodeAgent, Provisioner},
    config,
    db::{ActorStateStore, ControlPlaneStore, Database, MemoryStore},
    observability::ErrorReporter,
    scheduler::NodeSelector,
    service::{NodeLifecycle, NodeLifecycleService, TaskRunnerService},
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SAM_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting SAM orchestrator");
    info!(listen_addr = %config.listen_addr, dev_mode = config.dev_mode, "Configuration loaded");

    // Dev mode keeps everything in memory; otherwise Postgres backs both stores.
    let (db, store, actor_store): (
        Option<Database>,
        Arc<dyn ControlPlaneStore>,
        Arc<dyn ActorStateStore>,
    ) = if config.dev_mode {
        info!("Using in-memory store (dev mode)");
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn ControlPlaneStore> = memory.clone();
        let actor_store: Arc<dyn ActorStateStore> = memory;
        (None, store, actor_store)
    } else {
        let db = match Database::connect(&config.database).await {
            Ok(db) => {
                info!("Database connection established");
                db
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to database");
                return Err(e.into());
            }
        };
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
        let store: Arc<dyn ControlPlaneStore> = Arc::new(db.control_plane_store());
        let actor_store: Arc<dyn ActorStateStore> = Arc::new(db.actor_state_store());
        (Some(db), store, actor_store)
    };

    let provisioner: Arc<dyn Provisioner> = Arc::new(DevProvisioner::new(
        store.clone(),
        config.dev_node_address.clone(),
    ));
    let node_agent: Arc<dyn NodeAgent> = Arc::new(HttpNodeAgentClient::new(config.node_agent_port)?);
    let signer = CallbackSigner::new(&config.callback_secret);

    let node_lifecycle = Arc::new(NodeLifecycleService::new(
        actor_store.clone(),
        store.clone(),
        provisioner.clone(),
        config.node_lifecycle.clone(),
    ));
    let lifecycle: Arc<dyn NodeLifecycle> = node_lifecycle.clone();

    let selector = Arc::new(NodeSelector::new(
        store.clone(),
        Some(lifecycle.clone()),
        config.capacity.clone(),
    ));

    let task_runners = Arc::new(TaskRunnerService::new(
        actor_store,
        TaskRunnerDeps {
            store: store.clone(),
            selector,
            lifecycle,
            provisioner,
            node_agent,
            signer: signer.clone(),
            reporter: ErrorReporter::new(store),
            config: config.task_runner.clone(),
        },
    ));

    // Wake-ups armed before the last shutdown
    let recovered_nodes = node_lifecycle.recover().await?;
    let recovered_tasks = task_runners.recover().await?;
    info!(recovered_nodes, recovered_tasks, "Actor recovery complete");

    let state = AppState::new(task_runners.clone(), node_lifecycle.clone(), signer, db);
    let app = api::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let shutdown_timeout = Duration::from_secs(10);
    if !server_handle.is_finished()
        && tokio::time::timeout(shutdown_timeout, &mut server_handle)
            .await
            .is_err()
    {
        warn!("HTTP server did not shut down in time");
    }

    // Alarms stay persisted; the next start recovers them.
    info!("Stopping actors...");
    task_runners.shutdown(shutdown_timeout).await;
    node_lifecycle.shutdown(shutdown_timeout).await;

    info!("Orchestrator shutdown complete");
    Ok(())
}
