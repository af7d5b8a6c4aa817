//! Persistence for the orchestrator.
//!
//! Two stores live here:
//! - [`ControlPlaneStore`]: node, task, and workspace rows (read-mostly)
//! - [`ActorStateStore`]: durable actor state blobs and pending alarms
//!
//! Both have a Postgres implementation and share [`MemoryStore`] for tests
//! and dev mode.

mod actor_state;
mod error;
mod memory;
pub mod models;
mod postgres;
mod store;

pub use actor_state::{ActorStateStore, PgActorStateStore};
pub use error::DbError;
pub use memory::{MemoryStore, TaskRow};
pub use postgres::PgStore;
pub use store::ControlPlaneStore;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::config::parse_bounded_int;

/// Postgres pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Overrides the migration directory search.
    pub migrations_dir: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/sam".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            migrations_dir: None,
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `DATABASE_URL` plus `SAM_DB_*` pool sizing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let int = |key: &str, fallback: u64, max: u64| {
            parse_bounded_int(lookup(key).as_deref(), fallback, max)
        };

        let max_connections = int(
            "SAM_DB_MAX_CONNECTIONS",
            u64::from(defaults.max_connections),
            1_000,
        ) as u32;
        // Clamped to the ceiling.
        let min_connections = (int(
            "SAM_DB_MIN_CONNECTIONS",
            u64::from(defaults.min_connections),
            1_000,
        ) as u32)
            .min(max_connections);

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections,
            min_connections,
            acquire_timeout: Duration::from_millis(int(
                "SAM_DB_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout.as_millis() as u64,
                600_000,
            )),
            migrations_dir: lookup("SAM_MIGRATIONS_DIR").map(PathBuf::from),
        }
    }
}

/// The Postgres pool behind both stores.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: Option<PathBuf>,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            migrations_dir: config.migrations_dir.clone(),
        })
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Applies `migrations/` from the configured directory, the working
    /// directory, or the crate source tree, whichever loads first.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates: Vec<PathBuf> = match &self.migrations_dir {
            Some(dir) => vec![dir.clone()],
            None => vec![
                PathBuf::from("migrations"),
                PathBuf::from("services/orchestrator/migrations"),
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
            ],
        };

        let mut last_error = None;
        for dir in &candidates {
            match Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Applying migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    return Ok(());
                }
                Err(e) => {
                    debug!(migrations_dir = %dir.display(), error = %e, "No migrations here");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(DbError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.unwrap_or_default(),
        })
    }

    pub fn control_plane_store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }

    pub fn actor_state_store(&self) -> PgActorStateStore {
        PgActorStateStore::new(self.pool.clone())
    }
}
