//! Durable storage for actor state and alarms.
//!
//! Each actor owns one row keyed by `{kind}:{id}` holding a JSON state blob
//! and at most one pending alarm.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::DbError;

#[async_trait]
pub trait ActorStateStore: Send + Sync {
    async fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>, DbError>;

    async fn save_state(&self, key: &str, state: &serde_json::Value) -> Result<(), DbError>;

    async fn load_alarm(&self, key: &str) -> Result<Option<DateTime<Utc>>, DbError>;

    /// Replaces the pending alarm; `None` clears it.
    async fn save_alarm(&self, key: &str, at: Option<DateTime<Utc>>) -> Result<(), DbError>;

    /// Keys starting with `prefix` that have an alarm pending.
    async fn pending_alarms(&self, prefix: &str) -> Result<Vec<(String, DateTime<Utc>)>, DbError>;
}

/// Postgres-backed actor storage (`actor_state` table).
#[derive(Clone)]
pub struct PgActorStateStore {
    pool: PgPool,
}

impl PgActorStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActorStateStore for PgActorStateStore {
    async fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>, DbError> {
        let state: Option<Option<serde_json::Value>> =
            sqlx::query_scalar("SELECT state FROM actor_state WHERE actor_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(state.flatten())
    }

    #[instrument(skip(self, state))]
    async fn save_state(&self, key: &str, state: &serde_json::Value) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO actor_state (actor_key, state, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (actor_key)
            DO UPDATE SET state = EXCLUDED.state, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(state)
        .execute(&self.pool)
        .await?;
        debug!(actor_key = %key, "Persisted actor state");
        Ok(())
    }

    async fn load_alarm(&self, key: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let alarm: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT alarm_at FROM actor_state WHERE actor_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(alarm.flatten())
    }

    async fn save_alarm(&self, key: &str, at: Option<DateTime<Utc>>) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO actor_state (actor_key, alarm_at, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (actor_key)
            DO UPDATE SET alarm_at = EXCLUDED.alarm_at, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_alarms(&self, prefix: &str) -> Result<Vec<(String, DateTime<Utc>)>, DbError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT actor_key, alarm_at
            FROM actor_state
            WHERE alarm_at IS NOT NULL AND starts_with(actor_key, $1)
            ORDER BY alarm_at
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
