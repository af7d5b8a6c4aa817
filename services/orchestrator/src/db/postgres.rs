//! Postgres implementation of [`ControlPlaneStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sam_id::{ChatSessionId, NodeId, TaskId, UserId, WorkspaceId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use super::models::{
    ErrorEvent, HealthStatus, NewAgentSession, NewNode, NewWorkspace, NodeMetrics, NodeRecord,
    NodeStatus, TaskStatus, WorkspaceRecord, WorkspaceStatus,
};
use super::store::ControlPlaneStore;
use super::DbError;

const NODE_COLUMNS: &str = r#"
    id, user_id, name, status, health_status, vm_size, vm_location,
    ip_address, metrics, warm_since, created_at
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_nodes(&self, sql: &str, user_id: UserId) -> Result<Vec<NodeRecord>, DbError> {
        let rows = sqlx::query(sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }
}

#[async_trait]
impl ControlPlaneStore for PgStore {
    async fn insert_node(&self, node: &NewNode) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO nodes (id, user_id, name, status, vm_size, vm_location, created_at, updated_at)
            VALUES ($1, $2, $3, 'creating', $4, $5, now(), now())
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.user_id.to_string())
        .bind(&node.name)
        .bind(&node.vm_size)
        .bind(&node.vm_location)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>, DbError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(node_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn list_running_nodes(&self, user_id: UserId) -> Result<Vec<NodeRecord>, DbError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE user_id = $1 AND status = 'running' ORDER BY created_at"
        );
        self.fetch_nodes(&sql, user_id).await
    }

    async fn list_warm_nodes(&self, user_id: UserId) -> Result<Vec<NodeRecord>, DbError> {
        let sql = format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes
            WHERE user_id = $1 AND status = 'running' AND warm_since IS NOT NULL
            ORDER BY created_at
            "#
        );
        self.fetch_nodes(&sql, user_id).await
    }

    async fn count_user_nodes(&self, user_id: UserId) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nodes WHERE user_id = $1 AND status IN ('creating', 'running')",
        )
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn update_node_status(
        &self,
        node_id: NodeId,
        status: NodeStatus,
        ip_address: Option<&str>,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET status = $2, ip_address = COALESCE($3, ip_address), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(node_id.to_string())
        .bind(status.as_str())
        .bind(ip_address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("node {node_id}")));
        }
        Ok(())
    }

    async fn set_node_warm_since(
        &self,
        node_id: NodeId,
        warm_since: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE nodes SET warm_since = $2, updated_at = now() WHERE id = $1")
            .bind(node_id.to_string())
            .bind(warm_since)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_node_stopped(&self, node_id: NodeId) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE nodes SET status = 'stopped', warm_since = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(node_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_active_workspaces(&self, node_id: NodeId) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM workspaces
            WHERE node_id = $1 AND status IN ('running', 'creating', 'recovery')
            "#,
        )
        .bind(node_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn create_workspace(&self, workspace: &NewWorkspace) -> Result<(), DbError> {
        // Re-running a crashed step must not create a second row.
        sqlx::query(
            r#"
            INSERT INTO workspaces (
                id, task_id, project_id, user_id, node_id, name, repository, branch,
                vm_size, vm_location, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'creating', now(), now())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(workspace.id.to_string())
        .bind(workspace.task_id.to_string())
        .bind(workspace.project_id.to_string())
        .bind(workspace.user_id.to_string())
        .bind(workspace.node_id.to_string())
        .bind(&workspace.name)
        .bind(&workspace.repository)
        .bind(&workspace.branch)
        .bind(&workspace.vm_size)
        .bind(&workspace.vm_location)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<WorkspaceRecord>, DbError> {
        let row = sqlx::query(
            r#"
            SELECT w.id, w.task_id, w.user_id, w.node_id, w.status, c.id AS chat_session_id
            FROM workspaces w
            LEFT JOIN chat_sessions c ON c.workspace_id = w.id
            WHERE w.id = $1
            "#,
        )
        .bind(workspace_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(workspace_from_row).transpose()
    }

    async fn set_workspace_status(
        &self,
        workspace_id: WorkspaceId,
        status: WorkspaceStatus,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE workspaces SET status = $2, updated_at = now() WHERE id = $1")
            .bind(workspace_id.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_agent_session(&self, session: &NewAgentSession) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO agent_sessions (id, workspace_id, task_id, user_id, label, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'running', now())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.workspace_id.to_string())
        .bind(session.task_id.to_string())
        .bind(session.user_id.to_string())
        .bind(&session.label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task_status(&self, task_id: TaskId) -> Result<Option<TaskStatus>, DbError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        status.as_deref().map(TaskStatus::parse).transpose()
    }

    async fn set_task_node(
        &self,
        task_id: TaskId,
        node_id: NodeId,
        auto_provisioned: bool,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET node_id = $2, auto_provisioned_node_id = CASE WHEN $3 THEN $2 ELSE auto_provisioned_node_id END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id.to_string())
        .bind(node_id.to_string())
        .bind(auto_provisioned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transition_task_status(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        workspace_id: Option<WorkspaceId>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3, workspace_id = COALESCE($4, workspace_id), updated_at = now()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(task_id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(workspace_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;
        let changed = result.rows_affected() > 0;
        debug!(%task_id, from = %from, to = %to, changed, "Task status compare-and-set");
        Ok(changed)
    }

    async fn finish_task(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, error_message = COALESCE($3, error_message),
                completed_at = now(), updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(task_id.to_string())
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_chat_session(&self, task_id: TaskId) -> Result<Option<ChatSessionId>, DbError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM chat_sessions WHERE task_id = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        id.as_deref().map(parse_id::<ChatSessionId>).transpose()
    }

    async fn link_chat_session(
        &self,
        chat_session_id: ChatSessionId,
        workspace_id: WorkspaceId,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE chat_sessions SET workspace_id = $2 WHERE id = $1")
            .bind(chat_session_id.to_string())
            .bind(workspace_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_error(&self, event: &ErrorEvent) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO observability_errors (source, message, task_id, node_id, context, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&event.source)
        .bind(&event.message)
        .bind(event.task_id.map(|id| id.to_string()))
        .bind(event.node_id.map(|id| id.to_string()))
        .bind(&event.context)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn parse_id<T: std::str::FromStr<Err = sam_id::IdError>>(raw: &str) -> Result<T, DbError> {
    raw.parse()
        .map_err(|e: sam_id::IdError| DbError::Corrupt(format!("{raw}: {e}")))
}

fn node_from_row(row: &PgRow) -> Result<NodeRecord, DbError> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let status: String = row.try_get("status")?;
    let health: Option<String> = row.try_get("health_status")?;
    let metrics: Option<serde_json::Value> = row.try_get("metrics")?;

    Ok(NodeRecord {
        id: parse_id(&id)?,
        user_id: parse_id(&user_id)?,
        name: row.try_get("name")?,
        status: NodeStatus::parse(&status)?,
        // Unknown health values are treated as unreported.
        health_status: health.as_deref().and_then(|h| HealthStatus::parse(h).ok()),
        vm_size: row.try_get("vm_size")?,
        vm_location: row.try_get("vm_location")?,
        ip_address: row.try_get("ip_address")?,
        metrics: NodeMetrics::from_json(metrics),
        warm_since: row.try_get("warm_since")?,
        created_at: row.try_get("created_at")?,
    })
}

fn workspace_from_row(row: &PgRow) -> Result<WorkspaceRecord, DbError> {
    let id: String = row.try_get("id")?;
    let task_id: Option<String> = row.try_get("task_id")?;
    let user_id: String = row.try_get("user_id")?;
    let node_id: String = row.try_get("node_id")?;
    let status: String = row.try_get("status")?;
    let chat: Option<String> = row.try_get("chat_session_id")?;

    Ok(WorkspaceRecord {
        id: parse_id(&id)?,
        task_id: task_id.as_deref().map(parse_id::<TaskId>).transpose()?,
        user_id: parse_id(&user_id)?,
        node_id: parse_id(&node_id)?,
        status: WorkspaceStatus::parse(&status)?,
        chat_session_id: chat.as_deref().map(parse_id::<ChatSessionId>).transpose()?,
    })
}
