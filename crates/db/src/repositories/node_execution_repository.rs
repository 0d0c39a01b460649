use chrono::{DateTime, Utc};
use conductor_core::{NodeExecution, Status};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{datetime_to_millis, NodeExecutionRow, NODE_COLUMNS};

#[derive(Clone)]
pub struct NodeExecutionRepository {
    pool: SqlitePool,
}

impl NodeExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, node: &NodeExecution) -> Result<NodeExecution, DbError> {
        let row = NodeExecutionRow::try_from(node)?;
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, &row).await?;
        Ok(node.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<NodeExecution>, DbError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM node_executions WHERE id = ?");
        let row: Option<NodeExecutionRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    pub async fn get(&self, id: Uuid) -> Result<NodeExecution, DbError> {
        self.find_by_id(id)
            .await?
            .ok_or(DbError::NodeExecutionNotFound(id))
    }

    pub async fn find_by_plan(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, DbError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM node_executions WHERE plan_execution_id = ? ORDER BY created_at, rowid"
        );
        self.fetch_all(&sql, &plan_execution_id.to_string()).await
    }

    pub async fn find_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, DbError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM node_executions WHERE parent_id = ? ORDER BY created_at, rowid"
        );
        self.fetch_all(&sql, &parent_id.to_string()).await
    }

    pub async fn find_non_terminal(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, DbError> {
        let sql = format!(
            r#"
            SELECT {NODE_COLUMNS} FROM node_executions
            WHERE plan_execution_id = ? AND status IN ('queued', 'running', 'suspended')
            ORDER BY created_at, rowid
            "#
        );
        self.fetch_all(&sql, &plan_execution_id.to_string()).await
    }

    /// Non-terminal nodes of a plan whose expiry deadline has passed.
    pub async fn find_expired(
        &self,
        plan_execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<NodeExecution>, DbError> {
        let sql = format!(
            r#"
            SELECT {NODE_COLUMNS} FROM node_executions
            WHERE plan_execution_id = ?
              AND status IN ('queued', 'running', 'suspended')
              AND expiry_at IS NOT NULL AND expiry_at <= ?
            ORDER BY created_at, rowid
            "#
        );
        let rows: Vec<NodeExecutionRow> = sqlx::query_as(&sql)
            .bind(plan_execution_id.to_string())
            .bind(datetime_to_millis(now))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    /// Persists `node` if the stored row still has `expected_status` and `node.version`.
    /// Returns the node as stored, with its version bumped.
    pub async fn update(
        &self,
        node: &NodeExecution,
        expected_status: Status,
    ) -> Result<NodeExecution, DbError> {
        let row = NodeExecutionRow::try_from(node)?;
        let mut conn = self.pool.acquire().await?;
        update_conditional(&mut conn, &row, expected_status).await?;
        drop(conn);
        self.get(node.id).await
    }

    async fn fetch_all(&self, sql: &str, key: &str) -> Result<Vec<NodeExecution>, DbError> {
        let rows: Vec<NodeExecutionRow> = sqlx::query_as(sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }
}

pub(crate) async fn insert(conn: &mut SqliteConnection, row: &NodeExecutionRow) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO node_executions ({NODE_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(&row.id)
        .bind(&row.plan_execution_id)
        .bind(&row.plan_node_id)
        .bind(&row.identifier)
        .bind(&row.step_type)
        .bind(&row.facilitation)
        .bind(&row.ambiance)
        .bind(&row.resolved_parameters)
        .bind(&row.status)
        .bind(row.started_at)
        .bind(row.ended_at)
        .bind(row.expiry_at)
        .bind(&row.notify_id)
        .bind(&row.parent_id)
        .bind(&row.next_id)
        .bind(&row.previous_id)
        .bind(&row.attempt_id)
        .bind(&row.retry_ids)
        .bind(&row.interrupt_history)
        .bind(&row.executable_response)
        .bind(row.pending_children)
        .bind(&row.failure_info)
        .bind(&row.outputs)
        .bind(row.adviser_expired)
        .bind(row.version)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Compare-and-set on (status, version). Parameters are set only if absent and
/// the fan-in counter is never written here.
pub(crate) async fn update_conditional(
    conn: &mut SqliteConnection,
    row: &NodeExecutionRow,
    expected_status: Status,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE node_executions
        SET ambiance = ?,
            resolved_parameters = COALESCE(resolved_parameters, ?),
            status = ?,
            started_at = ?,
            ended_at = ?,
            expiry_at = ?,
            notify_id = ?,
            next_id = ?,
            attempt_id = ?,
            retry_ids = ?,
            interrupt_history = ?,
            executable_response = ?,
            failure_info = ?,
            outputs = ?,
            adviser_expired = ?,
            version = version + 1,
            updated_at = ?
        WHERE id = ? AND status = ? AND version = ?
        "#,
    )
    .bind(&row.ambiance)
    .bind(&row.resolved_parameters)
    .bind(&row.status)
    .bind(row.started_at)
    .bind(row.ended_at)
    .bind(row.expiry_at)
    .bind(&row.notify_id)
    .bind(&row.next_id)
    .bind(&row.attempt_id)
    .bind(&row.retry_ids)
    .bind(&row.interrupt_history)
    .bind(&row.executable_response)
    .bind(&row.failure_info)
    .bind(&row.outputs)
    .bind(row.adviser_expired)
    .bind(datetime_to_millis(Utc::now()))
    .bind(&row.id)
    .bind(expected_status.as_str())
    .bind(row.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let id = crate::models::parse_uuid(&row.id, "node_executions.id")?;
        return Err(DbError::Conflict { id });
    }
    Ok(())
}

pub(crate) async fn set_pending_children(
    conn: &mut SqliteConnection,
    id: Uuid,
    count: i64,
) -> Result<(), DbError> {
    sqlx::query("UPDATE node_executions SET pending_children = ? WHERE id = ?")
        .bind(count)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Decrements the fan-in counter of `parent_id` if its current attempt is
/// `attempt_id`. Returns the remaining count, or `None` when nothing changed.
pub(crate) async fn decrement_pending_children(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
    attempt_id: Uuid,
) -> Result<Option<i64>, DbError> {
    let remaining: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE node_executions
        SET pending_children = pending_children - 1
        WHERE id = ? AND attempt_id = ? AND pending_children > 0
        RETURNING pending_children
        "#,
    )
    .bind(parent_id.to_string())
    .bind(attempt_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(remaining.map(|(count,)| count))
}
