use chrono::Utc;
use conductor_core::{WaitInstance, WorkItem};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{datetime_to_millis, WaitInstanceRow, WorkItemRow};
use crate::repositories::work_queue_repository;

#[derive(Clone)]
pub struct WaitRepository {
    pool: SqlitePool,
}

impl WaitRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, correlation_id: &str) -> Result<Option<WaitInstance>, DbError> {
        let row: Option<WaitInstanceRow> = sqlx::query_as(
            r#"
            SELECT correlation_id, node_execution_id, plan_execution_id, purpose, context, response, created_at, consumed_at
            FROM wait_instances
            WHERE correlation_id = ?
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    /// Marks the wait consumed and queues the node's resumption, atomically.
    /// Only the first caller for a correlation id gets `Some`.
    pub async fn consume(
        &self,
        correlation_id: &str,
        response: &serde_json::Value,
    ) -> Result<Option<WaitInstance>, DbError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<WaitInstanceRow> = sqlx::query_as(
            r#"
            UPDATE wait_instances
            SET consumed_at = ?, response = ?
            WHERE correlation_id = ? AND consumed_at IS NULL
            RETURNING correlation_id, node_execution_id, plan_execution_id, purpose, context, response, created_at, consumed_at
            "#,
        )
        .bind(datetime_to_millis(Utc::now()))
        .bind(response.to_string())
        .bind(correlation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let wait = row.into_domain()?;

        let resume = WorkItem::resume_node(wait.node_execution_id, &wait.correlation_id);
        work_queue_repository::insert(&mut tx, &WorkItemRow::from(&resume)).await?;
        tx.commit().await?;

        Ok(Some(wait))
    }

    pub async fn cancel_for_node(&self, node_execution_id: Uuid) -> Result<u64, DbError> {
        let mut conn = self.pool.acquire().await?;
        delete_pending_for_node(&mut conn, node_execution_id).await
    }
}

pub(crate) async fn insert(conn: &mut SqliteConnection, row: &WaitInstanceRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO wait_instances (correlation_id, node_execution_id, plan_execution_id, purpose, context, response, created_at, consumed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.correlation_id)
    .bind(&row.node_execution_id)
    .bind(&row.plan_execution_id)
    .bind(&row.purpose)
    .bind(&row.context)
    .bind(&row.response)
    .bind(row.created_at)
    .bind(row.consumed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn delete_pending_for_node(
    conn: &mut SqliteConnection,
    node_execution_id: Uuid,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "DELETE FROM wait_instances WHERE node_execution_id = ? AND consumed_at IS NULL",
    )
    .bind(node_execution_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{NodeExecutionRepository, PlanExecutionRepository, WorkQueueRepository};
    use crate::{create_memory_pool, run_migrations, ExecutionStore, UnitOfWork};
    use conductor_core::{NodeExecution, Plan, PlanExecution, PlanNode, WaitPurpose, WorkKind};
    use std::collections::HashMap;
    use std::time::Duration;

    async fn setup() -> (SqlitePool, NodeExecution) {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let plan = Plan::new("p", "a").with_node(PlanNode::new("a", "a", "noop"));
        let execution = PlanExecution::new(
            plan,
            HashMap::new(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        PlanExecutionRepository::new(pool.clone())
            .create(&execution)
            .await
            .unwrap();
        let node =
            NodeExecution::new(&execution.root_ambiance(), &PlanNode::new("a", "a", "noop")).unwrap();
        let node = NodeExecutionRepository::new(pool.clone())
            .create(&node)
            .await
            .unwrap();
        (pool, node)
    }

    async fn register(pool: &SqlitePool, wait: WaitInstance) {
        let mut uow = UnitOfWork::new();
        uow.register_wait(wait);
        ExecutionStore::new(pool.clone()).commit(uow).await.unwrap();
    }

    #[tokio::test]
    async fn test_consume_exactly_once() {
        let (pool, node) = setup().await;
        let repo = WaitRepository::new(pool.clone());
        let wait = WaitInstance::new("cid-1", node.id, node.plan_execution_id, WaitPurpose::AsyncStep);
        register(&pool, wait).await;

        let response = serde_json::json!({"ok": true});
        let first = repo.consume("cid-1", &response).await.unwrap();
        let second = repo.consume("cid-1", &response).await.unwrap();

        let consumed = first.unwrap();
        assert_eq!(consumed.node_execution_id, node.id);
        assert_eq!(consumed.response, Some(response));
        assert!(consumed.is_consumed());
        assert!(second.is_none());

        let queue = WorkQueueRepository::new(pool);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        let item = queue
            .claim("w1", Utc::now(), chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.kind, WorkKind::ResumeNode);
        assert_eq!(item.correlation_id(), Some("cid-1"));
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_none() {
        let (pool, _) = setup().await;
        let repo = WaitRepository::new(pool);
        assert!(repo
            .consume("missing", &serde_json::Value::Null)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_for_node() {
        let (pool, node) = setup().await;
        register(&pool, WaitInstance::new("a", node.id, node.plan_execution_id, WaitPurpose::AsyncStep)).await;
        register(&pool, WaitInstance::new("b", node.id, node.plan_execution_id, WaitPurpose::RetryDelay)).await;
        let repo = WaitRepository::new(pool);
        repo.consume("a", &serde_json::Value::Null).await.unwrap();

        assert_eq!(repo.cancel_for_node(node.id).await.unwrap(), 1);
        assert!(repo.consume("b", &serde_json::Value::Null).await.unwrap().is_none());
        assert!(repo.find("a").await.unwrap().is_some());
    }
}
