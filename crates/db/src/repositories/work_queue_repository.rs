use chrono::{DateTime, Utc};
use conductor_core::WorkItem;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{datetime_to_millis, millis_to_datetime, WorkItemRow};

/// Durable queue of engine work. Items are claimed with a lease; a worker that
/// dies simply lets its lease run out.
#[derive(Clone)]
pub struct WorkQueueRepository {
    pool: SqlitePool,
}

impl WorkQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, item: &WorkItem) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, &WorkItemRow::from(item)).await
    }

    /// Claims the oldest ready item whose lease is free or lapsed.
    pub async fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<WorkItem>, DbError> {
        let now_ms = datetime_to_millis(now);
        let row: Option<WorkItemRow> = sqlx::query_as(
            r#"
            UPDATE work_items
            SET claimed_by = ?, claimed_until = ?, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM work_items
                WHERE ready_at <= ? AND (claimed_until IS NULL OR claimed_until < ?)
                ORDER BY ready_at, created_at
                LIMIT 1
            )
            AND (claimed_until IS NULL OR claimed_until < ?)
            RETURNING id, kind, node_execution_id, payload, ready_at, attempts, claimed_by, claimed_until, created_at
            "#,
        )
        .bind(worker_id)
        .bind(datetime_to_millis(now + lease))
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    /// Deletes a finished item. False if the lease was lost to another worker.
    pub async fn complete(&self, id: Uuid, worker_id: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM work_items WHERE id = ? AND claimed_by = ?")
            .bind(id.to_string())
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Gives an item back to the queue, ready again at `ready_at`.
    pub async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        ready_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET claimed_by = NULL, claimed_until = NULL, ready_at = ?
            WHERE id = ? AND claimed_by = ?
            "#,
        )
        .bind(datetime_to_millis(ready_at))
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn pending_count(&self) -> Result<i64, DbError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Earliest instant at which some unclaimed item becomes ready.
    pub async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let (next,): (Option<i64>,) = sqlx::query_as(
            "SELECT MIN(COALESCE(MAX(ready_at, claimed_until), ready_at)) FROM work_items",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next.map(millis_to_datetime))
    }

    pub async fn find_for_node(&self, node_execution_id: Uuid) -> Result<Vec<WorkItem>, DbError> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            r#"
            SELECT id, kind, node_execution_id, payload, ready_at, attempts, claimed_by, claimed_until, created_at
            FROM work_items
            WHERE node_execution_id = ?
            ORDER BY ready_at, created_at
            "#,
        )
        .bind(node_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }
}

pub(crate) async fn insert(conn: &mut SqliteConnection, row: &WorkItemRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO work_items (id, kind, node_execution_id, payload, ready_at, attempts, claimed_by, claimed_until, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.kind)
    .bind(&row.node_execution_id)
    .bind(&row.payload)
    .bind(row.ready_at)
    .bind(row.attempts)
    .bind(&row.claimed_by)
    .bind(row.claimed_until)
    .bind(row.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_memory_pool, run_migrations};
    use conductor_core::WorkKind;

    async fn setup_test_db() -> SqlitePool {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn lease() -> chrono::Duration {
        chrono::Duration::seconds(30)
    }

    #[tokio::test]
    async fn test_claim_respects_ready_at() {
        let queue = WorkQueueRepository::new(setup_test_db().await);
        let now = Utc::now();
        queue
            .enqueue(&WorkItem::delay_elapsed("later", now + chrono::Duration::seconds(60)))
            .await
            .unwrap();
        queue
            .enqueue(&WorkItem::delay_elapsed("now", now))
            .await
            .unwrap();

        let claimed = queue.claim("w1", now, lease()).await.unwrap().unwrap();
        assert_eq!(claimed.correlation_id(), Some("now"));
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
        assert!(queue.claim("w2", now, lease()).await.unwrap().is_none());
        assert!(queue.complete(claimed.id, "w1").await.unwrap());

        let later = now + chrono::Duration::seconds(61);
        let claimed = queue.claim("w2", later, lease()).await.unwrap().unwrap();
        assert_eq!(claimed.kind, WorkKind::DelayElapsed);
        assert_eq!(claimed.correlation_id(), Some("later"));
    }

    #[tokio::test]
    async fn test_lapsed_lease_is_reclaimed() {
        let queue = WorkQueueRepository::new(setup_test_db().await);
        let now = Utc::now();
        queue.enqueue(&WorkItem::delay_elapsed("cid", now)).await.unwrap();

        let first = queue.claim("w1", now, lease()).await.unwrap().unwrap();
        let after_lease = now + chrono::Duration::seconds(31);
        let second = queue.claim("w2", after_lease, lease()).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);

        // The first worker lost its lease and can no longer complete the item.
        assert!(!queue.complete(first.id, "w1").await.unwrap());
        assert!(queue.complete(second.id, "w2").await.unwrap());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_reschedules() {
        let queue = WorkQueueRepository::new(setup_test_db().await);
        let now = Utc::now();
        queue.enqueue(&WorkItem::delay_elapsed("cid", now)).await.unwrap();

        let item = queue.claim("w1", now, lease()).await.unwrap().unwrap();
        let retry_at = now + chrono::Duration::seconds(5);
        assert!(queue.release(item.id, "w1", retry_at).await.unwrap());

        assert!(queue.claim("w1", now, lease()).await.unwrap().is_none());
        let next = queue.next_ready_at().await.unwrap().unwrap();
        assert_eq!(next.timestamp_millis(), retry_at.timestamp_millis());
        assert!(queue.claim("w1", retry_at, lease()).await.unwrap().is_some());
    }
}
