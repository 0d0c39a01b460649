use chrono::{DateTime, Utc};
use conductor_core::{PlanExecution, PlanStatus};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{datetime_to_millis, PlanExecutionRow};

#[derive(Clone)]
pub struct PlanExecutionRepository {
    pool: SqlitePool,
}

impl PlanExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, execution: &PlanExecution) -> Result<PlanExecution, DbError> {
        let row = PlanExecutionRow::try_from(execution)?;
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, &row).await?;
        Ok(execution.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<PlanExecution>, DbError> {
        let row: Option<PlanExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, plan, status, setup_abstractions, started_at, ended_at, next_iteration, valid_until, version
            FROM plan_executions
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    pub async fn get(&self, id: Uuid) -> Result<PlanExecution, DbError> {
        self.find_by_id(id)
            .await?
            .ok_or(DbError::PlanExecutionNotFound(id))
    }

    pub async fn find_all(&self, limit: i64) -> Result<Vec<PlanExecution>, DbError> {
        let rows: Vec<PlanExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, plan, status, setup_abstractions, started_at, ended_at, next_iteration, valid_until, version
            FROM plan_executions
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    /// Moves a live plan from `from` to `to`. Returns false when the plan was not in `from`.
    pub async fn transition_status(
        &self,
        id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
    ) -> Result<bool, DbError> {
        let ended_at = to.is_terminal().then(|| datetime_to_millis(Utc::now()));
        let result = sqlx::query(
            r#"
            UPDATE plan_executions
            SET status = ?, ended_at = COALESCE(?, ended_at), version = version + 1
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(ended_at)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Claims live plans whose iteration is due by pushing `next_iteration` forward.
    /// A plan is returned only to the caller whose update moved it.
    pub async fn claim_due_for_iteration(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
        limit: i64,
    ) -> Result<Vec<PlanExecution>, DbError> {
        let now_ms = datetime_to_millis(now);
        let due: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT id, next_iteration
            FROM plan_executions
            WHERE status IN ('running', 'paused') AND next_iteration <= ?
            ORDER BY next_iteration
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let next = datetime_to_millis(now + interval);
        let mut claimed = Vec::with_capacity(due.len());
        for (id, previous) in due {
            let result = sqlx::query(
                "UPDATE plan_executions SET next_iteration = ? WHERE id = ? AND next_iteration = ?",
            )
            .bind(next.max(previous + 1))
            .bind(&id)
            .bind(previous)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                continue;
            }
            let id = crate::models::parse_uuid(&id, "plan_executions.id")?;
            if let Some(execution) = self.find_by_id(id).await? {
                claimed.push(execution);
            }
        }
        Ok(claimed)
    }

    /// Deletes ended plans past their retention deadline, together with their nodes.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM plan_executions
            WHERE valid_until < ? AND status NOT IN ('running', 'paused')
            "#,
        )
        .bind(datetime_to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

pub(crate) async fn insert(conn: &mut SqliteConnection, row: &PlanExecutionRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO plan_executions (id, plan, status, setup_abstractions, started_at, ended_at, next_iteration, valid_until, version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.plan)
    .bind(&row.status)
    .bind(&row.setup_abstractions)
    .bind(row.started_at)
    .bind(row.ended_at)
    .bind(row.next_iteration)
    .bind(row.valid_until)
    .bind(row.version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Ends a live plan. Returns false if the plan had already ended.
pub(crate) async fn end(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: PlanStatus,
    ended_at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE plan_executions
        SET status = ?, ended_at = ?, version = version + 1
        WHERE id = ? AND status IN ('running', 'paused')
        "#,
    )
    .bind(status.as_str())
    .bind(datetime_to_millis(ended_at))
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_memory_pool, run_migrations};
    use conductor_core::{Plan, PlanNode};
    use std::collections::HashMap;
    use std::time::Duration;

    async fn setup_test_db() -> SqlitePool {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn execution(retention: Duration) -> PlanExecution {
        let plan = Plan::new("p", "a").with_node(PlanNode::new("a", "a", "noop"));
        PlanExecution::new(plan, HashMap::new(), retention, Duration::from_secs(0))
    }

    #[tokio::test]
    async fn test_create_and_find_plan_execution() {
        let repo = PlanExecutionRepository::new(setup_test_db().await);
        let created = repo.create(&execution(Duration::from_secs(60))).await.unwrap();

        let found = repo.get(created.id).await.unwrap();
        assert_eq!(found.plan, created.plan);
        assert_eq!(found.status, PlanStatus::Running);
        assert_eq!(repo.find_all(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_status_is_conditional() {
        let repo = PlanExecutionRepository::new(setup_test_db().await);
        let created = repo.create(&execution(Duration::from_secs(60))).await.unwrap();

        assert!(repo
            .transition_status(created.id, PlanStatus::Running, PlanStatus::Paused)
            .await
            .unwrap());
        assert!(!repo
            .transition_status(created.id, PlanStatus::Running, PlanStatus::Paused)
            .await
            .unwrap());
        assert_eq!(repo.get(created.id).await.unwrap().status, PlanStatus::Paused);
    }

    #[tokio::test]
    async fn test_claim_due_for_iteration_advances() {
        let repo = PlanExecutionRepository::new(setup_test_db().await);
        let created = repo.create(&execution(Duration::from_secs(60))).await.unwrap();
        let now = Utc::now() + chrono::Duration::seconds(1);

        let claimed = repo
            .claim_due_for_iteration(now, chrono::Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(claimed[0].next_iteration > created.next_iteration);

        let again = repo
            .claim_due_for_iteration(now, chrono::Duration::seconds(30), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_purge_only_ended_and_expired() {
        let pool = setup_test_db().await;
        let repo = PlanExecutionRepository::new(pool.clone());
        let live = repo.create(&execution(Duration::from_secs(0))).await.unwrap();
        let ended = repo.create(&execution(Duration::from_secs(0))).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert!(end(&mut conn, ended.id, PlanStatus::Succeeded, Utc::now()).await.unwrap());
        assert!(!end(&mut conn, ended.id, PlanStatus::Failed, Utc::now()).await.unwrap());
        drop(conn);

        let purged = repo
            .purge_expired(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.find_by_id(ended.id).await.unwrap().is_none());
        assert!(repo.find_by_id(live.id).await.unwrap().is_some());
    }
}
