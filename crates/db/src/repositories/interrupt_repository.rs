use chrono::Utc;
use conductor_core::{Interrupt, InterruptState};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{datetime_to_millis, InterruptRow};

#[derive(Clone)]
pub struct InterruptRepository {
    pool: SqlitePool,
}

impl InterruptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, interrupt: &Interrupt) -> Result<Interrupt, DbError> {
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, &InterruptRow::from(interrupt)).await?;
        Ok(interrupt.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Interrupt>, DbError> {
        let row: Option<InterruptRow> = sqlx::query_as(
            r#"
            SELECT id, interrupt_type, plan_execution_id, node_execution_id, state, created_at, processed_at
            FROM interrupts
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    pub async fn find_by_plan(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>, DbError> {
        let rows: Vec<InterruptRow> = sqlx::query_as(
            r#"
            SELECT id, interrupt_type, plan_execution_id, node_execution_id, state, created_at, processed_at
            FROM interrupts
            WHERE plan_execution_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    pub async fn mark(&self, id: Uuid, state: InterruptState) -> Result<bool, DbError> {
        let mut conn = self.pool.acquire().await?;
        update_state(&mut conn, id, state).await
    }
}

pub(crate) async fn insert(conn: &mut SqliteConnection, row: &InterruptRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO interrupts (id, interrupt_type, plan_execution_id, node_execution_id, state, created_at, processed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.interrupt_type)
    .bind(&row.plan_execution_id)
    .bind(&row.node_execution_id)
    .bind(&row.state)
    .bind(row.created_at)
    .bind(row.processed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Moves a registered interrupt to `state`. Settled interrupts are left alone.
pub(crate) async fn update_state(
    conn: &mut SqliteConnection,
    id: Uuid,
    state: InterruptState,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE interrupts
        SET state = ?, processed_at = ?
        WHERE id = ? AND state = 'registered'
        "#,
    )
    .bind(state.as_str())
    .bind(datetime_to_millis(Utc::now()))
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::PlanExecutionRepository;
    use crate::{create_memory_pool, run_migrations};
    use conductor_core::{InterruptType, Plan, PlanExecution, PlanNode};
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_lifecycle() {
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

        let repo = InterruptRepository::new(pool);
        let interrupt = Interrupt::new(InterruptType::AbortAll, execution.id, None);
        repo.create(&interrupt).await.unwrap();

        assert!(repo.mark(interrupt.id, InterruptState::Processed).await.unwrap());
        assert!(!repo.mark(interrupt.id, InterruptState::Discarded).await.unwrap());

        let stored = repo.find_by_id(interrupt.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InterruptState::Processed);
        assert!(stored.processed_at.is_some());
        assert_eq!(repo.find_by_plan(execution.id).await.unwrap().len(), 1);
    }
}
