//! Transactional writes spanning several tables.
//!
//! Engine steps describe everything they change in a [`UnitOfWork`] and commit
//! it in one SQLite transaction: a node's transition, the work it schedules, its
//! wait registrations and fan-in bookkeeping land together or not at all.

use chrono::Utc;
use conductor_core::{
    InterruptState, NodeExecution, PlanStatus, Status, WaitInstance, WorkItem,
};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{NodeExecutionRow, WaitInstanceRow, WorkItemRow};
use crate::repositories::{
    interrupts, nodes, plans, waits, work, InterruptRepository, NodeExecutionRepository,
    PlanExecutionRepository, WaitRepository, WorkQueueRepository,
};

#[derive(Debug, Clone)]
enum Op {
    InsertNode(NodeExecution),
    UpdateNode {
        node: NodeExecution,
        expected_status: Status,
    },
    SetPendingChildren {
        node_id: Uuid,
        count: i64,
    },
    FanIn {
        parent_id: Uuid,
        parent_attempt_id: Uuid,
    },
    Enqueue(WorkItem),
    RegisterWait(WaitInstance),
    CancelWaits(Uuid),
    EndPlan {
        plan_execution_id: Uuid,
        status: PlanStatus,
    },
    SettleInterrupt {
        interrupt_id: Uuid,
        state: InterruptState,
    },
}

/// Ordered list of writes committed atomically by [`ExecutionStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    ops: Vec<Op>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn insert_node(&mut self, node: &NodeExecution) -> &mut Self {
        self.ops.push(Op::InsertNode(node.clone()));
        self
    }

    /// Writes `node` if the stored row is still at `expected_status` and `node.version`.
    pub fn update_node(&mut self, node: &NodeExecution, expected_status: Status) -> &mut Self {
        self.ops.push(Op::UpdateNode {
            node: node.clone(),
            expected_status,
        });
        self
    }

    pub fn set_pending_children(&mut self, node_id: Uuid, count: i64) -> &mut Self {
        self.ops.push(Op::SetPendingChildren { node_id, count });
        self
    }

    /// Counts one finished branch against the parent's current attempt. The
    /// branch that brings the counter to zero queues `CHILDREN_COMPLETED`.
    pub fn fan_in(&mut self, parent_id: Uuid, parent_attempt_id: Uuid) -> &mut Self {
        self.ops.push(Op::FanIn {
            parent_id,
            parent_attempt_id,
        });
        self
    }

    pub fn enqueue(&mut self, item: WorkItem) -> &mut Self {
        self.ops.push(Op::Enqueue(item));
        self
    }

    pub fn register_wait(&mut self, wait: WaitInstance) -> &mut Self {
        self.ops.push(Op::RegisterWait(wait));
        self
    }

    pub fn cancel_waits(&mut self, node_id: Uuid) -> &mut Self {
        self.ops.push(Op::CancelWaits(node_id));
        self
    }

    pub fn end_plan(&mut self, plan_execution_id: Uuid, status: PlanStatus) -> &mut Self {
        self.ops.push(Op::EndPlan {
            plan_execution_id,
            status,
        });
        self
    }

    pub fn settle_interrupt(&mut self, interrupt_id: Uuid, state: InterruptState) -> &mut Self {
        self.ops.push(Op::SettleInterrupt {
            interrupt_id,
            state,
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Parents whose last pending branch finished in this commit.
    pub fan_in_completed: Vec<Uuid>,
    /// True when this commit moved the plan into a terminal status.
    pub plan_ended: bool,
}

#[derive(Clone)]
pub struct ExecutionStore {
    pool: SqlitePool,
    plans: PlanExecutionRepository,
    nodes: NodeExecutionRepository,
    waits: WaitRepository,
    work: WorkQueueRepository,
    interrupts: InterruptRepository,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            plans: PlanExecutionRepository::new(pool.clone()),
            nodes: NodeExecutionRepository::new(pool.clone()),
            waits: WaitRepository::new(pool.clone()),
            work: WorkQueueRepository::new(pool.clone()),
            interrupts: InterruptRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn plans(&self) -> &PlanExecutionRepository {
        &self.plans
    }

    pub fn nodes(&self) -> &NodeExecutionRepository {
        &self.nodes
    }

    pub fn waits(&self) -> &WaitRepository {
        &self.waits
    }

    pub fn work(&self) -> &WorkQueueRepository {
        &self.work
    }

    pub fn interrupts(&self) -> &InterruptRepository {
        &self.interrupts
    }

    /// Creates a plan execution together with its root node and first work item.
    pub async fn create_plan_execution(
        &self,
        execution: &conductor_core::PlanExecution,
        root: &NodeExecution,
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        plans::insert(&mut tx, &crate::models::PlanExecutionRow::try_from(execution)?).await?;
        nodes::insert(&mut tx, &NodeExecutionRow::try_from(root)?).await?;
        work::insert(&mut tx, &WorkItemRow::from(&WorkItem::start_node(root.id))).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Applies every operation of `uow` in one transaction. A conditional node
    /// update that matches nothing rolls the whole unit back with [`DbError::Conflict`].
    pub async fn commit(&self, uow: UnitOfWork) -> Result<CommitOutcome, DbError> {
        let mut outcome = CommitOutcome::default();
        if uow.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;
        for op in uow.ops {
            match op {
                Op::InsertNode(node) => {
                    nodes::insert(&mut tx, &NodeExecutionRow::try_from(&node)?).await?;
                }
                Op::UpdateNode {
                    node,
                    expected_status,
                } => {
                    let row = NodeExecutionRow::try_from(&node)?;
                    if let Err(err) = nodes::update_conditional(&mut tx, &row, expected_status).await {
                        debug!(
                            node_execution_id = %node.id,
                            expected_status = %expected_status,
                            version = node.version,
                            "Conditional node update rejected"
                        );
                        return Err(err);
                    }
                }
                Op::SetPendingChildren { node_id, count } => {
                    nodes::set_pending_children(&mut tx, node_id, count).await?;
                }
                Op::FanIn {
                    parent_id,
                    parent_attempt_id,
                } => {
                    let remaining =
                        nodes::decrement_pending_children(&mut tx, parent_id, parent_attempt_id)
                            .await?;
                    if remaining == Some(0) {
                        let item = WorkItem::children_completed(parent_id);
                        work::insert(&mut tx, &WorkItemRow::from(&item)).await?;
                        outcome.fan_in_completed.push(parent_id);
                    }
                }
                Op::Enqueue(item) => {
                    work::insert(&mut tx, &WorkItemRow::from(&item)).await?;
                }
                Op::RegisterWait(wait) => {
                    waits::insert(&mut tx, &WaitInstanceRow::try_from(&wait)?).await?;
                }
                Op::CancelWaits(node_id) => {
                    waits::delete_pending_for_node(&mut tx, node_id).await?;
                }
                Op::EndPlan {
                    plan_execution_id,
                    status,
                } => {
                    if plans::end(&mut tx, plan_execution_id, status, Utc::now()).await? {
                        outcome.plan_ended = true;
                    }
                }
                Op::SettleInterrupt {
                    interrupt_id,
                    state,
                } => {
                    interrupts::update_state(&mut tx, interrupt_id, state).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_memory_pool, run_migrations};
    use conductor_core::{PlanExecution, Plan, PlanNode, WaitPurpose, WorkKind};
    use std::collections::HashMap;
    use std::time::Duration;

    async fn setup() -> (ExecutionStore, PlanExecution, NodeExecution) {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = ExecutionStore::new(pool);
        let plan = Plan::new("p", "a").with_node(PlanNode::new("a", "a", "noop"));
        let execution = PlanExecution::new(
            plan,
            HashMap::new(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let root =
            NodeExecution::new(&execution.root_ambiance(), &PlanNode::new("a", "a", "noop")).unwrap();
        store.create_plan_execution(&execution, &root).await.unwrap();
        (store, execution, root)
    }

    #[tokio::test]
    async fn test_create_plan_execution_queues_root() {
        let (store, _, root) = setup().await;
        let items = store.work().find_for_node(root.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, WorkKind::StartNode);
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_whole_unit() {
        let (store, execution, root) = setup().await;
        let child =
            NodeExecution::new(&root.ambiance, &PlanNode::new("b", "b", "noop")).unwrap();

        let mut stale = root.clone();
        stale.version = 7;
        stale.status = Status::Running;

        let mut uow = UnitOfWork::new();
        uow.insert_node(&child)
            .enqueue(WorkItem::start_node(child.id))
            .update_node(&stale, Status::Queued)
            .end_plan(execution.id, PlanStatus::Failed);
        let err = store.commit(uow).await.unwrap_err();
        assert!(err.is_conflict());

        assert!(store.nodes().find_by_id(child.id).await.unwrap().is_none());
        assert_eq!(store.work().pending_count().await.unwrap(), 1);
        assert_eq!(
            store.plans().get(execution.id).await.unwrap().status,
            PlanStatus::Running
        );
    }

    #[tokio::test]
    async fn test_fan_in_completes_once() {
        let (store, _, root) = setup().await;
        let mut uow = UnitOfWork::new();
        uow.set_pending_children(root.id, 2);
        store.commit(uow).await.unwrap();

        let mut uow = UnitOfWork::new();
        uow.fan_in(root.id, root.attempt_id);
        assert!(store.commit(uow).await.unwrap().fan_in_completed.is_empty());

        let mut uow = UnitOfWork::new();
        uow.fan_in(root.id, root.attempt_id);
        let outcome = store.commit(uow).await.unwrap();
        assert_eq!(outcome.fan_in_completed, vec![root.id]);

        let kinds: Vec<WorkKind> = store
            .work()
            .find_for_node(root.id)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.kind)
            .collect();
        assert!(kinds.contains(&WorkKind::ChildrenCompleted));
    }

    #[tokio::test]
    async fn test_plan_ends_once_and_waits_cancel() {
        let (store, execution, root) = setup().await;
        let mut uow = UnitOfWork::new();
        uow.register_wait(WaitInstance::new(
            "cid",
            root.id,
            execution.id,
            WaitPurpose::AsyncStep,
        ));
        store.commit(uow).await.unwrap();

        let mut uow = UnitOfWork::new();
        uow.cancel_waits(root.id)
            .end_plan(execution.id, PlanStatus::Aborted);
        assert!(store.commit(uow).await.unwrap().plan_ended);

        let mut uow = UnitOfWork::new();
        uow.end_plan(execution.id, PlanStatus::Succeeded);
        assert!(!store.commit(uow).await.unwrap().plan_ended);

        assert!(store.waits().find("cid").await.unwrap().is_none());
        let stored = store.plans().get(execution.id).await.unwrap();
        assert_eq!(stored.status, PlanStatus::Aborted);
        assert!(stored.ended_at.is_some());
    }
}
