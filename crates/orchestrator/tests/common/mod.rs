#![allow(dead_code)]

use conductor_core::{FacilitationMode, NodeExecution, PlanNode};
use db::{create_memory_pool, run_migrations, ExecutionStore};
use orchestrator::{EngineConfig, EngineContext, ExecutionEngine};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const WORKER: &str = "test-worker";

pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(Duration::from_millis(2))
        .with_pause_poll(Duration::from_millis(5))
        .with_requeue_backoff(Duration::from_millis(5))
}

pub async fn memory_store() -> ExecutionStore {
    let pool = create_memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    ExecutionStore::new(pool)
}

pub async fn engine() -> ExecutionEngine {
    engine_with(fast_config()).await
}

pub async fn engine_with(config: EngineConfig) -> ExecutionEngine {
    ExecutionEngine::new(Arc::new(EngineContext::new(memory_store().await, config)))
}

pub fn wait_node(id: &str) -> PlanNode {
    PlanNode::new(id, id, "wait").with_facilitation(FacilitationMode::Async)
}

pub async fn node_by_identifier(
    engine: &ExecutionEngine,
    plan_execution_id: Uuid,
    identifier: &str,
) -> Vec<NodeExecution> {
    engine
        .store()
        .nodes()
        .find_by_plan(plan_execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.identifier == identifier)
        .collect()
}

pub async fn single(
    engine: &ExecutionEngine,
    plan_execution_id: Uuid,
    identifier: &str,
) -> NodeExecution {
    let mut nodes = node_by_identifier(engine, plan_execution_id, identifier).await;
    assert_eq!(nodes.len(), 1, "expected one `{identifier}` node");
    nodes.remove(0)
}
