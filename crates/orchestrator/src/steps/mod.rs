//! Step type lookup.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::StepExecutor;

pub use builtin::{
    FailStep, NoopStep, ParallelStep, SectionStep, SleepStep, TaskStep, WaitStep,
};

/// Step executors keyed by step type. Built once at startup.
#[derive(Clone, Default)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in step type.
    pub fn with_builtins() -> Self {
        Self::new()
            .with("noop", Arc::new(NoopStep))
            .with("fail", Arc::new(FailStep))
            .with("wait", Arc::new(WaitStep))
            .with("sleep", Arc::new(SleepStep))
            .with("task", Arc::new(TaskStep))
            .with("section", Arc::new(SectionStep))
            .with("parallel", Arc::new(ParallelStep))
    }

    pub fn register(&mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type.into(), executor);
    }

    pub fn with(mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(step_type, executor);
        self
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
