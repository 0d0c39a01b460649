//! Execution context threaded through every node of a running plan.
//!
//! An [`Ambiance`] is created once for the root of a plan execution and is
//! only ever derived from its parent afterwards: entering a node scope appends
//! a [`Level`], leaving it drops the last one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// Kind of scope a level represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LevelGroup {
    Pipeline,
    Stage,
    StepGroup,
    #[default]
    Step,
}

impl LevelGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Stage => "stage",
            Self::StepGroup => "step_group",
            Self::Step => "step",
        }
    }
}

impl fmt::Display for LevelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of the execution hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Level {
    /// Identity of the plan node; stable across retries.
    pub setup_id: String,
    /// Identity of this attempt; unique per execution.
    pub runtime_id: String,
    pub identifier: String,
    pub step_type: String,
    pub group: LevelGroup,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
        group: LevelGroup,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            identifier: identifier.into(),
            step_type: step_type.into(),
            group,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.setup_id.trim().is_empty() {
            return Err(CoreError::MalformedLevel(format!(
                "level `{}` has no setup id",
                self.identifier
            )));
        }
        if self.runtime_id.trim().is_empty() {
            return Err(CoreError::MalformedLevel(format!(
                "level `{}` has no runtime id",
                self.identifier
            )));
        }
        Ok(())
    }
}

/// Execution context: the level stack plus scoping abstractions.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,
    #[serde(default)]
    levels: Vec<Level>,
    #[serde(default)]
    setup_abstractions: HashMap<String, String>,
    /// Per-process expression evaluation token; never persisted.
    #[serde(skip)]
    expression_token: Option<u64>,
}

impl Ambiance {
    pub fn new(plan_execution_id: Uuid, setup_abstractions: HashMap<String, String>) -> Self {
        Self {
            plan_execution_id,
            levels: Vec::new(),
            setup_abstractions,
            expression_token: None,
        }
    }

    /// Returns this ambiance with `level` appended as the current level.
    pub fn add_level(mut self, level: Level) -> Result<Self, CoreError> {
        level.validate()?;
        self.levels.push(level);
        Ok(self)
    }

    /// Adds a scoping abstraction. Existing keys are inherited and never replaced.
    pub fn with_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions
            .entry(key.into())
            .or_insert_with(|| value.into());
        self
    }

    /// Deep copy with every level kept; the caller appends the child level.
    pub fn clone_for_child(&self) -> Self {
        self.deep_copy(self.levels.len())
    }

    /// Deep copy with the current level removed, returning to the parent scope.
    pub fn clone_for_finish(&self) -> Result<Self, CoreError> {
        if self.levels.is_empty() {
            return Err(CoreError::EmptyLevelStack);
        }
        Ok(self.deep_copy(self.levels.len() - 1))
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// The level of the enclosing scope, if any.
    pub fn parent_level(&self) -> Option<&Level> {
        self.levels.len().checked_sub(2).map(|idx| &self.levels[idx])
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn setup_abstractions(&self) -> &HashMap<String, String> {
        &self.setup_abstractions
    }

    pub fn abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    pub fn expression_token(&self) -> Option<u64> {
        self.expression_token
    }

    pub fn set_expression_token(&mut self, token: u64) {
        self.expression_token = Some(token);
    }

    /// Diagnostic key/value view for log spans. Never an input to engine decisions.
    pub fn log_context(&self) -> BTreeMap<String, String> {
        let mut context: BTreeMap<String, String> = self
            .setup_abstractions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        context.insert(
            "planExecutionId".to_string(),
            self.plan_execution_id.to_string(),
        );
        if let Some(level) = self.current_level() {
            context.insert("identifier".to_string(), level.identifier.clone());
            context.insert("runtimeId".to_string(), level.runtime_id.clone());
            context.insert("setupId".to_string(), level.setup_id.clone());
            context.insert("stepType".to_string(), level.step_type.clone());
            context.insert("group".to_string(), level.group.as_str().to_string());
        }
        context
    }

    fn deep_copy(&self, keep_levels: usize) -> Self {
        Self {
            plan_execution_id: self.plan_execution_id,
            levels: self.levels[..keep_levels].to_vec(),
            setup_abstractions: self
                .setup_abstractions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            expression_token: self.expression_token,
        }
    }
}

impl Clone for Ambiance {
    fn clone(&self) -> Self {
        self.clone_for_child()
    }
}

impl PartialEq for Ambiance {
    fn eq(&self, other: &Self) -> bool {
        self.plan_execution_id == other.plan_execution_id
            && self.levels == other.levels
            && self.setup_abstractions == other.setup_abstractions
    }
}

impl Eq for Ambiance {}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(id: &str) -> Level {
        Level::new(id, Uuid::new_v4().to_string(), id, "noop", LevelGroup::Step)
    }

    fn root() -> Ambiance {
        let mut abstractions = HashMap::new();
        abstractions.insert("accountId".to_string(), "acc-1".to_string());
        Ambiance::new(Uuid::new_v4(), abstractions)
            .add_level(Level::new(
                "pipeline",
                Uuid::new_v4().to_string(),
                "pipeline",
                "pipeline",
                LevelGroup::Pipeline,
            ))
            .unwrap()
    }

    #[test]
    fn test_add_level_rejects_malformed() {
        let mut bad = level("build");
        bad.runtime_id = String::new();
        let err = root().add_level(bad).unwrap_err();
        assert!(matches!(err, CoreError::MalformedLevel(_)));

        let mut bad = level("build");
        bad.setup_id = "  ".to_string();
        assert!(root().add_level(bad).is_err());
    }

    #[test]
    fn test_current_level_is_last() {
        let ambiance = root().add_level(level("build")).unwrap();
        assert_eq!(ambiance.current_level().unwrap().setup_id, "build");
        assert_eq!(ambiance.parent_level().unwrap().setup_id, "pipeline");

        let empty = Ambiance::new(Uuid::new_v4(), HashMap::new());
        assert!(empty.current_level().is_none());
        assert!(empty.parent_level().is_none());
    }

    #[test]
    fn test_child_scope_round_trip() {
        let original = root().add_level(level("stage")).unwrap();
        let child = original.clone_for_child().add_level(level("step")).unwrap();
        assert_eq!(child.levels().len(), original.levels().len() + 1);

        let back = child.clone_for_finish().unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_clone_for_finish_on_empty_stack_fails() {
        let empty = Ambiance::new(Uuid::new_v4(), HashMap::new());
        assert_eq!(
            empty.clone_for_finish().unwrap_err(),
            CoreError::EmptyLevelStack
        );
    }

    #[test]
    fn test_clones_are_independent() {
        let original = root();
        let child = original
            .clone_for_child()
            .with_abstraction("projectIdentifier", "proj")
            .add_level(level("step"))
            .unwrap();

        assert_eq!(original.levels().len(), 1);
        assert!(original.abstraction("projectIdentifier").is_none());
        assert_eq!(child.abstraction("projectIdentifier"), Some("proj"));
    }

    #[test]
    fn test_abstractions_are_never_replaced() {
        let ambiance = root().with_abstraction("accountId", "other");
        assert_eq!(ambiance.abstraction("accountId"), Some("acc-1"));
    }

    #[test]
    fn test_expression_token_is_not_persisted() {
        let mut ambiance = root();
        ambiance.set_expression_token(42);
        assert_eq!(ambiance.clone_for_child().expression_token(), Some(42));

        let json = serde_json::to_string(&ambiance).unwrap();
        let decoded: Ambiance = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.expression_token(), None);
        assert_eq!(decoded, ambiance);
    }

    #[test]
    fn test_log_context() {
        let ambiance = root().add_level(level("deploy")).unwrap();
        let context = ambiance.log_context();
        assert_eq!(context.get("accountId").map(String::as_str), Some("acc-1"));
        assert_eq!(context.get("identifier").map(String::as_str), Some("deploy"));
        assert!(context.contains_key("planExecutionId"));
    }
}
