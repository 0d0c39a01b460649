//! Static, compiled description of the work graph.
//!
//! Plans are produced outside the engine; the engine only reads them. The one
//! piece of compile-time work done here is [`Plan::validate`], which rejects
//! malformed graphs before any node runs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::adviser::AdviserObtainment;
use super::ambiance::{Level, LevelGroup};
use crate::error::CoreError;

/// How a step hands off control to the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FacilitationMode {
    #[default]
    Sync,
    Async,
    Task,
    Child,
    Children,
}

impl FacilitationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Task => "task",
            Self::Child => "child",
            Self::Children => "children",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(Self::Sync),
            "async" => Some(Self::Async),
            "task" => Some(Self::Task),
            "child" => Some(Self::Child),
            "children" => Some(Self::Children),
            _ => None,
        }
    }

    /// Modes that park the node until a notification arrives.
    pub fn awaits_notify(&self) -> bool {
        matches!(self, Self::Async | Self::Task)
    }

    pub fn spawns_children(&self) -> bool {
        matches!(self, Self::Child | Self::Children)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanNode {
    /// Setup id, unique within the plan.
    pub id: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub step_type: String,
    #[serde(default)]
    pub group: LevelGroup,
    #[serde(default)]
    pub facilitation: FacilitationMode,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
    #[serde(default)]
    pub next_node_id: Option<String>,
    #[serde(default)]
    pub on_failure_node_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PlanNode {
    pub fn new(
        id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            id: id.into(),
            name: identifier.clone(),
            identifier,
            step_type: step_type.into(),
            group: LevelGroup::Step,
            facilitation: FacilitationMode::Sync,
            parameters: serde_json::Value::Null,
            advisers: Vec::new(),
            next_node_id: None,
            on_failure_node_id: None,
            children: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn with_group(mut self, group: LevelGroup) -> Self {
        self.group = group;
        self
    }

    pub fn with_facilitation(mut self, facilitation: FacilitationMode) -> Self {
        self.facilitation = facilitation;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_next(mut self, next_node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(next_node_id.into());
        self
    }

    pub fn with_on_failure(mut self, node_id: impl Into<String>) -> Self {
        self.on_failure_node_id = Some(node_id.into());
        self
    }

    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The level this node contributes to an ambiance for one attempt.
    pub fn level(&self, attempt_id: Uuid) -> Level {
        Level::new(
            self.id.clone(),
            attempt_id.to_string(),
            self.identifier.clone(),
            self.step_type.clone(),
            self.group,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub start_node_id: String,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn new(name: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            start_node_id: start_node_id.into(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&PlanNode> {
        self.node(&self.start_node_id)
    }

    /// Compile-time checks; a plan that passes never fails the engine on shape.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(CoreError::invalid_plan(format!(
                    "node `{}` has an empty id",
                    node.identifier
                )));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(CoreError::invalid_plan(format!(
                    "duplicate node id `{}`",
                    node.id
                )));
            }
        }

        if self.start_node().is_none() {
            return Err(CoreError::invalid_plan(format!(
                "start node `{}` does not exist",
                self.start_node_id
            )));
        }

        for node in &self.nodes {
            self.validate_node(node)?;
        }
        self.check_next_cycles()
    }

    fn validate_node(&self, node: &PlanNode) -> Result<(), CoreError> {
        let edges = node
            .next_node_id
            .iter()
            .chain(node.on_failure_node_id.iter())
            .chain(node.children.iter());
        for target in edges {
            if self.node(target).is_none() {
                return Err(CoreError::invalid_plan(format!(
                    "node `{}` references unknown node `{}`",
                    node.id, target
                )));
            }
        }

        match node.facilitation {
            FacilitationMode::Child if node.children.len() != 1 => {
                return Err(CoreError::invalid_plan(format!(
                    "child node `{}` must declare exactly one child",
                    node.id
                )));
            }
            FacilitationMode::Children if node.children.is_empty() => {
                return Err(CoreError::invalid_plan(format!(
                    "children node `{}` declares no children",
                    node.id
                )));
            }
            FacilitationMode::Sync | FacilitationMode::Async | FacilitationMode::Task
                if !node.children.is_empty() =>
            {
                return Err(CoreError::invalid_plan(format!(
                    "{} node `{}` cannot declare children",
                    node.facilitation.as_str(),
                    node.id
                )));
            }
            _ => {}
        }

        for adviser in &node.advisers {
            match adviser {
                AdviserObtainment::OnFail(_) if node.on_failure_node_id.is_none() => {
                    return Err(CoreError::invalid_plan(format!(
                        "node `{}` uses on_fail without an on_failure_node_id",
                        node.id
                    )));
                }
                AdviserObtainment::Retry(retry) if retry.max_retries == 0 => {
                    return Err(CoreError::invalid_plan(format!(
                        "node `{}` declares a retry adviser with max_retries = 0",
                        node.id
                    )));
                }
                AdviserObtainment::OnSuccess(on_success) => {
                    if let Some(target) = &on_success.next_node_id {
                        if self.node(target).is_none() {
                            return Err(CoreError::invalid_plan(format!(
                                "node `{}` advises success to unknown node `{}`",
                                node.id, target
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_next_cycles(&self) -> Result<(), CoreError> {
        for start in &self.nodes {
            let mut visited = HashSet::new();
            let mut current = Some(start);
            while let Some(node) = current {
                if !visited.insert(node.id.as_str()) {
                    return Err(CoreError::invalid_plan(format!(
                        "next edges starting at `{}` form a cycle",
                        start.id
                    )));
                }
                current = node.next_node_id.as_deref().and_then(|id| self.node(id));
            }
        }
        Ok(())
    }
}
