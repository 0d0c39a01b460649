use conductor_core::{Ambiance, FailureInfo, EXPRESSION_ERROR};
use regex::{Captures, Regex};
use serde_json::Value;

/// Turns a plan node's raw parameters into the values a step runs with.
pub trait ParameterResolver: Send + Sync {
    fn resolve(&self, raw: &Value, ambiance: &Ambiance) -> Result<Value, FailureInfo>;
}

/// Substitutes `${...}` expressions inside string values, recursively through
/// arrays and objects. Supported expressions:
///
/// - `${setup.<key>}`: a setup abstraction such as `accountId`
/// - `${level.identifier}`, `${level.stepType}`, `${level.setupId}`, `${level.runtimeId}`
/// - `${plan.executionId}`
pub struct TemplateResolver {
    pattern: Regex,
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}")
                .expect("Invalid expression regex pattern"),
        }
    }

    fn lookup(expression: &str, ambiance: &Ambiance) -> Option<String> {
        let level = ambiance.current_level();
        match expression.split_once('.') {
            Some(("setup", key)) => ambiance.abstraction(key).map(str::to_string),
            Some(("level", "identifier")) => level.map(|l| l.identifier.clone()),
            Some(("level", "stepType")) => level.map(|l| l.step_type.clone()),
            Some(("level", "setupId")) => level.map(|l| l.setup_id.clone()),
            Some(("level", "runtimeId")) => level.map(|l| l.runtime_id.clone()),
            Some(("plan", "executionId")) => Some(ambiance.plan_execution_id.to_string()),
            _ => None,
        }
    }

    fn resolve_str(&self, raw: &str, ambiance: &Ambiance) -> Result<String, FailureInfo> {
        let mut missing = None;
        let resolved = self.pattern.replace_all(raw, |caps: &Captures<'_>| {
            let expression = &caps[1];
            match Self::lookup(expression, ambiance) {
                Some(value) => value,
                None => {
                    missing.get_or_insert_with(|| expression.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(expression) => Err(FailureInfo::new(
                EXPRESSION_ERROR,
                format!("cannot resolve `${{{expression}}}`"),
            )),
            None => Ok(resolved.into_owned()),
        }
    }
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterResolver for TemplateResolver {
    fn resolve(&self, raw: &Value, ambiance: &Ambiance) -> Result<Value, FailureInfo> {
        match raw {
            Value::String(s) => self.resolve_str(s, ambiance).map(Value::String),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, ambiance))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(v, ambiance)?)))
                .collect::<Result<serde_json::Map<_, _>, FailureInfo>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{Level, LevelGroup};
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn ambiance() -> Ambiance {
        let mut abstractions = HashMap::new();
        abstractions.insert("accountId".to_string(), "acc-1".to_string());
        Ambiance::new(Uuid::new_v4(), abstractions)
            .add_level(Level::new("s1", "r1", "build", "shell", LevelGroup::Step))
            .unwrap()
    }

    #[test]
    fn test_resolves_nested_values() {
        let ambiance = ambiance();
        let raw = json!({
            "target": "${setup.accountId}/${level.identifier}",
            "args": ["--run", "${plan.executionId}"],
            "retries": 3
        });
        let resolved = TemplateResolver::new().resolve(&raw, &ambiance).unwrap();
        assert_eq!(resolved["target"], "acc-1/build");
        assert_eq!(resolved["args"][1], ambiance.plan_execution_id.to_string());
        assert_eq!(resolved["retries"], 3);
    }

    #[test]
    fn test_unknown_expression_is_expression_error() {
        let err = TemplateResolver::new()
            .resolve(&json!({"x": "${setup.orgId}"}), &ambiance())
            .unwrap_err();
        assert!(err.has_code(EXPRESSION_ERROR));
        assert!(err.error_message().contains("setup.orgId"));
    }

    #[test]
    fn test_plain_strings_untouched() {
        let resolved = TemplateResolver::new()
            .resolve(&json!("echo $HOME"), &ambiance())
            .unwrap();
        assert_eq!(resolved, json!("echo $HOME"));
    }
}
