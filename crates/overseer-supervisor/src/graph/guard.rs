use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use overseer_core::types::WorkflowState;

type Predicate = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// How a named guard reads the workflow state.
///
/// Guards are pure: evaluating one never writes to the state.
#[derive(Clone)]
pub enum GuardRule {
    Always,
    /// Truthiness of `key`, or `default` when the key is absent.
    Flag { key: String, default: bool },
    /// Negated truthiness of `key`; `default` stands in for the absent key
    /// before negation.
    NotFlag { key: String, default: bool },
    Predicate(Predicate),
}

impl GuardRule {
    pub fn flag(key: impl Into<String>, default: bool) -> Self {
        Self::Flag {
            key: key.into(),
            default,
        }
    }

    pub fn not_flag(key: impl Into<String>, default: bool) -> Self {
        Self::NotFlag {
            key: key.into(),
            default,
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn evaluate(&self, state: &WorkflowState) -> bool {
        match self {
            Self::Always => true,
            Self::Flag { key, default } => state.get(key).map(truthy).unwrap_or(*default),
            Self::NotFlag { key, default } => !state.get(key).map(truthy).unwrap_or(*default),
            Self::Predicate(f) => f(state),
        }
    }
}

impl fmt::Debug for GuardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Flag { key, default } => f
                .debug_struct("Flag")
                .field("key", key)
                .field("default", default)
                .finish(),
            Self::NotFlag { key, default } => f
                .debug_struct("NotFlag")
                .field("key", key)
                .field("default", default)
                .finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// JSON truthiness: false, null, zero and empty values are false.
pub fn truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Name → rule table consulted by edge guards.
#[derive(Debug, Clone)]
pub struct GuardRegistry {
    rules: HashMap<String, GuardRule>,
}

impl GuardRegistry {
    /// An empty registry, not even `always`.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// The built-in guards of the sample analysis pipeline.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register("always", GuardRule::Always);
        reg.register("input_valid", GuardRule::flag("input_valid", true));
        reg.register("analysis_complete", GuardRule::flag("analysis_complete", true));
        reg.register("requires_execution", GuardRule::flag("requires_execution", true));
        reg.register("ready_for_output", GuardRule::flag("ready_for_output", false));
        reg.register("execution_complete", GuardRule::flag("execution_complete", false));
        reg.register("validation_passed", GuardRule::flag("validation_passed", true));
        reg.register("validation_failed", GuardRule::not_flag("validation_passed", false));
        reg
    }

    /// Add or replace a guard.
    pub fn register(&mut self, name: impl Into<String>, rule: GuardRule) {
        self.rules.insert(name.into(), rule);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&GuardRule> {
        self.rules.get(name)
    }

    /// Evaluate a guard by name. Unknown names are `None`.
    pub fn evaluate(&self, name: &str, state: &WorkflowState) -> Option<bool> {
        self.rules.get(name).map(|r| r.evaluate(state))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for GuardRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(name: &str, state: &WorkflowState) -> bool {
        GuardRegistry::with_builtins().evaluate(name, state).unwrap()
    }

    #[test]
    fn test_builtin_defaults_on_empty_state() {
        let s = WorkflowState::new();
        assert!(eval("always", &s));
        assert!(eval("input_valid", &s));
        assert!(eval("analysis_complete", &s));
        assert!(eval("requires_execution", &s));
        assert!(!eval("ready_for_output", &s));
        assert!(!eval("execution_complete", &s));
        assert!(eval("validation_passed", &s));
        // Absent validation_passed reads as false before negation.
        assert!(eval("validation_failed", &s));
    }

    #[test]
    fn test_validation_failed_inverts_validation_passed() {
        let mut s = WorkflowState::new();
        s.set("validation_passed", json!(true));
        assert!(!eval("validation_failed", &s));
        s.set("validation_passed", json!(false));
        assert!(eval("validation_failed", &s));
        assert!(!eval("validation_passed", &s));
    }

    #[test]
    fn test_explicit_flags_override_defaults() {
        let mut s = WorkflowState::new();
        s.set("input_valid", json!(false));
        s.set("ready_for_output", json!(true));
        assert!(!eval("input_valid", &s));
        assert!(eval("ready_for_output", &s));
    }

    #[test]
    fn test_truthiness_of_non_bool_values() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!(2.5)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("yes")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!({"a": 1})));
    }

    #[test]
    fn test_unknown_guard_is_none() {
        let reg = GuardRegistry::with_builtins();
        assert_eq!(reg.evaluate("made_up", &WorkflowState::new()), None);
        assert!(GuardRegistry::empty().evaluate("always", &WorkflowState::new()).is_none());
    }

    #[test]
    fn test_predicate_guard_is_repeatable() {
        let mut reg = GuardRegistry::empty();
        reg.register(
            "high_score",
            GuardRule::predicate(|s| s.get("score").and_then(|v| v.as_i64()).unwrap_or(0) > 5),
        );
        let mut s = WorkflowState::new();
        s.set("score", json!(9));
        let first = reg.evaluate("high_score", &s);
        let second = reg.evaluate("high_score", &s);
        assert_eq!(first, Some(true));
        assert_eq!(first, second);
        assert_eq!(s.len(), 1);
    }
}
