//! Variables and captures of one continuation level.
//!
//! Expressions see a merged environment: every variable and capture at the
//! top level (captures shadow variables of the same name), plus the
//! `variables` and `captures` namespaces and `run` metadata.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use uuid::Uuid;

/// Variable name holding the zero-based iteration index.
pub const ITERATION_VARIABLE: &str = "iteration";

/// Mutable data state of one level of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    pub variables: BTreeMap<String, Value>,
    pub captures: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(variables: BTreeMap<String, Value>) -> Self {
        Self {
            variables,
            captures: BTreeMap::new(),
        }
    }

    /// Seed from declared defaults, then apply overrides.
    pub fn seeded(
        defaults: &BTreeMap<String, Value>,
        overrides: BTreeMap<String, Value>,
    ) -> Self {
        let mut variables = defaults.clone();
        variables.extend(overrides);
        Self::new(variables)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn set_capture(&mut self, name: impl Into<String>, value: Value) {
        self.captures.insert(name.into(), value);
    }

    /// Set `iteration`, stored as a float so JEXL numeric comparisons work.
    pub fn set_iteration(&mut self, index: u32) {
        self.set_variable(ITERATION_VARIABLE, json!(f64::from(index)));
    }

    /// Resolve a name: capture first, then variable.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.captures.get(name).or_else(|| self.variables.get(name))
    }

    /// Variables and captures merged into one map (captures win).
    pub fn merged(&self) -> BTreeMap<String, Value> {
        let mut merged = self.variables.clone();
        merged.extend(self.captures.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Build the JSON object expressions evaluate against.
    pub fn to_env(&self, run_id: Uuid, runbook: &str) -> Value {
        let mut env = serde_json::Map::new();
        for (key, value) in self.merged() {
            env.insert(key, value);
        }
        env.insert("variables".to_string(), json!(self.variables));
        env.insert("captures".to_string(), json!(self.captures));
        env.insert(
            "run".to_string(),
            json!({ "id": run_id.to_string(), "runbook": runbook }),
        );
        Value::Object(env)
    }
}
