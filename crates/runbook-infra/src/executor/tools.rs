//! Tool handlers for `tool` steps.
//!
//! A tool step names a handler and passes rendered JSON arguments. The
//! built-ins are `echo` (returns its arguments) and `env` (reads an
//! environment variable).

use std::collections::HashMap;
use std::sync::Arc;

use runbook_core::runbook::executor::ExecutionError;
use serde_json::{Value, json};

/// A named tool action.
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn call(&self, args: &Value) -> Result<Value, ExecutionError>;
}

pub struct EchoTool;

impl ToolHandler for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn call(&self, args: &Value) -> Result<Value, ExecutionError> {
        Ok(args.clone())
    }
}

/// Reads `{"name": "VAR"}` (or a bare string) from the process environment.
pub struct EnvTool;

impl ToolHandler for EnvTool {
    fn name(&self) -> &str {
        "env"
    }

    fn call(&self, args: &Value) -> Result<Value, ExecutionError> {
        let name = match args {
            Value::String(name) => name.as_str(),
            Value::Object(map) => map.get("name").and_then(Value::as_str).ok_or_else(|| {
                ExecutionError::Tool {
                    tool: "env".to_string(),
                    message: "missing 'name' argument".to_string(),
                }
            })?,
            other => {
                return Err(ExecutionError::Tool {
                    tool: "env".to_string(),
                    message: format!("expected a variable name, got {other}"),
                });
            }
        };
        let value = std::env::var(name).ok();
        Ok(json!({ "name": name, "value": value }))
    }
}

/// Handlers by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `echo` and `env`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(EnvTool));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
