//! Step executor collaborator interface.
//!
//! The engine never runs commands or tools itself. It hands rendered
//! requests to a `StepExecutor`, which may run them for real, answer them
//! from a recorded scenario, or script them in tests. Executors may also
//! supply recorded operator input so manual steps resolve without a prompt.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use runbook_types::scenario::{RecordedExchange, RecordedInput};
use runbook_types::session::RunMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from executing a step action.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("no recorded response for '{key}' (step '{step_id}')")]
    NoRecordedResponse { key: String, step_id: String },

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution cancelled")]
    Cancelled,

    #[error("scenario error: {0}")]
    Scenario(String),
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A rendered shell command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub step_id: String,
    pub command: String,
    /// Directory of the runbook the step belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl CommandRequest {
    pub fn key(&self) -> String {
        RecordedExchange::command_key(&self.command)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A tool action with rendered arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub step_id: String,
    pub tool: String,
    pub args: Value,
}

impl ToolRequest {
    pub fn key(&self) -> String {
        RecordedExchange::tool_key(&self.tool)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: Value,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Runs command and tool actions for the engine.
///
/// Object-safe: futures are boxed so executors can be selected at runtime.
pub trait StepExecutor: Send + Sync {
    fn run_command<'a>(
        &'a self,
        request: &'a CommandRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutput, ExecutionError>> + Send + 'a>>;

    fn run_tool<'a>(
        &'a self,
        request: &'a ToolRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ExecutionError>> + Send + 'a>>;

    /// Operator input already known for `step_id` (replay).
    fn recorded_input(&self, _step_id: &str) -> Option<RecordedInput> {
        None
    }
}

/// Chooses the executor for a run.
///
/// Receives what the run has already consumed so a replaying executor can
/// continue where the previous request stopped.
pub trait ExecutorSource: Send + Sync {
    fn executor_for(
        &self,
        mode: &RunMode,
        consumed_exchanges: &[RecordedExchange],
        consumed_inputs: &[RecordedInput],
    ) -> Result<Arc<dyn StepExecutor>, ExecutionError>;
}
