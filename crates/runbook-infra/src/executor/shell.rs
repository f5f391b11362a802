//! Live step executor.
//!
//! Commands run through the configured shell (`sh -c <command>`) in the
//! runbook's directory. Children are spawned with `kill_on_drop`, so when
//! the engine abandons an action on timeout or cancellation the process is
//! killed with it.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use runbook_core::runbook::executor::{
    CommandOutput, CommandRequest, ExecutionError, StepExecutor, ToolOutput, ToolRequest,
};

use super::tools::ToolRegistry;

/// Runs commands for real and dispatches tools to registered handlers.
pub struct ShellStepExecutor {
    shell: String,
    tools: ToolRegistry,
}

impl ShellStepExecutor {
    pub fn new(shell: impl Into<String>, tools: ToolRegistry) -> Self {
        Self {
            shell: shell.into(),
            tools,
        }
    }
}

impl StepExecutor for ShellStepExecutor {
    fn run_command<'a>(
        &'a self,
        request: &'a CommandRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(async move {
            let mut command = tokio::process::Command::new(&self.shell);
            command
                .arg("-c")
                .arg(&request.command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &request.working_dir {
                command.current_dir(dir);
            }

            tracing::debug!(step_id = %request.step_id, command = %request.command, "running command");
            let output = command
                .output()
                .await
                .map_err(|e| ExecutionError::Spawn(format!("{}: {e}", self.shell)))?;

            let result = CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            };
            tracing::debug!(
                step_id = %request.step_id,
                exit_code = ?result.exit_code,
                stdout_bytes = result.stdout.len(),
                "command finished"
            );
            Ok(result)
        })
    }

    fn run_tool<'a>(
        &'a self,
        request: &'a ToolRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(async move {
            let handler = self
                .tools
                .get(&request.tool)
                .ok_or_else(|| ExecutionError::UnknownTool(request.tool.clone()))?;
            tracing::debug!(step_id = %request.step_id, tool = %request.tool, "running tool");
            let output = handler.call(&request.args)?;
            Ok(ToolOutput {
                output,
                success: true,
            })
        })
    }
}
