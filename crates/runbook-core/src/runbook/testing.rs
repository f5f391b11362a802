//! In-memory collaborators for engine and session tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use runbook_types::scenario::RecordedInput;

use super::compiled::CompiledRunbook;
use super::definition::{RunbookError, parse_runbook_yaml};
use super::executor::{
    CommandOutput, CommandRequest, ExecutionError, StepExecutor, ToolOutput, ToolRequest,
};
use super::loader::RunbookLoader;

/// Loader over YAML strings keyed by path.
#[derive(Default)]
pub struct MapLoader {
    sources: HashMap<PathBuf, String>,
}

impl MapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, yaml: &str) -> Self {
        self.sources.insert(PathBuf::from(path), yaml.to_string());
        self
    }
}

impl RunbookLoader for MapLoader {
    fn load(&self, path: &Path) -> Result<Arc<CompiledRunbook>, RunbookError> {
        let yaml = self
            .sources
            .get(path)
            .ok_or_else(|| RunbookError::NotFound(path.display().to_string()))?;
        let definition = parse_runbook_yaml(yaml)?;
        Ok(Arc::new(CompiledRunbook::compile(path, definition, None)?))
    }
}

/// Executor answering commands from a script; unscripted commands succeed
/// with empty output. Tools echo their arguments.
#[derive(Default)]
pub struct ScriptedExecutor {
    commands: HashMap<String, Vec<CommandOutput>>,
    inputs: HashMap<String, RecordedInput>,
    hanging: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for `command`; the last one repeats.
    pub fn respond(mut self, command: &str, stdout: &str, exit_code: i32) -> Self {
        self.commands
            .entry(command.to_string())
            .or_default()
            .push(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(exit_code),
            });
        self
    }

    /// Make `command` never return.
    pub fn hang(mut self, command: &str) -> Self {
        self.hanging.insert(command.to_string());
        self
    }

    pub fn with_input(mut self, input: RecordedInput) -> Self {
        self.inputs.insert(input.step_id.clone(), input);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn run_command<'a>(
        &'a self,
        request: &'a CommandRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(async move {
            let seen = {
                let mut calls = self.calls.lock().unwrap();
                let seen = calls.iter().filter(|c| **c == request.command).count();
                calls.push(request.command.clone());
                seen
            };

            if self.hanging.contains(&request.command) {
                std::future::pending::<()>().await;
            }

            match self.commands.get(&request.command) {
                Some(responses) if !responses.is_empty() => {
                    let index = seen.min(responses.len() - 1);
                    Ok(responses[index].clone())
                }
                _ => Ok(CommandOutput {
                    exit_code: Some(0),
                    ..CommandOutput::default()
                }),
            }
        })
    }

    fn run_tool<'a>(
        &'a self,
        request: &'a ToolRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(format!("tool:{}", request.tool));
            Ok(ToolOutput {
                output: request.args.clone(),
                success: true,
            })
        })
    }

    fn recorded_input(&self, step_id: &str) -> Option<RecordedInput> {
        self.inputs.get(step_id).cloned()
    }
}
