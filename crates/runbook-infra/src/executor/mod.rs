//! Step executors and the per-run executor source.
//!
//! Live runs share one `ShellStepExecutor`; replay runs get a fresh
//! `ReplayExecutor` per request, positioned after whatever the run already
//! consumed.

pub mod replay;
pub mod shell;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use runbook_core::runbook::executor::{ExecutionError, ExecutorSource, StepExecutor};
use runbook_core::runbook::scenario::parse_scenario;
use runbook_types::config::RunbookConfig;
use runbook_types::scenario::{RecordedExchange, RecordedInput, Scenario};
use runbook_types::session::RunMode;

use self::replay::ReplayExecutor;
use self::shell::ShellStepExecutor;
use self::tools::ToolRegistry;

/// Chooses the shell executor or a replay executor by run mode.
pub struct DefaultExecutorSource {
    live: Arc<ShellStepExecutor>,
    scenarios: DashMap<PathBuf, Arc<Scenario>>,
}

impl DefaultExecutorSource {
    pub fn new(config: &RunbookConfig) -> Self {
        Self::with_tools(config, ToolRegistry::with_builtins())
    }

    pub fn with_tools(config: &RunbookConfig, tools: ToolRegistry) -> Self {
        Self {
            live: Arc::new(ShellStepExecutor::new(config.shell.clone(), tools)),
            scenarios: DashMap::new(),
        }
    }

    fn scenario(&self, path: &Path) -> Result<Arc<Scenario>, ExecutionError> {
        if let Some(cached) = self.scenarios.get(path) {
            return Ok(Arc::clone(cached.value()));
        }
        let json = std::fs::read_to_string(path)
            .map_err(|e| ExecutionError::Scenario(format!("{}: {e}", path.display())))?;
        let scenario = Arc::new(
            parse_scenario(&json).map_err(|e| ExecutionError::Scenario(e.to_string()))?,
        );
        self.scenarios.insert(path.to_path_buf(), Arc::clone(&scenario));
        Ok(scenario)
    }
}

impl ExecutorSource for DefaultExecutorSource {
    fn executor_for(
        &self,
        mode: &RunMode,
        consumed_exchanges: &[RecordedExchange],
        consumed_inputs: &[RecordedInput],
    ) -> Result<Arc<dyn StepExecutor>, ExecutionError> {
        match mode {
            RunMode::Live => {
                let executor: Arc<dyn StepExecutor> = self.live.clone();
                Ok(executor)
            }
            RunMode::Replay { scenario } => {
                let recorded = self.scenario(scenario)?;
                let replay = ReplayExecutor::new(&recorded, consumed_exchanges, consumed_inputs);
                tracing::debug!(
                    scenario = %scenario.display(),
                    remaining = replay.remaining(),
                    "replay executor ready"
                );
                let executor: Arc<dyn StepExecutor> = Arc::new(replay);
                Ok(executor)
            }
        }
    }
}
