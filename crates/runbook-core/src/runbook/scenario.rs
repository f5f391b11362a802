//! Scenario capture for deterministic replay.

use std::path::{Path, PathBuf};

use runbook_types::scenario::{SCENARIO_FILE, Scenario};

use super::session::RunSession;

/// Errors reading or writing a scenario.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("scenario I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid scenario: {0}")]
    Invalid(String),
}

/// Everything the run exchanged with the outside world so far.
pub fn build_scenario(session: &RunSession) -> Scenario {
    Scenario {
        workflow: session.root_workflow.clone(),
        variables: session.initial_variables.clone(),
        recorded_at: session.created_at,
        exchanges: session.exchanges.clone(),
        inputs: session.inputs.clone(),
    }
}

/// Where a scenario lives inside `dir`. A path naming a `.json` file is
/// used as is.
pub fn scenario_path(dir: &Path) -> PathBuf {
    if dir.extension().is_some_and(|ext| ext == "json") {
        dir.to_path_buf()
    } else {
        dir.join(SCENARIO_FILE)
    }
}

pub fn parse_scenario(json: &str) -> Result<Scenario, ScenarioError> {
    serde_json::from_str(json).map_err(|e| ScenarioError::Invalid(e.to_string()))
}

pub fn serialize_scenario(scenario: &Scenario) -> Result<String, ScenarioError> {
    serde_json::to_string_pretty(scenario).map_err(|e| ScenarioError::Invalid(e.to_string()))
}
