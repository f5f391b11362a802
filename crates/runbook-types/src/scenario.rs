//! Replay scenarios.
//!
//! A scenario is everything a live run exchanged with the outside world:
//! command and tool results in execution order plus the operator input
//! submitted at each step. Replaying it against the same runbook reproduces
//! the run without touching real systems.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File name of a scenario inside its directory.
pub const SCENARIO_FILE: &str = "scenario.json";

/// A recorded run, written by `save_scenario`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub workflow: PathBuf,
    /// Variables the run was started with.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// When the recorded run started; replayed timestamps shift by
    /// `now - recorded_at`.
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub exchanges: Vec<RecordedExchange>,
    #[serde(default)]
    pub inputs: Vec<RecordedInput>,
}

/// One command or tool call and its result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedExchange {
    /// Match key: `command:<rendered command>` or `tool:<name>`.
    pub key: String,
    pub step_id: String,
    /// Rendered command string or tool arguments.
    pub request: Value,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

impl RecordedExchange {
    pub fn command_key(command: &str) -> String {
        format!("command:{command}")
    }

    pub fn tool_key(tool: &str) -> String {
        format!("tool:{tool}")
    }
}

/// Operator input submitted at a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordedInput {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    /// Outcome state picked with `choose_outcome`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exchange_keys() {
        assert_eq!(RecordedExchange::command_key("df -h"), "command:df -h");
        assert_eq!(RecordedExchange::tool_key("echo"), "tool:echo");
    }

    #[test]
    fn test_scenario_parses_with_defaults() {
        let json = json!({
            "workflow": "disk.yaml",
            "recorded_at": "2026-03-01T10:00:00Z",
            "exchanges": [{
                "key": "command:uptime",
                "step_id": "load",
                "request": "uptime",
                "stdout": "up 3 days",
                "exit_code": 0,
                "success": true,
                "recorded_at": "2026-03-01T10:00:01Z"
            }],
            "inputs": [{ "step_id": "ack" }]
        });
        let scenario: Scenario = serde_json::from_value(json).unwrap();
        assert!(scenario.variables.is_empty());
        assert_eq!(scenario.exchanges[0].stderr, "");
        assert_eq!(scenario.inputs[0].step_id, "ack");
        assert!(scenario.inputs[0].evidence.is_empty());
    }
}
