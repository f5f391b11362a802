//! Engine configuration types.
//!
//! `RunbookConfig` is the top-level `config.toml` in the data directory. It
//! controls invoke nesting, iteration defaults, step timeouts, and which
//! session backend persists runs.

use serde::{Deserialize, Serialize};

/// Maximum invoke nesting depth when not configured.
pub const DEFAULT_MAX_INVOKE_DEPTH: u32 = 5;

/// Passes a convergence block runs when it declares no `max`.
pub const DEFAULT_MAX_PASSES: u32 = 5;

/// Default per-step timeout in seconds (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Top-level configuration for the runbook engine.
///
/// Loaded from `~/.runbook/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunbookConfig {
    /// Maximum nesting depth of invoke steps.
    #[serde(default = "default_max_invoke_depth")]
    pub max_invoke_depth: u32,

    /// Passes a convergence block may run when it declares no `max`.
    #[serde(default = "default_max_passes")]
    pub default_max_passes: u32,

    /// Timeout applied to command and tool steps without their own.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Capacity of the run event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Where sessions are persisted.
    #[serde(default)]
    pub session_backend: SessionBackend,

    /// Shell used to run command steps.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_max_invoke_depth() -> u32 {
    DEFAULT_MAX_INVOKE_DEPTH
}

fn default_max_passes() -> u32 {
    DEFAULT_MAX_PASSES
}

fn default_step_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_event_capacity() -> usize {
    1024
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for RunbookConfig {
    fn default() -> Self {
        Self {
            max_invoke_depth: default_max_invoke_depth(),
            default_max_passes: default_max_passes(),
            step_timeout_secs: default_step_timeout_secs(),
            event_capacity: default_event_capacity(),
            session_backend: SessionBackend::default(),
            shell: default_shell(),
        }
    }
}

/// Session persistence backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    /// One JSON file per run under `{data_dir}/sessions/`.
    #[default]
    File,
    /// Rows in `{data_dir}/runbook.db`.
    Sqlite,
}
