//! CLI command definitions for the `rbk` binary.
//!
//! Uses clap derive macros for argument parsing. Every command addresses a
//! stored run by id, so a run started in one invocation can be advanced,
//! answered, and inspected from later ones.

pub mod interactive;
pub mod run;

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use uuid::Uuid;

/// Drive operational runbooks step by step.
#[derive(Parser)]
#[command(name = "rbk", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run of a runbook.
    Start {
        /// Runbook YAML file.
        path: PathBuf,

        /// Initial variable (repeatable), e.g. --var env=prod.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Run forward until the operator is needed or the run ends.
    Advance {
        run_id: Uuid,

        /// Stop after the next step.
        #[arg(long)]
        step: bool,
    },

    /// Resolve the pending step by picking an outcome (index or state).
    Choose { run_id: Uuid, outcome: String },

    /// Answer the pending choice.
    Choice {
        run_id: Uuid,
        variable: String,
        value: String,
    },

    /// Submit evidence for the pending step as name=value pairs.
    Evidence {
        run_id: Uuid,
        step_id: String,

        #[arg(value_parser = parse_var)]
        values: Vec<(String, Value)>,
    },

    /// Approve (or reject) the pending step.
    Approve {
        run_id: Uuid,
        step_id: String,

        #[arg(long)]
        reject: bool,
    },

    /// Acknowledge a pending step that needs no input.
    Ack { run_id: Uuid, step_id: String },

    /// Show variables and captures of a run.
    Vars { run_id: Uuid },

    /// Show the outline, pending step, and invoke stack of a run.
    Manifest { run_id: Uuid },

    /// Save a run as a replay scenario.
    #[command(name = "save-scenario")]
    SaveScenario {
        run_id: Uuid,

        /// Target directory (default: {data_dir}/scenarios/{run_id}).
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Replay a saved scenario to completion.
    Replay {
        /// Scenario file or directory holding scenario.json.
        scenario: PathBuf,
    },

    /// Start a runbook and walk it interactively.
    Run {
        path: PathBuf,

        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// Start the runbook an outcome names as `next`.
        #[arg(long)]
        follow: bool,
    },

    /// Continue a stored run interactively.
    Resume {
        run_id: Uuid,

        #[arg(long)]
        follow: bool,
    },

    /// Load and validate a runbook without starting it.
    Validate {
        path: PathBuf,

        /// Print the parsed runbook back as YAML.
        #[arg(long)]
        normalized: bool,
    },

    /// List stored runs.
    #[command(alias = "ls")]
    List,

    /// Delete a stored run.
    #[command(alias = "rm")]
    Delete {
        run_id: Uuid,

        /// Skip confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse `name=value`. Values that parse as JSON keep their type, anything
/// else is a string.
pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Collect parsed pairs; later duplicates win.
pub fn into_map(pairs: Vec<(String, Value)>) -> BTreeMap<String, Value> {
    pairs.into_iter().collect()
}
