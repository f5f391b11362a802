//! Persisted run state.
//!
//! `SessionState` is the durable record of a run: everything needed to
//! resume execution in another process. Tree positions are stored as stable
//! ids (step ids and iterate block keys), never as structural pointers, and
//! are resolved against a freshly loaded runbook on resume.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::scenario::{RecordedExchange, RecordedInput};

/// Current on-disk format of `SessionState`.
pub const SESSION_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Run mode & status
// ---------------------------------------------------------------------------

/// How step actions are executed for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunMode {
    /// Commands and tools run for real.
    #[default]
    Live,
    /// Actions and operator input are answered from a recorded scenario.
    Replay { scenario: PathBuf },
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingUser,
    Completed,
    OutcomeReached,
    Failed,
}

impl RunStatus {
    /// Whether no further execution can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::OutcomeReached | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::AwaitingUser => write!(f, "awaiting_user"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::OutcomeReached => write!(f, "outcome_reached"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialized continuation
// ---------------------------------------------------------------------------

/// One continuation unit in durable form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SerializedNode {
    /// A step, by id.
    Step { step_id: String, depth: u32 },
    /// An iterate block not yet expanded.
    Iterate { block: String, depth: u32 },
    /// Convergence watchpoint after pass `pass` (zero-based) of at most `max`.
    Converge {
        block: String,
        depth: u32,
        pass: u32,
        max: u32,
    },
    /// List watchpoint after item `index`.
    List {
        block: String,
        depth: u32,
        items: Vec<String>,
        index: usize,
        variable: String,
    },
}

impl SerializedNode {
    pub fn depth(&self) -> u32 {
        match self {
            SerializedNode::Step { depth, .. }
            | SerializedNode::Iterate { depth, .. }
            | SerializedNode::Converge { depth, .. }
            | SerializedNode::List { depth, .. } => *depth,
        }
    }
}

/// Input a pending step is waiting on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Named evidence values.
    Evidence,
    /// An approve/reject decision.
    Approval,
    /// A value for the step's choice variable.
    Choice,
    /// A bare acknowledgment that the step was done.
    Acknowledge,
    /// A pick among the step's outcomes.
    Outcome,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputKind::Evidence => "evidence",
            InputKind::Approval => "approval",
            InputKind::Choice => "choice",
            InputKind::Acknowledge => "acknowledge",
            InputKind::Outcome => "outcome",
        };
        f.write_str(s)
    }
}

/// The single step awaiting operator input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedPending {
    pub step_id: String,
    pub depth: u32,
    /// Inputs still outstanding.
    pub awaiting: Vec<InputKind>,
    /// Evidence received so far.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence: BTreeMap<String, Value>,
    /// Choice received so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
}

/// One continuation level (the root runbook or an invoked child).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedLevel {
    pub workflow: PathBuf,
    pub run_id: Uuid,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub captures: BTreeMap<String, Value>,
    #[serde(default)]
    pub queue: Vec<SerializedNode>,
    #[serde(default)]
    pub step_counter: u32,
    #[serde(default)]
    pub child_runs: Vec<ChildRun>,
}

/// A suspended parent level waiting on an invoked child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedFrame {
    pub parent: SerializedLevel,
    /// Invoke step in the parent runbook.
    pub invoking_step: String,
    /// Queue depth the invoking step ran at.
    pub depth: u32,
    /// Child terminal states that halt the parent.
    #[serde(default)]
    pub stop_if: Vec<String>,
    /// Parent capture name -> child capture/variable name.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Final status of a step in the history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of one step at one level of the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: String,
    /// Runbook the step belongs to.
    pub workflow: String,
    /// Run id of the level the step ran in.
    pub level_run_id: Uuid,
    pub status: StepStatus,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub captures: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the step was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// A completed invocation of a child runbook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildRun {
    pub run_id: Uuid,
    pub workflow: String,
    pub invoked_by: String,
    /// Terminal state: an outcome state, `completed`, or `failed`.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// A terminal outcome that fired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub state: String,
    pub recommendation: String,
    /// Step whose outcome fired.
    pub step_id: String,
    pub workflow: String,
    /// Runbook to chain to next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The durable record of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub format_version: u32,
    pub run_id: Uuid,
    /// Root runbook path.
    pub workflow: PathBuf,
    /// Content digest of the root runbook when the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_digest: Option<String>,
    #[serde(default)]
    pub mode: RunMode,
    pub status: RunStatus,
    /// Variables supplied when the run started.
    #[serde(default)]
    pub initial_variables: BTreeMap<String, Value>,
    /// The level currently executing.
    pub active: SerializedLevel,
    /// Suspended parents, outermost first.
    #[serde(default)]
    pub stack: Vec<SerializedFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<SerializedPending>,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    #[serde(default)]
    pub exchanges: Vec<RecordedExchange>,
    #[serde(default)]
    pub inputs: Vec<RecordedInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing entry for stored sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub run_id: Uuid,
    pub workflow: PathBuf,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

impl From<&SessionState> for SessionSummary {
    fn from(state: &SessionState) -> Self {
        Self {
            run_id: state.run_id,
            workflow: state.workflow.clone(),
            status: state.status,
            updated_at: state.updated_at,
        }
    }
}
