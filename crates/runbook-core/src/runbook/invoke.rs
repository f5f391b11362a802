//! Continuation levels and the invoke stack.
//!
//! Each runbook being executed owns a `Level`: its compiled tree, data
//! context, and continuation queue. Invoking a child suspends the current
//! level inside an `InvokeFrame` together with the invoke step's gate and
//! output mapping; the child becomes the active level until it ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use runbook_types::runbook::{Step, StepKind};
use runbook_types::session::ChildRun;
use serde_json::{Value, json};
use uuid::Uuid;

use super::compiled::CompiledRunbook;
use super::context::RunContext;
use super::continuation::{Continuation, ContinuationError};

/// Child key that maps the child's terminal state.
pub const OUTCOME_KEY: &str = "outcome";

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// One runbook in execution.
#[derive(Debug, Clone)]
pub struct Level {
    pub runbook: Arc<CompiledRunbook>,
    pub run_id: Uuid,
    pub context: RunContext,
    pub queue: Continuation,
    /// Steps started at this level.
    pub step_counter: u32,
    pub child_runs: Vec<ChildRun>,
}

impl Level {
    /// Start a level: declared defaults overlaid with `variables`, queue set
    /// to the top-level nodes at depth 0.
    pub fn start(
        runbook: Arc<CompiledRunbook>,
        variables: BTreeMap<String, Value>,
    ) -> Result<Self, ContinuationError> {
        let context = RunContext::seeded(&runbook.definition().variables, variables);
        let queue = Continuation::from_nodes(&runbook, runbook.top_level(), 0)?;
        Ok(Self {
            runbook,
            run_id: Uuid::now_v7(),
            context,
            queue,
            step_counter: 0,
            child_runs: Vec::new(),
        })
    }

    /// Expression environment for this level.
    pub fn env(&self) -> Value {
        self.context.to_env(self.run_id, self.runbook.name())
    }

    pub fn workflow_label(&self) -> String {
        self.runbook.path().display().to_string()
    }
}

// ---------------------------------------------------------------------------
// InvokeFrame
// ---------------------------------------------------------------------------

/// A suspended parent level.
#[derive(Debug, Clone)]
pub struct InvokeFrame {
    pub parent: Level,
    pub invoking_step: Arc<Step>,
    /// Queue depth the invoke step ran at.
    pub depth: u32,
    pub stop_if: Vec<String>,
    pub outputs: BTreeMap<String, String>,
}

impl InvokeFrame {
    /// Suspend `parent`, taking gate and outputs from the invoke step.
    pub fn new(parent: Level, invoking_step: Arc<Step>, depth: u32) -> Self {
        let (stop_if, outputs) = match &invoking_step.kind {
            StepKind::Invoke(spec) => (
                spec.gate
                    .as_ref()
                    .map(|g| g.stop_if.clone())
                    .unwrap_or_default(),
                spec.outputs.clone(),
            ),
            _ => (Vec::new(), BTreeMap::new()),
        };
        Self {
            parent,
            invoking_step,
            depth,
            stop_if,
            outputs,
        }
    }

    /// Whether a child ending in `state` halts the parent.
    pub fn gate_matches(&self, state: &str) -> bool {
        self.stop_if.iter().any(|s| s == state)
    }
}

/// Stack of suspended parents, outermost first.
#[derive(Debug, Clone, Default)]
pub struct InvokeStack {
    frames: Vec<InvokeFrame>,
}

impl InvokeStack {
    pub fn push(&mut self, frame: InvokeFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<InvokeFrame> {
        self.frames.pop()
    }

    /// Current nesting depth (0 at the root).
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvokeFrame> {
        self.frames.iter()
    }
}

impl FromIterator<InvokeFrame> for InvokeStack {
    fn from_iter<T: IntoIterator<Item = InvokeFrame>>(iter: T) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output mapping
// ---------------------------------------------------------------------------

/// Copy child values into parent captures per `outputs` (parent <- child).
///
/// Child keys resolve to a capture, then a variable, then the pseudo-key
/// `outcome` (the child's terminal state). Returns the values applied.
pub fn apply_outputs(
    outputs: &BTreeMap<String, String>,
    child: &RunContext,
    child_state: &str,
    parent: &mut RunContext,
) -> BTreeMap<String, Value> {
    let mut applied = BTreeMap::new();
    for (parent_key, child_key) in outputs {
        let value = match child.lookup(child_key) {
            Some(value) => value.clone(),
            None if child_key == OUTCOME_KEY => json!(child_state),
            None => {
                tracing::debug!(
                    parent_key = %parent_key,
                    child_key = %child_key,
                    "invoke output has no value in child"
                );
                continue;
            }
        };
        parent.set_capture(parent_key.clone(), value.clone());
        applied.insert(parent_key.clone(), value);
    }
    applied
}
