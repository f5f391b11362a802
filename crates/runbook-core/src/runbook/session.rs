//! The explicit run session and its durable form.
//!
//! `RunSession` is the in-memory state of one run, threaded through every
//! engine call. `to_state` flattens it into a `SessionState` where every tree
//! position is a stable id; `restore` reloads each referenced runbook and
//! resolves those ids again, rejecting anything that no longer fits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use runbook_types::runbook::Step;
use runbook_types::scenario::{RecordedExchange, RecordedInput};
use runbook_types::session::{
    InputKind, OutcomeRecord, RunMode, RunStatus, SESSION_FORMAT_VERSION, SerializedFrame,
    SerializedLevel, SerializedNode, SerializedPending, SessionState, StepRecord,
};
use serde_json::Value;
use uuid::Uuid;

use super::compiled::CompiledRunbook;
use super::context::RunContext;
use super::continuation::{Continuation, ContinuationError, PendingNode};
use super::definition::RunbookError;
use super::invoke::{InvokeFrame, InvokeStack, Level};
use super::loader::RunbookLoader;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors building, persisting, or resuming a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("step '{step_id}' not found in {workflow}")]
    UnresolvedStep { workflow: String, step_id: String },

    #[error("iterate block '{block}' not found in {workflow}")]
    UnresolvedBlock { workflow: String, block: String },

    #[error("invalid watchpoint for block '{block}': {reason}")]
    InvalidWatchpoint { block: String, reason: String },

    #[error("step '{incoming}' cannot await input while '{existing}' is pending")]
    PendingConflict { existing: String, incoming: String },

    #[error("unsupported session format version {0}")]
    UnsupportedVersion(u32),

    #[error("failed to load runbook: {0}")]
    Load(#[from] RunbookError),

    #[error(transparent)]
    Continuation(#[from] ContinuationError),
}

// ---------------------------------------------------------------------------
// PendingInput
// ---------------------------------------------------------------------------

/// The single step waiting on the operator.
#[derive(Debug, Clone)]
pub struct PendingInput {
    pub step: Arc<Step>,
    pub depth: u32,
    pub awaiting: Vec<InputKind>,
    pub evidence: BTreeMap<String, Value>,
    pub choice: Option<String>,
}

impl PendingInput {
    pub fn new(step: Arc<Step>, depth: u32, awaiting: Vec<InputKind>) -> Self {
        Self {
            step,
            depth,
            awaiting,
            evidence: BTreeMap::new(),
            choice: None,
        }
    }

    pub fn awaits(&self, kind: InputKind) -> bool {
        self.awaiting.contains(&kind)
    }

    pub fn fulfil(&mut self, kind: InputKind) {
        self.awaiting.retain(|k| *k != kind);
    }
}

// ---------------------------------------------------------------------------
// RunSession
// ---------------------------------------------------------------------------

/// In-memory state of one run.
#[derive(Debug, Clone)]
pub struct RunSession {
    pub run_id: Uuid,
    pub root_workflow: PathBuf,
    pub workflow_digest: Option<String>,
    pub mode: RunMode,
    pub status: RunStatus,
    pub initial_variables: BTreeMap<String, Value>,
    /// The level currently executing.
    pub level: Level,
    pub stack: InvokeStack,
    pub pending: Option<PendingInput>,
    pub history: Vec<StepRecord>,
    pub exchanges: Vec<RecordedExchange>,
    pub inputs: Vec<RecordedInput>,
    pub outcome: Option<OutcomeRecord>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSession {
    /// Start a fresh session on `root`. The root level shares the run id.
    pub fn new(
        root: Arc<CompiledRunbook>,
        variables: BTreeMap<String, Value>,
        mode: RunMode,
    ) -> Result<Self, ContinuationError> {
        let root_workflow = root.path().to_path_buf();
        let workflow_digest = root.digest().map(str::to_string);
        let level = Level::start(root, variables.clone())?;
        let now = Utc::now();
        Ok(Self {
            run_id: level.run_id,
            root_workflow,
            workflow_digest,
            mode,
            status: RunStatus::Running,
            initial_variables: variables,
            level,
            stack: InvokeStack::default(),
            pending: None,
            history: Vec::new(),
            exchanges: Vec::new(),
            inputs: Vec::new(),
            outcome: None,
            failure: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Occupy the pending slot. Fails if another step already holds it.
    pub fn set_pending(&mut self, pending: PendingInput) -> Result<(), SessionError> {
        if let Some(existing) = &self.pending {
            return Err(SessionError::PendingConflict {
                existing: existing.step.id.clone(),
                incoming: pending.step.id.clone(),
            });
        }
        self.pending = Some(pending);
        Ok(())
    }

    /// Invoke nesting depth of the active level.
    pub fn invoke_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // -- Persistence ---------------------------------------------------------

    /// Flatten into the durable record.
    pub fn to_state(&self) -> SessionState {
        SessionState {
            format_version: SESSION_FORMAT_VERSION,
            run_id: self.run_id,
            workflow: self.root_workflow.clone(),
            workflow_digest: self.workflow_digest.clone(),
            mode: self.mode.clone(),
            status: self.status,
            initial_variables: self.initial_variables.clone(),
            active: serialize_level(&self.level),
            stack: self
                .stack
                .iter()
                .map(|frame| SerializedFrame {
                    parent: serialize_level(&frame.parent),
                    invoking_step: frame.invoking_step.id.clone(),
                    depth: frame.depth,
                    stop_if: frame.stop_if.clone(),
                    outputs: frame.outputs.clone(),
                })
                .collect(),
            pending: self.pending.as_ref().map(|p| SerializedPending {
                step_id: p.step.id.clone(),
                depth: p.depth,
                awaiting: p.awaiting.clone(),
                evidence: p.evidence.clone(),
                choice: p.choice.clone(),
            }),
            history: self.history.clone(),
            exchanges: self.exchanges.clone(),
            inputs: self.inputs.clone(),
            outcome: self.outcome.clone(),
            failure: self.failure.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Rebuild a session, reloading every runbook it references.
    pub fn restore(state: SessionState, loader: &dyn RunbookLoader) -> Result<Self, SessionError> {
        if state.format_version > SESSION_FORMAT_VERSION {
            return Err(SessionError::UnsupportedVersion(state.format_version));
        }

        let root = loader.load(&state.workflow)?;
        if let (Some(saved), Some(current)) = (state.workflow_digest.as_deref(), root.digest()) {
            if saved != current {
                tracing::warn!(
                    run_id = %state.run_id,
                    workflow = %state.workflow.display(),
                    "runbook changed since the run started"
                );
            }
        }

        let level = restore_level(&state.active, loader)?;
        let mut frames = Vec::with_capacity(state.stack.len());
        for frame in &state.stack {
            let parent = restore_level(&frame.parent, loader)?;
            let invoking_step = resolve_step(&parent.runbook, &frame.invoking_step)?;
            frames.push(InvokeFrame {
                parent,
                invoking_step,
                depth: frame.depth,
                stop_if: frame.stop_if.clone(),
                outputs: frame.outputs.clone(),
            });
        }

        let pending = match &state.pending {
            Some(p) => Some(PendingInput {
                step: resolve_step(&level.runbook, &p.step_id)?,
                depth: p.depth,
                awaiting: p.awaiting.clone(),
                evidence: p.evidence.clone(),
                choice: p.choice.clone(),
            }),
            None => None,
        };

        tracing::debug!(
            run_id = %state.run_id,
            depth = frames.len(),
            queued = level.queue.len(),
            "session restored"
        );

        Ok(Self {
            run_id: state.run_id,
            root_workflow: state.workflow,
            workflow_digest: state.workflow_digest,
            mode: state.mode,
            status: state.status,
            initial_variables: state.initial_variables,
            level,
            stack: frames.into_iter().collect(),
            pending,
            history: state.history,
            exchanges: state.exchanges,
            inputs: state.inputs,
            outcome: state.outcome,
            failure: state.failure,
            created_at: state.created_at,
            updated_at: state.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Node serialization
// ---------------------------------------------------------------------------

/// Durable form of one continuation unit.
pub fn serialize_node(node: &PendingNode) -> SerializedNode {
    match node {
        PendingNode::Step { step, depth } => SerializedNode::Step {
            step_id: step.id.clone(),
            depth: *depth,
        },
        PendingNode::Iterate { key, depth, .. } => SerializedNode::Iterate {
            block: key.clone(),
            depth: *depth,
        },
        PendingNode::Converge {
            key,
            depth,
            pass,
            max,
            ..
        } => SerializedNode::Converge {
            block: key.clone(),
            depth: *depth,
            pass: *pass,
            max: *max,
        },
        PendingNode::List {
            key,
            depth,
            items,
            index,
            variable,
            ..
        } => SerializedNode::List {
            block: key.clone(),
            depth: *depth,
            items: items.clone(),
            index: *index,
            variable: variable.clone(),
        },
    }
}

/// Resolve a durable unit against `runbook`, checking watchpoint counters.
pub fn resolve_node(
    runbook: &CompiledRunbook,
    node: &SerializedNode,
) -> Result<PendingNode, SessionError> {
    match node {
        SerializedNode::Step { step_id, depth } => Ok(PendingNode::Step {
            step: resolve_step(runbook, step_id)?,
            depth: *depth,
        }),
        SerializedNode::Iterate { block, depth } => Ok(PendingNode::Iterate {
            block: resolve_block(runbook, block)?,
            key: block.clone(),
            depth: *depth,
        }),
        SerializedNode::Converge {
            block: key,
            depth,
            pass,
            max,
        } => {
            let block = resolve_block(runbook, key)?;
            if block.is_list() {
                return Err(invalid(key, "convergence watchpoint on a list block"));
            }
            if *max == 0 || pass >= max {
                return Err(invalid(key, format!("pass {pass} out of range for max {max}")));
            }
            Ok(PendingNode::Converge {
                block,
                key: key.clone(),
                depth: *depth,
                pass: *pass,
                max: *max,
            })
        }
        SerializedNode::List {
            block: key,
            depth,
            items,
            index,
            variable,
        } => {
            let block = resolve_block(runbook, key)?;
            if !block.is_list() {
                return Err(invalid(key, "list watchpoint on a convergence block"));
            }
            if *index >= items.len() {
                return Err(invalid(
                    key,
                    format!("index {index} out of range for {} items", items.len()),
                ));
            }
            Ok(PendingNode::List {
                block,
                key: key.clone(),
                depth: *depth,
                items: items.clone(),
                index: *index,
                variable: variable.clone(),
            })
        }
    }
}

fn invalid(block: &str, reason: impl Into<String>) -> SessionError {
    SessionError::InvalidWatchpoint {
        block: block.to_string(),
        reason: reason.into(),
    }
}

fn resolve_step(runbook: &CompiledRunbook, id: &str) -> Result<Arc<Step>, SessionError> {
    runbook
        .step(id)
        .cloned()
        .ok_or_else(|| SessionError::UnresolvedStep {
            workflow: runbook.path().display().to_string(),
            step_id: id.to_string(),
        })
}

fn resolve_block(
    runbook: &CompiledRunbook,
    key: &str,
) -> Result<Arc<runbook_types::runbook::IterateBlock>, SessionError> {
    runbook
        .block(key)
        .cloned()
        .ok_or_else(|| SessionError::UnresolvedBlock {
            workflow: runbook.path().display().to_string(),
            block: key.to_string(),
        })
}

fn serialize_level(level: &Level) -> SerializedLevel {
    SerializedLevel {
        workflow: level.runbook.path().to_path_buf(),
        run_id: level.run_id,
        variables: level.context.variables.clone(),
        captures: level.context.captures.clone(),
        queue: level.queue.iter().map(serialize_node).collect(),
        step_counter: level.step_counter,
        child_runs: level.child_runs.clone(),
    }
}

fn restore_level(
    level: &SerializedLevel,
    loader: &dyn RunbookLoader,
) -> Result<Level, SessionError> {
    let runbook = loader.load(Path::new(&level.workflow))?;
    let units = level
        .queue
        .iter()
        .map(|node| resolve_node(&runbook, node))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Level {
        runbook,
        run_id: level.run_id,
        context: RunContext {
            variables: level.variables.clone(),
            captures: level.captures.clone(),
        },
        queue: Continuation::from_units(units),
        step_counter: level.step_counter,
        child_runs: level.child_runs.clone(),
    })
}
