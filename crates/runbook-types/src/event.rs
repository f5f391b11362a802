//! Run notifications.
//!
//! `RunEvent` is broadcast on the event bus as the engine walks a runbook.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::InputKind;

/// Events emitted while a run advances.
///
/// `run_id` is always the root run; `level_run_id` identifies the invoked
/// child level a step belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StepStarted {
        run_id: Uuid,
        level_run_id: Uuid,
        step_id: String,
        title: String,
        depth: u32,
    },

    StepCompleted {
        run_id: Uuid,
        level_run_id: Uuid,
        step_id: String,
    },

    StepFailed {
        run_id: Uuid,
        level_run_id: Uuid,
        step_id: String,
        error: String,
    },

    StepSkipped {
        run_id: Uuid,
        level_run_id: Uuid,
        step_id: String,
        reason: String,
    },

    /// A branch was spliced in after a step.
    BranchSelected {
        run_id: Uuid,
        step_id: String,
        label: Option<String>,
    },

    OutcomeReached {
        run_id: Uuid,
        level_run_id: Uuid,
        state: String,
        recommendation: String,
    },

    InvokeStarted {
        run_id: Uuid,
        child_run_id: Uuid,
        workflow: String,
        depth: u32,
    },

    InvokeCompleted {
        run_id: Uuid,
        child_run_id: Uuid,
        state: String,
    },

    /// An iterate block expanded. `total` is the item count in list mode.
    IterationStarted {
        run_id: Uuid,
        block: String,
        total: Option<usize>,
    },

    IterationPass {
        run_id: Uuid,
        block: String,
        iteration: u32,
    },

    IterationConverged {
        run_id: Uuid,
        block: String,
        passes: u32,
    },

    IterationFailed {
        run_id: Uuid,
        block: String,
        passes: u32,
    },

    InputRequired {
        run_id: Uuid,
        step_id: String,
        awaiting: Vec<InputKind>,
    },

    RunCompleted { run_id: Uuid },

    RunFailed { run_id: Uuid, error: String },
}

impl RunEvent {
    /// Short name of the event variant.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::StepStarted { .. } => "step_started",
            RunEvent::StepCompleted { .. } => "step_completed",
            RunEvent::StepFailed { .. } => "step_failed",
            RunEvent::StepSkipped { .. } => "step_skipped",
            RunEvent::BranchSelected { .. } => "branch_selected",
            RunEvent::OutcomeReached { .. } => "outcome_reached",
            RunEvent::InvokeStarted { .. } => "invoke_started",
            RunEvent::InvokeCompleted { .. } => "invoke_completed",
            RunEvent::IterationStarted { .. } => "iteration_started",
            RunEvent::IterationPass { .. } => "iteration_pass",
            RunEvent::IterationConverged { .. } => "iteration_converged",
            RunEvent::IterationFailed { .. } => "iteration_failed",
            RunEvent::InputRequired { .. } => "input_required",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunFailed { .. } => "run_failed",
        }
    }
}
