//! Outcome and branch evaluation.
//!
//! After a step completes, outcomes are checked in declaration order and the
//! first satisfied one ends the level. When none fires, branches are checked
//! in order and the first match is spliced into the continuation. This
//! module also classifies manual steps: which inputs they wait for, and
//! which ones only route and can run inline.

use runbook_types::runbook::{Branch, Outcome, Step, StepKind};
use runbook_types::session::InputKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::expression::{ConditionEvaluator, ExpressionError};

/// Result of routing after a step.
#[derive(Debug, PartialEq)]
pub enum RouteDecision<'a> {
    Outcome(&'a Outcome),
    Branch(&'a Branch),
    Continue,
}

/// Check outcomes, then branches.
pub fn route<'a>(
    step: &'a Step,
    evaluator: &dyn ConditionEvaluator,
    env: &Value,
) -> Result<RouteDecision<'a>, ExpressionError> {
    if let Some(outcome) = first_outcome(step, evaluator, env)? {
        return Ok(RouteDecision::Outcome(outcome));
    }
    for branch in &step.branches {
        if evaluator.evaluate_bool(&branch.when, env)? {
            return Ok(RouteDecision::Branch(branch));
        }
    }
    Ok(RouteDecision::Continue)
}

/// First outcome whose `when` holds; an outcome without `when` always holds.
pub fn first_outcome<'a>(
    step: &'a Step,
    evaluator: &dyn ConditionEvaluator,
    env: &Value,
) -> Result<Option<&'a Outcome>, ExpressionError> {
    for outcome in &step.outcomes {
        let fires = match &outcome.when {
            Some(when) => evaluator.evaluate_bool(when, env)?,
            None => true,
        };
        if fires {
            return Ok(Some(outcome));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Outcome selection
// ---------------------------------------------------------------------------

/// Operator pick among a step's outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutcomeSelector {
    Index(usize),
    State(String),
}

impl OutcomeSelector {
    /// Numbers select by zero-based index, anything else by state name.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<usize>() {
            Ok(index) => OutcomeSelector::Index(index),
            Err(_) => OutcomeSelector::State(raw.trim().to_string()),
        }
    }

    pub fn select<'a>(&self, step: &'a Step) -> Option<&'a Outcome> {
        match self {
            OutcomeSelector::Index(index) => step.outcomes.get(*index),
            OutcomeSelector::State(state) => step.outcomes.iter().find(|o| &o.state == state),
        }
    }
}

// ---------------------------------------------------------------------------
// Manual step classification
// ---------------------------------------------------------------------------

/// Inputs a manual step waits for before it can complete.
///
/// Returns an empty list for steps that only route and run inline.
pub fn required_inputs(step: &Step) -> Vec<InputKind> {
    if !matches!(step.kind, StepKind::Manual) {
        return Vec::new();
    }

    let mut inputs = Vec::new();
    if !step.evidence.is_empty() {
        inputs.push(InputKind::Evidence);
    }
    if step.approval.is_some() {
        inputs.push(InputKind::Approval);
    }
    if step.choice.is_some() {
        inputs.push(InputKind::Choice);
    }
    if !inputs.is_empty() {
        return inputs;
    }

    if step.outcomes.is_empty() && step.branches.is_empty() {
        return vec![InputKind::Acknowledge];
    }
    if is_routing_step(step) {
        return Vec::new();
    }
    vec![InputKind::Outcome]
}

/// A manual step with no outcomes beyond a single unconditional one, or
/// only branches, and no required input.
pub fn is_routing_step(step: &Step) -> bool {
    if !matches!(step.kind, StepKind::Manual)
        || !step.evidence.is_empty()
        || step.approval.is_some()
        || step.choice.is_some()
    {
        return false;
    }
    match step.outcomes.as_slice() {
        [] => !step.branches.is_empty(),
        [only] => only.when.is_none(),
        _ => false,
    }
}
