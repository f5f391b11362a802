//! Operator input collection.
//!
//! An `EvidenceCollector` asks a human for whatever a pending step needs.
//! The engine itself never prompts; interactive front ends turn a
//! `PendingPrompt` into an `OperatorInput` with `collect_input` and submit
//! the parts through the regular requests.

use std::collections::BTreeMap;

use runbook_types::runbook::{ApprovalSpec, ChoiceSpec, EvidenceKind, EvidenceSpec};
use runbook_types::session::InputKind;
use serde_json::{Value, json};

use super::engine::{APPROVED_KEY, OutcomeOption, PendingPrompt};
use super::routing::OutcomeSelector;

/// Errors while prompting the operator.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("input cancelled by operator")]
    Cancelled,

    #[error("prompt failed: {0}")]
    Prompt(String),
}

/// Asks the operator for step input.
pub trait EvidenceCollector {
    fn prompt_text(&self, spec: &EvidenceSpec) -> Result<String, CollectError>;

    /// Returns the checked items.
    fn prompt_checklist(
        &self,
        spec: &EvidenceSpec,
        items: &[String],
    ) -> Result<Vec<String>, CollectError>;

    /// Returns a path or reference to the attached artifact.
    fn prompt_attachment(&self, spec: &EvidenceSpec) -> Result<String, CollectError>;

    fn prompt_approval(&self, spec: &ApprovalSpec) -> Result<bool, CollectError>;

    fn prompt_choice(&self, spec: &ChoiceSpec) -> Result<String, CollectError>;

    /// Returns the index of the picked outcome.
    fn prompt_outcome(&self, options: &[OutcomeOption]) -> Result<usize, CollectError>;

    /// Confirm a step without inputs was done.
    fn acknowledge(&self, prompt: &PendingPrompt) -> Result<(), CollectError>;
}

/// Everything gathered for one pending step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorInput {
    /// Evidence, approval, or acknowledgment to submit.
    pub evidence: Option<BTreeMap<String, Value>>,
    /// Choice variable and value.
    pub choice: Option<(String, String)>,
    pub outcome: Option<OutcomeSelector>,
}

/// Collect the evidence values a prompt asks for.
pub fn collect_evidence(
    collector: &dyn EvidenceCollector,
    specs: &[EvidenceSpec],
    received: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, CollectError> {
    let mut evidence = BTreeMap::new();
    for spec in specs {
        if received.contains_key(&spec.name) {
            continue;
        }
        let value = match &spec.kind {
            EvidenceKind::Text => json!(collector.prompt_text(spec)?),
            EvidenceKind::Checklist { items } => json!(collector.prompt_checklist(spec, items)?),
            EvidenceKind::Attachment => json!(collector.prompt_attachment(spec)?),
        };
        evidence.insert(spec.name.clone(), value);
    }
    Ok(evidence)
}

/// Prompt for every input `prompt` is still waiting on.
pub fn collect_input(
    collector: &dyn EvidenceCollector,
    prompt: &PendingPrompt,
) -> Result<OperatorInput, CollectError> {
    let mut input = OperatorInput::default();
    let mut evidence = BTreeMap::new();
    let mut submits_evidence = false;

    for kind in &prompt.awaiting {
        match kind {
            InputKind::Evidence => {
                evidence.extend(collect_evidence(collector, &prompt.evidence, &prompt.received)?);
                submits_evidence = true;
            }
            InputKind::Approval => {
                if let Some(spec) = &prompt.approval {
                    let approved = collector.prompt_approval(spec)?;
                    evidence.insert(APPROVED_KEY.to_string(), json!(approved));
                    submits_evidence = true;
                }
            }
            InputKind::Choice => {
                if let Some(spec) = &prompt.choice {
                    let value = collector.prompt_choice(spec)?;
                    input.choice = Some((spec.variable.clone(), value));
                }
            }
            InputKind::Acknowledge => {
                collector.acknowledge(prompt)?;
                submits_evidence = true;
            }
            InputKind::Outcome => {
                let index = collector.prompt_outcome(&prompt.outcomes)?;
                input.outcome = Some(OutcomeSelector::Index(index));
            }
        }
    }

    if submits_evidence {
        input.evidence = Some(evidence);
    }
    Ok(input)
}
