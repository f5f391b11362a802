//! Runbook domain types.
//!
//! A runbook is a tree: an ordered list of nodes, each either a step leaf or
//! an `iterate:` block holding nested nodes. Steps may carry branches (nested
//! nodes spliced in after the step completes) and outcomes (terminal states
//! that end the run at the current level). These types are the parsed,
//! immutable form of a runbook YAML file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Runbook Definition
// ---------------------------------------------------------------------------

/// A parsed runbook file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunbookDefinition {
    /// Human-readable runbook name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Declared variables with their default values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    /// Aliases for invoked runbooks (alias -> path relative to this file).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub imports: BTreeMap<String, String>,
    /// Top-level nodes, executed in order.
    pub steps: Vec<TreeNode>,
}

fn default_version() -> String {
    "1".to_string()
}

/// One node of the runbook tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TreeNode {
    /// An `iterate:` block.
    Iterate(IterateNode),
    /// A step leaf.
    Step(Step),
}

impl TreeNode {
    /// Stable key of this node: the step id, or the iterate block key.
    pub fn key(&self) -> Option<String> {
        match self {
            TreeNode::Step(step) => Some(step.id.clone()),
            TreeNode::Iterate(node) => node.iterate.key(),
        }
    }
}

/// Wrapper giving iterate blocks their `iterate:` YAML key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterateNode {
    pub iterate: IterateBlock,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Stable id, unique within its runbook.
    pub id: String,
    /// What the step does.
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Operator-facing instructions (may contain `{{ }}` templates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Capture map: variable name -> source (`stdout`, `json:path`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capture: BTreeMap<String, String>,
    /// Evidence the operator must supply before the step completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<ChoiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
    /// Condition that must hold for the step to run; otherwise it is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precondition: Option<String>,
    /// Terminal outcomes, checked in declaration order after the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<Outcome>,
    /// Conditional branches, checked in order when no outcome fires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Per-step timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    /// Title for display, falling back to the id.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

/// The kind of step, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Performed by the operator.
    Manual,
    /// Shell command run by the step executor.
    Command { command: String },
    /// Named tool action run by the step executor.
    Tool {
        tool: String,
        #[serde(default)]
        args: Value,
    },
    /// Nested execution of another runbook.
    Invoke(InvokeSpec),
    /// Cancellable delay.
    Wait { seconds: u64 },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Manual => "manual",
            StepKind::Command { .. } => "command",
            StepKind::Tool { .. } => "tool",
            StepKind::Invoke(_) => "invoke",
            StepKind::Wait { .. } => "wait",
        }
    }
}

/// Invoke step configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvokeSpec {
    /// Import alias or path relative to the invoking runbook.
    pub workflow: String,
    /// Child variables seeded from templates rendered in the caller.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input: BTreeMap<String, String>,
    /// Parent capture name -> child capture/variable name (or `outcome`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,
}

/// Halts the parent when the child ends in one of the listed states.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gate {
    #[serde(default)]
    pub stop_if: Vec<String>,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the run (or the invoking step of a parent).
    #[default]
    Halt,
    /// Record the step as skipped and move on.
    Skip,
    /// Record the failure and keep routing as if it completed.
    Continue,
}

// ---------------------------------------------------------------------------
// Operator input specs
// ---------------------------------------------------------------------------

/// A piece of evidence requested from the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceSpec {
    pub name: String,
    #[serde(default)]
    pub kind: EvidenceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Shape of an evidence value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceKind {
    #[default]
    Text,
    Checklist { items: Vec<String> },
    Attachment,
}

/// An explicit choice stored into a variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChoiceSpec {
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Allowed values; empty means free-form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Operator approval gate on a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalSpec {
    pub prompt: String,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// A terminal state reached when `when` holds (or unconditionally).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    pub state: String,
    /// Recommendation template rendered when the outcome fires.
    #[serde(default)]
    pub recommendation: String,
    /// Runbook to chain to after this outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Nested nodes spliced in after the owning step when `when` holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub when: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub steps: Vec<TreeNode>,
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// A repeated group of nodes.
///
/// Convergence mode sets `until` (and optionally `max`); list mode sets
/// `over`, an expression rendered to a JSON array or a delimited string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterateBlock {
    /// Explicit stable key. Derived from the first child when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<String>,
    /// Loop variable for list mode.
    #[serde(rename = "as", default = "default_loop_variable")]
    pub variable: String,
    /// Item separator for list mode; commas and newlines when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    pub steps: Vec<TreeNode>,
}

fn default_loop_variable() -> String {
    "item".to_string()
}

impl IterateBlock {
    /// Stable key: the explicit id, else `iterate:` plus the first child's key.
    pub fn key(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(id.clone());
        }
        self.steps
            .first()
            .and_then(TreeNode::key)
            .map(|child| format!("iterate:{child}"))
    }

    /// Whether this block iterates over a list.
    pub fn is_list(&self) -> bool {
        self.over.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
name: disk-pressure
description: Triage a full disk
variables:
  threshold: "90"
imports:
  cleanup: ./cleanup.yaml
steps:
  - id: check-usage
    type: command
    command: df -h /
    capture:
      usage: stdout
    outcomes:
      - when: "usage == 'ok'"
        state: healthy
        recommendation: Nothing to do
    branches:
      - when: "usage != 'ok'"
        label: investigate
        steps:
          - id: confirm
            type: manual
            title: Confirm with owner
  - iterate:
      max: 3
      until: "done == 'yes'"
      steps:
        - id: retry
          type: tool
          tool: echo
          args:
            message: hi
  - iterate:
      over: "{{ hosts }}"
      as: host
      steps:
        - id: ping
          type: command
          command: ping {{ host }}
  - id: run-cleanup
    type: invoke
    workflow: cleanup
    input:
      target: "{{ usage }}"
    outputs:
      freed: bytes
    gate:
      stop_if: [escalate]
    on_failure: skip
"#;

    fn sample() -> RunbookDefinition {
        serde_yaml_ng::from_str(SAMPLE_YAML).unwrap()
    }

    #[test]
    fn test_parse_full_runbook() {
        let def = sample();
        assert_eq!(def.name, "disk-pressure");
        assert_eq!(def.version, "1");
        assert_eq!(def.imports["cleanup"], "./cleanup.yaml");
        assert_eq!(def.steps.len(), 4);
    }

    #[test]
    fn test_step_kinds_parse() {
        let def = sample();
        let TreeNode::Step(first) = &def.steps[0] else {
            panic!("expected step");
        };
        assert_eq!(
            first.kind,
            StepKind::Command {
                command: "df -h /".to_string()
            }
        );
        assert_eq!(first.capture["usage"], "stdout");
        assert_eq!(first.outcomes[0].state, "healthy");
        assert_eq!(first.branches[0].label.as_deref(), Some("investigate"));
        assert_eq!(first.on_failure, FailurePolicy::Halt);

        let TreeNode::Step(invoke) = &def.steps[3] else {
            panic!("expected step");
        };
        let StepKind::Invoke(spec) = &invoke.kind else {
            panic!("expected invoke");
        };
        assert_eq!(spec.workflow, "cleanup");
        assert_eq!(spec.outputs["freed"], "bytes");
        assert_eq!(spec.gate.as_ref().unwrap().stop_if, vec!["escalate"]);
        assert_eq!(invoke.on_failure, FailurePolicy::Skip);
    }

    #[test]
    fn test_iterate_blocks_parse() {
        let def = sample();
        let TreeNode::Iterate(converge) = &def.steps[1] else {
            panic!("expected iterate");
        };
        assert_eq!(converge.iterate.max, Some(3));
        assert!(!converge.iterate.is_list());
        assert_eq!(converge.iterate.variable, "item");

        let TreeNode::Iterate(list) = &def.steps[2] else {
            panic!("expected iterate");
        };
        assert!(list.iterate.is_list());
        assert_eq!(list.iterate.variable, "host");
    }

    #[test]
    fn test_block_key_derived_from_first_child() {
        let def = sample();
        assert_eq!(def.steps[1].key().as_deref(), Some("iterate:retry"));
        assert_eq!(def.steps[2].key().as_deref(), Some("iterate:ping"));
    }

    #[test]
    fn test_block_key_explicit_id_wins() {
        let yaml = r#"
iterate:
  id: sweep
  over: "a,b"
  steps:
    - id: inner
      type: manual
"#;
        let node: TreeNode = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(node.key().as_deref(), Some("sweep"));
    }

    #[test]
    fn test_block_key_recurses_through_nested_blocks() {
        let yaml = r#"
iterate:
  until: "true"
  steps:
    - iterate:
        over: "x"
        steps:
          - id: deepest
            type: manual
"#;
        let node: TreeNode = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(node.key().as_deref(), Some("iterate:iterate:deepest"));
    }

    #[test]
    fn test_empty_block_has_no_key() {
        let block = IterateBlock {
            id: None,
            max: None,
            until: Some("true".to_string()),
            over: None,
            variable: "item".to_string(),
            separator: None,
            steps: vec![],
        };
        assert!(block.key().is_none());
    }

    #[test]
    fn test_evidence_defaults() {
        let yaml = r#"
id: collect
type: manual
evidence:
  - name: screenshot
    kind:
      type: attachment
  - name: notes
    required: false
"#;
        let step: Step = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.evidence[0].kind, EvidenceKind::Attachment);
        assert!(step.evidence[0].required);
        assert_eq!(step.evidence[1].kind, EvidenceKind::Text);
        assert!(!step.evidence[1].required);
    }

    #[test]
    fn test_display_title_falls_back_to_id() {
        let step: Step = serde_yaml_ng::from_str("id: ack\ntype: manual\n").unwrap();
        assert_eq!(step.display_title(), "ack");
        assert_eq!(step.kind.as_str(), "manual");
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let def = sample();
        let json = serde_json::to_string(&def).unwrap();
        let parsed: RunbookDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_failure_policy_serde() {
        let json = serde_json::to_string(&FailurePolicy::Continue).unwrap();
        assert_eq!(json, "\"continue\"");
    }
}
