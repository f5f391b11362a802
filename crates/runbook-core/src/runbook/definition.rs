//! Runbook definition parsing and validation.
//!
//! Converts YAML files into `RunbookDefinition` and validates the structural
//! constraints the engine relies on: unique step ids and iterate block keys
//! across the whole tree, well-formed iterate blocks, and resolvable invoke
//! references.

use std::collections::HashSet;
use std::path::Path;

use runbook_types::runbook::{IterateBlock, RunbookDefinition, Step, StepKind, TreeNode};
use thiserror::Error;

use super::capture::CaptureSource;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a runbook.
#[derive(Debug, Error)]
pub enum RunbookError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Runbook file does not exist.
    #[error("runbook not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `RunbookDefinition`.
pub fn parse_runbook_yaml(yaml: &str) -> Result<RunbookDefinition, RunbookError> {
    let def = deserialize_runbook_yaml(yaml)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Deserialize YAML without structural validation. `CompiledRunbook::compile`
/// validates on its own.
pub fn deserialize_runbook_yaml(yaml: &str) -> Result<RunbookDefinition, RunbookError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| RunbookError::ParseError(e.to_string()))
}

/// Serialize a `RunbookDefinition` to YAML.
pub fn serialize_runbook_yaml(def: &RunbookDefinition) -> Result<String, RunbookError> {
    serde_yaml_ng::to_string(def).map_err(|e| RunbookError::ParseError(e.to_string()))
}

/// Read the raw source of a runbook file.
pub fn read_runbook_source(path: &Path) -> Result<String, RunbookError> {
    match std::fs::read_to_string(path) {
        Ok(source) => Ok(source),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RunbookError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `RunbookDefinition`.
///
/// Checks:
/// - Name is non-empty and at least one node exists
/// - Step ids and iterate block keys are non-empty and unique across the tree
/// - Iterate blocks are non-empty and set exactly one of `until` / `over`
/// - Branches hold at least one node; outcomes name a state
/// - Invoke references name an import alias or a YAML path
pub fn validate_definition(def: &RunbookDefinition) -> Result<(), RunbookError> {
    if def.name.trim().is_empty() {
        return Err(RunbookError::ValidationError(
            "runbook name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(RunbookError::ValidationError(
            "runbook must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    validate_nodes(def, &def.steps, &mut seen)
}

fn validate_nodes(
    def: &RunbookDefinition,
    nodes: &[TreeNode],
    seen: &mut HashSet<String>,
) -> Result<(), RunbookError> {
    for node in nodes {
        match node {
            TreeNode::Step(step) => validate_step(def, step, seen)?,
            TreeNode::Iterate(node) => validate_block(def, &node.iterate, seen)?,
        }
    }
    Ok(())
}

fn validate_step(
    def: &RunbookDefinition,
    step: &Step,
    seen: &mut HashSet<String>,
) -> Result<(), RunbookError> {
    if step.id.trim().is_empty() {
        return Err(RunbookError::ValidationError(
            "step id must not be empty".to_string(),
        ));
    }
    if !seen.insert(step.id.clone()) {
        return Err(RunbookError::ValidationError(format!(
            "duplicate step ID: '{}'",
            step.id
        )));
    }

    match &step.kind {
        StepKind::Command { command } if command.trim().is_empty() => {
            return Err(RunbookError::ValidationError(format!(
                "command step '{}' has an empty command",
                step.id
            )));
        }
        StepKind::Tool { tool, .. } if tool.trim().is_empty() => {
            return Err(RunbookError::ValidationError(format!(
                "tool step '{}' names no tool",
                step.id
            )));
        }
        StepKind::Invoke(spec) => {
            let reference = spec.workflow.as_str();
            let is_path = reference.ends_with(".yaml")
                || reference.ends_with(".yml")
                || reference.contains('/');
            if !def.imports.contains_key(reference) && !is_path {
                return Err(RunbookError::ValidationError(format!(
                    "invoke step '{}' references unknown import '{}'",
                    step.id, reference
                )));
            }
        }
        _ => {}
    }

    for (name, source) in &step.capture {
        if CaptureSource::parse(source).is_none() {
            return Err(RunbookError::ValidationError(format!(
                "step '{}' captures '{}' from unknown source '{}'",
                step.id, name, source
            )));
        }
    }

    let mut evidence_names = HashSet::new();
    for evidence in &step.evidence {
        if !evidence_names.insert(evidence.name.as_str()) {
            return Err(RunbookError::ValidationError(format!(
                "step '{}' declares evidence '{}' twice",
                step.id, evidence.name
            )));
        }
    }

    for outcome in &step.outcomes {
        if outcome.state.trim().is_empty() {
            return Err(RunbookError::ValidationError(format!(
                "step '{}' has an outcome without a state",
                step.id
            )));
        }
    }

    for branch in &step.branches {
        if branch.steps.is_empty() {
            return Err(RunbookError::ValidationError(format!(
                "branch '{}' of step '{}' has no steps",
                branch.label.as_deref().unwrap_or(&branch.when),
                step.id
            )));
        }
        validate_nodes(def, &branch.steps, seen)?;
    }

    Ok(())
}

fn validate_block(
    def: &RunbookDefinition,
    block: &IterateBlock,
    seen: &mut HashSet<String>,
) -> Result<(), RunbookError> {
    let Some(key) = block.key() else {
        return Err(RunbookError::ValidationError(
            "iterate block must contain at least one step".to_string(),
        ));
    };
    if block.steps.is_empty() {
        return Err(RunbookError::ValidationError(format!(
            "iterate block '{key}' must contain at least one step"
        )));
    }
    if !seen.insert(key.clone()) {
        return Err(RunbookError::ValidationError(format!(
            "duplicate iterate block key: '{key}'"
        )));
    }

    match (&block.until, &block.over) {
        (Some(_), Some(_)) => {
            return Err(RunbookError::ValidationError(format!(
                "iterate block '{key}' sets both `until` and `over`"
            )));
        }
        (None, None) => {
            return Err(RunbookError::ValidationError(format!(
                "iterate block '{key}' must set `until` or `over`"
            )));
        }
        (None, Some(_)) if block.max.is_some() => {
            return Err(RunbookError::ValidationError(format!(
                "iterate block '{key}' sets `max` on a list iteration"
            )));
        }
        _ => {}
    }

    if block.max == Some(0) {
        return Err(RunbookError::ValidationError(format!(
            "iterate block '{key}' must allow at least one pass"
        )));
    }
    if block.variable.trim().is_empty() {
        return Err(RunbookError::ValidationError(format!(
            "iterate block '{key}' has an empty loop variable"
        )));
    }

    validate_nodes(def, &block.steps, seen)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name: restart-service
steps:
  - id: check
    type: command
    command: systemctl is-active app
    capture:
      state: stdout
    branches:
      - when: "state != 'active'"
        steps:
          - id: restart
            type: command
            command: systemctl restart app
  - iterate:
      until: "healthy == 'yes'"
      max: 3
      steps:
        - id: health
          type: command
          command: curl -fsS localhost/health
"#;

    #[test]
    fn test_parse_valid_runbook() {
        let def = parse_runbook_yaml(VALID).unwrap();
        assert_eq!(def.name, "restart-service");
        assert_eq!(def.steps.len(), 2);
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = parse_runbook_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, RunbookError::ParseError(_)));
    }

    #[test]
    fn test_empty_steps_rejected() {
        let err = parse_runbook_yaml("name: empty\nsteps: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_duplicate_id_across_branch_rejected() {
        let yaml = r#"
name: dup
steps:
  - id: a
    type: manual
    branches:
      - when: "true"
        steps:
          - id: a
            type: manual
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID: 'a'"));
    }

    #[test]
    fn test_duplicate_block_key_rejected() {
        let yaml = r#"
name: dup-block
steps:
  - iterate:
      id: sweep
      over: "a"
      steps:
        - id: one
          type: manual
  - iterate:
      id: sweep
      over: "b"
      steps:
        - id: two
          type: manual
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate iterate block key"));
    }

    #[test]
    fn test_empty_block_rejected() {
        let yaml = r#"
name: empty-block
steps:
  - iterate:
      until: "true"
      steps: []
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_block_mode_must_be_exclusive() {
        let yaml = r#"
name: both
steps:
  - iterate:
      until: "true"
      over: "a,b"
      steps:
        - id: x
          type: manual
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("both `until` and `over`"));

        let yaml = r#"
name: neither
steps:
  - iterate:
      steps:
        - id: x
          type: manual
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("must set `until` or `over`"));
    }

    #[test]
    fn test_zero_max_rejected() {
        let yaml = r#"
name: zero
steps:
  - iterate:
      until: "true"
      max: 0
      steps:
        - id: x
          type: manual
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("at least one pass"));
    }

    #[test]
    fn test_unknown_import_rejected() {
        let yaml = r#"
name: caller
steps:
  - id: call
    type: invoke
    workflow: missing-alias
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown import 'missing-alias'"));
    }

    #[test]
    fn test_invoke_by_path_accepted() {
        let yaml = r#"
name: caller
steps:
  - id: call
    type: invoke
    workflow: ./child.yaml
"#;
        assert!(parse_runbook_yaml(yaml).is_ok());
    }

    #[test]
    fn test_duplicate_evidence_rejected() {
        let yaml = r#"
name: ev
steps:
  - id: collect
    type: manual
    evidence:
      - name: log
      - name: log
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("evidence 'log' twice"));
    }

    #[test]
    fn test_unknown_capture_source_rejected() {
        let yaml = r#"
name: cap
steps:
  - id: run
    type: command
    command: date
    capture:
      when: stdin
"#;
        let err = parse_runbook_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown source 'stdin'"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let def = parse_runbook_yaml(VALID).unwrap();
        let yaml = serialize_runbook_yaml(&def).unwrap();
        let reparsed = parse_runbook_yaml(&yaml).unwrap();
        assert_eq!(reparsed, def);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_runbook_source(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, RunbookError::NotFound(_)));
    }

    #[test]
    fn test_deserialize_skips_validation() {
        let def = deserialize_runbook_yaml("name: empty\nsteps: []\n").unwrap();
        assert!(def.steps.is_empty());
        assert!(matches!(
            deserialize_runbook_yaml("name: [unclosed"),
            Err(RunbookError::ParseError(_))
        ));
    }
}
