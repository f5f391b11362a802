//! Compiled runbooks with stable-id lookup tables.
//!
//! A `CompiledRunbook` pairs a validated definition with two tables built by
//! walking the whole tree: step id -> step and iterate block key -> block.
//! Continuation units hold shared handles taken from these tables, and a
//! persisted session is resolved against a freshly compiled copy on resume.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use runbook_types::runbook::{IterateBlock, RunbookDefinition, Step, TreeNode};
use serde::Serialize;

use super::definition::{RunbookError, validate_definition};

/// An immutable runbook ready for execution.
#[derive(Debug)]
pub struct CompiledRunbook {
    path: PathBuf,
    definition: RunbookDefinition,
    digest: Option<String>,
    steps: HashMap<String, Arc<Step>>,
    blocks: HashMap<String, Arc<IterateBlock>>,
}

impl CompiledRunbook {
    /// Validate `definition` and build its lookup tables.
    pub fn compile(
        path: impl Into<PathBuf>,
        definition: RunbookDefinition,
        digest: Option<String>,
    ) -> Result<Self, RunbookError> {
        validate_definition(&definition)?;

        let mut steps = HashMap::new();
        let mut blocks = HashMap::new();
        index_nodes(&definition.steps, &mut steps, &mut blocks)?;

        Ok(Self {
            path: path.into(),
            definition,
            digest,
            steps,
            blocks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &RunbookDefinition {
        &self.definition
    }

    /// Content digest of the source file, when the loader computed one.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Top-level nodes in declaration order.
    pub fn top_level(&self) -> &[TreeNode] {
        &self.definition.steps
    }

    pub fn step(&self, id: &str) -> Option<&Arc<Step>> {
        self.steps.get(id)
    }

    pub fn block(&self, key: &str) -> Option<&Arc<IterateBlock>> {
        self.blocks.get(key)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Flattened view of the tree for manifests.
    pub fn outline(&self) -> Vec<OutlineEntry> {
        let mut entries = Vec::new();
        outline_nodes(&self.definition.steps, 0, &mut entries);
        entries
    }
}

fn index_nodes(
    nodes: &[TreeNode],
    steps: &mut HashMap<String, Arc<Step>>,
    blocks: &mut HashMap<String, Arc<IterateBlock>>,
) -> Result<(), RunbookError> {
    for node in nodes {
        match node {
            TreeNode::Step(step) => {
                steps.insert(step.id.clone(), Arc::new(step.clone()));
                for branch in &step.branches {
                    index_nodes(&branch.steps, steps, blocks)?;
                }
            }
            TreeNode::Iterate(node) => {
                let key = node.iterate.key().ok_or_else(|| {
                    RunbookError::ValidationError("iterate block has no key".to_string())
                })?;
                blocks.insert(key, Arc::new(node.iterate.clone()));
                index_nodes(&node.iterate.steps, steps, blocks)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// One line of a runbook outline.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutlineEntry {
    pub key: String,
    /// Step kind, `iterate`, or `branch`.
    pub kind: String,
    pub title: String,
    pub depth: u32,
}

fn outline_nodes(nodes: &[TreeNode], depth: u32, out: &mut Vec<OutlineEntry>) {
    for node in nodes {
        match node {
            TreeNode::Step(step) => {
                out.push(OutlineEntry {
                    key: step.id.clone(),
                    kind: step.kind.as_str().to_string(),
                    title: step.display_title().to_string(),
                    depth,
                });
                for branch in &step.branches {
                    out.push(OutlineEntry {
                        key: format!("{}?{}", step.id, branch.when),
                        kind: "branch".to_string(),
                        title: branch.label.clone().unwrap_or_else(|| branch.when.clone()),
                        depth: depth + 1,
                    });
                    outline_nodes(&branch.steps, depth + 2, out);
                }
            }
            TreeNode::Iterate(node) => {
                let block = &node.iterate;
                let title = match (&block.over, &block.until) {
                    (Some(over), _) => format!("for each {} in {over}", block.variable),
                    (None, Some(until)) => format!("repeat until {until}"),
                    (None, None) => "iterate".to_string(),
                };
                out.push(OutlineEntry {
                    key: block.key().unwrap_or_default(),
                    kind: "iterate".to_string(),
                    title,
                    depth,
                });
                outline_nodes(&block.steps, depth + 1, out);
            }
        }
    }
}
