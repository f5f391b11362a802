//! The continuation queue and its units.
//!
//! A continuation is the ordered work-list of one level of a run. Units are
//! popped from the front; branch and iteration expansion push to the front
//! so expanded nodes run before whatever followed them. Besides steps and
//! unexpanded iterate blocks, the queue holds watchpoints: synthetic units
//! that decide whether another iteration pass runs.

use std::collections::VecDeque;
use std::sync::Arc;

use runbook_types::runbook::{IterateBlock, Step, TreeNode};
use serde_json::Value;

use super::compiled::CompiledRunbook;
use super::expression::value_to_string;

/// Errors building continuation units from the tree.
#[derive(Debug, thiserror::Error)]
pub enum ContinuationError {
    #[error("node '{0}' is not in the runbook index")]
    UnresolvedNode(String),

    #[error("iterate block has no stable key")]
    KeylessBlock,
}

// ---------------------------------------------------------------------------
// PendingNode
// ---------------------------------------------------------------------------

/// One unit of the continuation, holding shared handles into the runbook.
#[derive(Debug, Clone)]
pub enum PendingNode {
    /// A step to dispatch.
    Step { step: Arc<Step>, depth: u32 },
    /// An iterate block not yet expanded.
    Iterate {
        block: Arc<IterateBlock>,
        key: String,
        depth: u32,
    },
    /// Convergence watchpoint, checked after pass `pass` (zero-based).
    Converge {
        block: Arc<IterateBlock>,
        key: String,
        depth: u32,
        pass: u32,
        max: u32,
    },
    /// List watchpoint, checked after item `index`.
    List {
        block: Arc<IterateBlock>,
        key: String,
        depth: u32,
        items: Vec<String>,
        index: usize,
        variable: String,
    },
}

impl PendingNode {
    /// Resolve a tree node to a unit at `depth`.
    pub fn from_tree(
        runbook: &CompiledRunbook,
        node: &TreeNode,
        depth: u32,
    ) -> Result<Self, ContinuationError> {
        match node {
            TreeNode::Step(step) => {
                let step = runbook
                    .step(&step.id)
                    .ok_or_else(|| ContinuationError::UnresolvedNode(step.id.clone()))?;
                Ok(PendingNode::Step {
                    step: Arc::clone(step),
                    depth,
                })
            }
            TreeNode::Iterate(node) => {
                let key = node.iterate.key().ok_or(ContinuationError::KeylessBlock)?;
                let block = runbook
                    .block(&key)
                    .ok_or_else(|| ContinuationError::UnresolvedNode(key.clone()))?;
                Ok(PendingNode::Iterate {
                    block: Arc::clone(block),
                    key,
                    depth,
                })
            }
        }
    }

    pub fn depth(&self) -> u32 {
        match self {
            PendingNode::Step { depth, .. }
            | PendingNode::Iterate { depth, .. }
            | PendingNode::Converge { depth, .. }
            | PendingNode::List { depth, .. } => *depth,
        }
    }

    /// Step id or block key.
    pub fn label(&self) -> &str {
        match self {
            PendingNode::Step { step, .. } => &step.id,
            PendingNode::Iterate { key, .. }
            | PendingNode::Converge { key, .. }
            | PendingNode::List { key, .. } => key,
        }
    }

    pub fn is_watchpoint(&self) -> bool {
        matches!(self, PendingNode::Converge { .. } | PendingNode::List { .. })
    }
}

// ---------------------------------------------------------------------------
// Continuation
// ---------------------------------------------------------------------------

/// Ordered work-list with pop-front and push-to-front.
#[derive(Debug, Clone, Default)]
pub struct Continuation {
    queue: VecDeque<PendingNode>,
}

impl Continuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue from tree nodes, all at `depth`.
    pub fn from_nodes(
        runbook: &CompiledRunbook,
        nodes: &[TreeNode],
        depth: u32,
    ) -> Result<Self, ContinuationError> {
        let queue = nodes
            .iter()
            .map(|node| PendingNode::from_tree(runbook, node, depth))
            .collect::<Result<VecDeque<_>, _>>()?;
        Ok(Self { queue })
    }

    pub fn from_units(units: Vec<PendingNode>) -> Self {
        Self {
            queue: units.into(),
        }
    }

    pub fn pop_front(&mut self) -> Option<PendingNode> {
        self.queue.pop_front()
    }

    pub fn push_front(&mut self, node: PendingNode) {
        self.queue.push_front(node);
    }

    /// Push `units` ahead of the existing queue, keeping their order.
    pub fn push_front_all(&mut self, units: Vec<PendingNode>) {
        for unit in units.into_iter().rev() {
            self.queue.push_front(unit);
        }
    }

    /// Splice tree nodes (at `depth`) followed by an optional trailing
    /// watchpoint onto the front of the queue.
    pub fn expand_front(
        &mut self,
        runbook: &CompiledRunbook,
        nodes: &[TreeNode],
        depth: u32,
        trailer: Option<PendingNode>,
    ) -> Result<(), ContinuationError> {
        let mut units = nodes
            .iter()
            .map(|node| PendingNode::from_tree(runbook, node, depth))
            .collect::<Result<Vec<_>, _>>()?;
        units.extend(trailer);
        self.push_front_all(units);
        Ok(())
    }

    /// Remove and return every remaining unit.
    pub fn drain(&mut self) -> Vec<PendingNode> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingNode> {
        self.queue.iter()
    }
}

// ---------------------------------------------------------------------------
// List resolution
// ---------------------------------------------------------------------------

/// Turn a rendered `over` value into loop items.
///
/// Arrays are used item by item. Strings split on `separator`, or on commas
/// and newlines when none is given. Entries are trimmed and blanks dropped.
pub fn split_list(value: &Value, separator: Option<&str>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(value_to_string).collect(),
        Value::String(s) => match separator {
            Some(sep) if !sep.is_empty() => s.split(sep).map(str::to_string).collect(),
            _ => s
                .split([',', '\n'])
                .map(str::to_string)
                .collect(),
        },
        other => vec![value_to_string(other)],
    };

    raw.into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
