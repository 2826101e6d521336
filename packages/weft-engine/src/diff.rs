//! Diffing the previous instance set against the current one.

use std::rc::Rc;

use weft_core::InstanceNode;

use crate::error::EngineError;
use crate::graph::{dependency_graph, topological_order, DependencyGraph, GraphNode};
use crate::state::NodeRecord;

/// The partition of an apply pass.
#[derive(Debug, Default)]
pub struct Diff {
    /// IDs present now but not before.
    pub creates: Vec<String>,
    /// IDs present in both whose props differ structurally.
    pub updates: Vec<String>,
    /// IDs present before but gone now.
    pub deletes: Vec<String>,
    /// `creates ∪ updates` in dependency order.
    pub deployment_order: Vec<String>,
}

impl Diff {
    /// `true` when there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Project live instances into graph inputs.
pub fn graph_nodes(current: &[Rc<InstanceNode>]) -> Vec<GraphNode> {
    current
        .iter()
        .map(|node| GraphNode {
            id: node.id().to_string(),
            props: node.props_snapshot(),
            outputs: node.outputs(),
        })
        .collect()
}

/// Diff `previous` (persisted records) against `current` (live instances)
/// and order the work against the given dependency graph.
pub fn diff_nodes(
    previous: &[NodeRecord],
    current: &[Rc<InstanceNode>],
    graph: &DependencyGraph,
) -> Result<Diff, EngineError> {
    let mut diff = Diff::default();

    for node in current {
        match previous.iter().find(|record| record.id == node.id()) {
            None => diff.creates.push(node.id().to_string()),
            Some(record) if record.props != node.props_snapshot() => {
                diff.updates.push(node.id().to_string());
            }
            Some(_) => {}
        }
    }
    for record in previous {
        if !current.iter().any(|node| node.id() == record.id) {
            diff.deletes.push(record.id.clone());
        }
    }

    let mut pending: Vec<String> = diff.creates.clone();
    pending.extend(diff.updates.iter().cloned());
    diff.deployment_order = topological_order(graph, &pending)?;
    Ok(diff)
}

/// Dependency graph over persisted records; used to order deletes after the
/// live instances are already gone from the tree.
pub fn record_graph(records: &[NodeRecord]) -> DependencyGraph {
    let nodes: Vec<GraphNode> = records
        .iter()
        .map(|record| GraphNode {
            id: record.id.clone(),
            props: record.props.clone(),
            outputs: record.outputs.clone(),
        })
        .collect();
    dependency_graph(&nodes)
}
