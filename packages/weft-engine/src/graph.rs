//! Dependency graph derivation and topological ordering.
//!
//! An edge `a → b` exists iff a depth-first walk of `b`'s props finds a
//! value sharing provenance with one of `a`'s output values: `Rc` identity
//! for lists and maps, value equality for strings and numbers. The graph is
//! derived, never stored; callers rebuild it whenever the instance set
//! changes.

use indexmap::{IndexMap, IndexSet};

use weft_core::{Props, Value};

use crate::error::EngineError;

/// One node's inputs to the graph walk.
pub struct GraphNode {
    /// Instance ID.
    pub id: String,
    /// Resolved props snapshot.
    pub props: Props,
    /// Last-known outputs.
    pub outputs: IndexMap<String, Value>,
}

/// `id → set of ids it depends on` (incoming edges), in deterministic order.
pub type DependencyGraph = IndexMap<String, IndexSet<String>>;

fn walk_matches(value: &Value, outputs: &IndexMap<String, Value>) -> bool {
    if outputs
        .values()
        .any(|output| Value::provenance_eq(value, output))
    {
        return true;
    }
    match value {
        Value::List(list) => list.iter().any(|value| walk_matches(value, outputs)),
        Value::Map(map) => map.values().any(|value| walk_matches(value, outputs)),
        _ => false,
    }
}

/// Build the dependency graph over the given nodes.
pub fn dependency_graph(nodes: &[GraphNode]) -> DependencyGraph {
    let mut graph: DependencyGraph = nodes
        .iter()
        .map(|node| (node.id.clone(), IndexSet::new()))
        .collect();
    for consumer in nodes {
        for producer in nodes {
            if producer.id == consumer.id || producer.outputs.is_empty() {
                continue;
            }
            let depends = consumer
                .props
                .values()
                .any(|value| walk_matches(value, &producer.outputs));
            if depends {
                graph
                    .entry(consumer.id.clone())
                    .or_default()
                    .insert(producer.id.clone());
            }
        }
    }
    graph
}

/// Kahn's topological sort restricted to `ids`, with a deterministic
/// tiebreak by the order of `ids`. Dependencies outside `ids` are treated as
/// already satisfied.
pub fn topological_order(
    graph: &DependencyGraph,
    ids: &[String],
) -> Result<Vec<String>, EngineError> {
    let in_set: IndexSet<&String> = ids.iter().collect();
    let mut remaining: IndexMap<&String, IndexSet<&String>> = ids
        .iter()
        .map(|id| {
            let deps = graph
                .get(id)
                .map(|deps| deps.iter().filter(|dep| in_set.contains(dep)).collect())
                .unwrap_or_default();
            (id, deps)
        })
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id);
        let Some(id) = next else {
            return Err(EngineError::Cycle(
                remaining.keys().map(|id| (*id).clone()).collect(),
            ));
        };
        remaining.shift_remove(&id);
        for deps in remaining.values_mut() {
            deps.shift_remove(&id);
        }
        order.push(id.clone());
    }
    Ok(order)
}
