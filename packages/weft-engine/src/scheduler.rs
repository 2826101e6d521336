//! The concurrent cascading deployment executor.
//!
//! One `apply_changes` call diffs the previous node set against the live
//! instance set, destroys removed resources in reverse dependency order,
//! then runs the handlers of created/updated (and, on the initial run,
//! resumed) instances concurrently: independent nodes launch together, and
//! after every completion the instance set is re-collected so that children
//! materialised by a handler's outputs run in the same apply call.

use std::cell::Cell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexSet;
use weft_core::{InstanceNode, Props};

use crate::diff::{diff_nodes, graph_nodes, record_graph};
use crate::error::EngineError;
use crate::graph::{dependency_graph, topological_order, DependencyGraph};
use crate::machine::StateMachine;
use crate::state::{NodeRecord, ResourceState};

/// Hard cap on handler launches per deployment; a cascade that keeps
/// materialising new work beyond this is aborted.
pub const MAX_HANDLER_EXECUTIONS: u64 = 1_000_000;

/// Produces the current published instance set (collected from the fiber
/// tree after every reactive flush).
pub type CollectFn = Rc<dyn Fn() -> Vec<Rc<InstanceNode>>>;

/// Looks up a registry node by ID, including nodes no longer in the tree
/// (their cleanups live there).
pub type LookupFn = Rc<dyn Fn(&str) -> Option<Rc<InstanceNode>>>;

/// The deployment scheduler for one stack.
pub struct Scheduler {
    stack: String,
    machine: Rc<StateMachine>,
    collect: CollectFn,
    lookup: LookupFn,
    disposed: Rc<Cell<bool>>,
    executions: Cell<u64>,
}

impl Scheduler {
    /// Build a scheduler over the given stack and instance sources.
    pub fn new(
        stack: impl Into<String>,
        machine: Rc<StateMachine>,
        collect: CollectFn,
        lookup: LookupFn,
        disposed: Rc<Cell<bool>>,
    ) -> Self {
        Self {
            stack: stack.into(),
            machine,
            collect,
            lookup,
            disposed,
            executions: Cell::new(0),
        }
    }

    /// The state machine this scheduler persists through.
    pub fn machine(&self) -> Rc<StateMachine> {
        Rc::clone(&self.machine)
    }

    fn records(&self, nodes: &[Rc<InstanceNode>]) -> Vec<NodeRecord> {
        nodes
            .iter()
            .map(|node| NodeRecord::of(node, self.machine.resource_state(node.id())))
            .collect()
    }

    /// Run one apply pass. Returns the node records that were persisted on
    /// completion; they become the `previous` of the next pass.
    pub async fn apply_changes(
        &self,
        previous: Vec<NodeRecord>,
        initial: bool,
    ) -> Result<Vec<NodeRecord>, EngineError> {
        self.apply_internal(previous, initial).await
    }

    fn apply_internal(
        &self,
        previous: Vec<NodeRecord>,
        initial: bool,
    ) -> LocalBoxFuture<'_, Result<Vec<NodeRecord>, EngineError>> {
        Box::pin(async move {
            let current = (self.collect)();
            let graph = dependency_graph(&graph_nodes(&current));
            let diff = diff_nodes(&previous, &current, &graph)?;

            // On an initial run every untouched node re-runs idempotently.
            let mut resumed: Vec<String> = Vec::new();
            if initial {
                for node in &current {
                    let id = node.id();
                    if !diff.creates.iter().any(|c| c == id)
                        && !diff.updates.iter().any(|u| u == id)
                    {
                        resumed.push(id.to_string());
                    }
                }
            }

            if diff.is_empty() && resumed.is_empty() {
                let records = self.records(&current);
                self.machine
                    .complete_deployment(&self.stack, records.clone())
                    .await?;
                return Ok(records);
            }

            tracing::info!(
                stack = %self.stack,
                creates = diff.creates.len(),
                updates = diff.updates.len(),
                deletes = diff.deletes.len(),
                resumed = resumed.len(),
                "applying changes"
            );
            self.machine
                .start_deployment(&self.stack, self.records(&current))
                .await?;

            self.process_deletes(&previous, &diff.deletes).await?;

            let outcome = self
                .run_executor(current, graph, &diff.deployment_order, &resumed)
                .await;
            let (snapshot, deferred_deletes) = match outcome {
                Ok(result) => result,
                Err(err) => {
                    if let Err(persist_err) = self.machine.fail_deployment(&self.stack, &err).await
                    {
                        tracing::error!(error = %persist_err, "failed to persist failure status");
                    }
                    return Err(err);
                }
            };

            self.process_deletes(&previous, &deferred_deletes).await?;

            // The executor's snapshot may already be stale again.
            let now = (self.collect)();
            if fingerprints(&now) != fingerprints(&snapshot) {
                return self.apply_internal(self.records(&snapshot), false).await;
            }

            let records = self.records(&now);
            self.machine
                .complete_deployment(&self.stack, records.clone())
                .await?;
            Ok(records)
        })
    }

    /// Destroy the given IDs in reverse dependency order: dependents first.
    /// Cleanup failures are logged and never propagate.
    async fn process_deletes(
        &self,
        previous: &[NodeRecord],
        ids: &[String],
    ) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        let records: Vec<NodeRecord> = ids
            .iter()
            .map(|id| {
                previous
                    .iter()
                    .find(|record| &record.id == id)
                    .cloned()
                    .or_else(|| (self.lookup)(id).map(|node| NodeRecord::of(&node, None)))
                    .unwrap_or_else(|| NodeRecord {
                        id: id.clone(),
                        path: Vec::new(),
                        props: Props::new(),
                        outputs: Default::default(),
                        state: None,
                    })
            })
            .collect();
        let graph = record_graph(&records);
        let order = topological_order(&graph, ids)?;

        for id in order.iter().rev() {
            self.machine.set_resource_state(id, ResourceState::Applying);
            if let Some(node) = (self.lookup)(id) {
                if let Some(cleanup) = node.cleanup() {
                    if let Err(err) = cleanup.run().await {
                        tracing::error!(id = %id, error = %err, "resource cleanup failed");
                    }
                }
            }
            self.machine.record_resource_destroyed(&self.stack, id).await?;
            tracing::debug!(id = %id, "resource destroyed");
        }
        Ok(())
    }

    /// The concurrent executor with eager cascading.
    async fn run_executor(
        &self,
        mut snapshot: Vec<Rc<InstanceNode>>,
        mut graph: DependencyGraph,
        deployment_order: &[String],
        resumed: &[String],
    ) -> Result<(Vec<Rc<InstanceNode>>, Vec<String>), EngineError> {
        let mut pending: IndexSet<String> = deployment_order.iter().cloned().collect();
        pending.extend(resumed.iter().cloned());
        // Nodes that are neither created, updated, nor resumed already carry
        // their outputs; they satisfy dependencies as-is.
        let mut deployed: IndexSet<String> = snapshot
            .iter()
            .map(|node| node.id().to_string())
            .filter(|id| !pending.contains(id))
            .collect();
        let mut running: FuturesUnordered<LocalBoxFuture<'static, (String, Result<(), EngineError>)>> =
            FuturesUnordered::new();
        let mut running_ids: IndexSet<String> = IndexSet::new();
        let mut deferred_deletes: Vec<String> = Vec::new();

        loop {
            if self.disposed.get() {
                tracing::debug!(stack = %self.stack, "runtime disposed; executor stopping");
                break;
            }
            if pending.is_empty() && running_ids.is_empty() {
                break;
            }

            let ready: Vec<String> = pending
                .iter()
                .filter(|id| {
                    graph
                        .get(*id)
                        .map(|deps| deps.iter().all(|dep| deployed.contains(dep)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();

            if ready.is_empty() && running_ids.is_empty() {
                tracing::warn!(
                    stack = %self.stack,
                    pending = ?pending,
                    "nothing runnable with work still pending; breaking out"
                );
                break;
            }

            for id in ready {
                pending.shift_remove(&id);
                let count = self.executions.get() + 1;
                self.executions.set(count);
                if count > MAX_HANDLER_EXECUTIONS {
                    return Err(EngineError::ExecutionCap);
                }
                let Some(node) = snapshot.iter().find(|node| node.id() == id).cloned() else {
                    continue;
                };
                running_ids.insert(id);
                running.push(self.launch(node));
            }

            let Some((id, result)) = running.next().await else {
                continue;
            };
            running_ids.shift_remove(&id);

            match result {
                Err(err) => {
                    // Let in-flight handlers settle; launch nothing new.
                    while let Some((settled_id, settled)) = running.next().await {
                        if let Err(settled_err) = settled {
                            tracing::warn!(
                                id = %settled_id,
                                error = %settled_err,
                                "handler failed while settling a failed deployment"
                            );
                        }
                    }
                    return Err(err);
                }
                Ok(()) => {
                    deployed.insert(id);
                }
            }

            // Eager cascade: a completed handler may have materialised or
            // removed instances through its outputs.
            let now = (self.collect)();
            let now_ids: IndexSet<String> =
                now.iter().map(|node| node.id().to_string()).collect();
            let snapshot_ids: IndexSet<String> =
                snapshot.iter().map(|node| node.id().to_string()).collect();
            if now_ids != snapshot_ids {
                for appeared in now_ids.difference(&snapshot_ids) {
                    if !deployed.contains(appeared) && !running_ids.contains(appeared) {
                        tracing::debug!(id = %appeared, "discovered during cascade");
                        pending.insert(appeared.clone());
                    }
                }
                for disappeared in snapshot_ids.difference(&now_ids) {
                    pending.shift_remove(disappeared);
                    deferred_deletes.push(disappeared.clone());
                }
                snapshot = now;
                graph = dependency_graph(&graph_nodes(&snapshot));
            }
        }

        Ok((snapshot, deferred_deletes))
    }

    /// One handler execution with its persistence bookkeeping.
    fn launch(
        &self,
        node: Rc<InstanceNode>,
    ) -> LocalBoxFuture<'static, (String, Result<(), EngineError>)> {
        let machine = Rc::clone(&self.machine);
        let stack = self.stack.clone();
        Box::pin(async move {
            let id = node.id().to_string();
            tracing::debug!(id = %id, "handler starting");
            let result = async {
                machine.set_resource_state(&id, ResourceState::Applying);
                machine.add_applying(&stack, &id).await?;
                let handler = node.handler();
                match handler(node.props_snapshot(), node.outputs_handle()).await {
                    Ok(cleanup) => node.set_cleanup(cleanup),
                    Err(err) => {
                        machine.set_resource_state(&id, ResourceState::Failed);
                        return Err(EngineError::Handler {
                            id: id.clone(),
                            message: err.to_string(),
                        });
                    }
                }
                let outputs = node.outputs();
                machine.set_resource_state(&id, ResourceState::Deployed);
                machine.remove_applying(&stack, &id).await?;
                machine.update_node_outputs(&stack, &id, outputs.clone()).await?;
                machine.record_resource_applied(&stack, &id, &outputs).await?;
                Ok(())
            }
            .await;
            (id, result)
        })
    }
}

fn fingerprints(nodes: &[Rc<InstanceNode>]) -> Vec<(String, Props)> {
    nodes
        .iter()
        .map(|node| (node.id().to_string(), node.props_snapshot()))
        .collect()
}
