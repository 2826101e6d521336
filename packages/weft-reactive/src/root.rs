//! [`Root`] of the reactive graph and the propagation machinery.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use slotmap::{Key, SlotMap};

use crate::error::ScopeError;
use crate::node::{NodeId, NodeKind, NodeState, ReactiveNode};

/// Maximum number of computation executions in a single drain before the
/// drain is aborted as a runaway loop.
pub(crate) const MAX_EXECUTIONS_PER_DRAIN: u64 = 1_000_000;

/// The struct managing the state of the reactive system. One per running
/// runtime; leaked to obtain a `&'static Root` and reinitialised on dispose.
pub(crate) struct Root {
    /// All the nodes created in this `Root`.
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    /// The currently running computation, if signal accesses are tracked.
    pub tracker: Cell<Option<NodeId>>,
    /// The node that owns everything created in the current scope.
    pub current_owner: Cell<NodeId>,
    /// The top-level node of this root.
    pub root_node: Cell<NodeId>,
    /// Pure computations (memos and render effects) awaiting a run.
    pub update_queue: RefCell<VecDeque<NodeId>>,
    /// Deferred side effects awaiting a run. Drained after the updates settle.
    pub effect_queue: RefCell<VecDeque<NodeId>>,
    /// Nesting depth of `batch` calls. Queues drain when this returns to zero.
    pub batch_depth: Cell<u32>,
    /// Whether a drain is currently in progress.
    pub draining: Cell<bool>,
    /// Computation executions in the current drain, checked against
    /// [`MAX_EXECUTIONS_PER_DRAIN`].
    pub executions: Cell<u64>,
    /// Callback invoked after every full drain.
    pub on_flush: RefCell<Option<Rc<dyn Fn()>>>,
    /// An error thrown without any boundary to catch it.
    pub pending_error: RefCell<Option<ScopeError>>,
}

thread_local! {
    /// The current reactive root.
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// Get the current reactive root. Panics if no root is found.
    pub fn global() -> &'static Root {
        GLOBAL_ROOT.with(|root| root.get()).expect("no reactive root found")
    }

    /// Sets the current reactive root. Returns the previous root.
    pub fn set_global(root: Option<&'static Root>) -> Option<&'static Root> {
        GLOBAL_ROOT.with(|r| r.replace(root))
    }

    /// Create a new reactive root. The root is leaked and lives until the end
    /// of the program; `reinit` frees everything allocated inside it.
    pub fn new_static() -> &'static Self {
        let this = Self {
            nodes: RefCell::new(SlotMap::default()),
            tracker: Cell::new(None),
            current_owner: Cell::new(NodeId::null()),
            root_node: Cell::new(NodeId::null()),
            update_queue: RefCell::new(VecDeque::new()),
            effect_queue: RefCell::new(VecDeque::new()),
            batch_depth: Cell::new(0),
            draining: Cell::new(false),
            executions: Cell::new(0),
            on_flush: RefCell::new(None),
            pending_error: RefCell::new(None),
        };
        let _ref = Box::leak(Box::new(this));
        _ref.reinit();
        _ref
    }

    /// Disposes of all the resources held on by this root and resets it.
    pub fn reinit(&'static self) {
        self.dispose_node(self.root_node.get());

        self.tracker.set(None);
        let _ = self.update_queue.take();
        let _ = self.effect_queue.take();
        let _ = self.nodes.take();
        let _ = self.on_flush.take();
        let _ = self.pending_error.take();
        self.batch_depth.set(0);
        self.draining.set(false);
        self.executions.set(0);
        self.current_owner.set(NodeId::null());

        let root_node = self
            .nodes
            .borrow_mut()
            .insert(ReactiveNode::new(NodeId::null(), NodeKind::Plain));
        self.root_node.set(root_node);
        self.current_owner.set(root_node);
    }

    /// Insert a fresh node owned by the current owner.
    pub fn create_node(&self, kind: NodeKind) -> NodeId {
        let parent = self.current_owner.get();
        let id = self.nodes.borrow_mut().insert(ReactiveNode::new(parent, kind));
        if !parent.is_null() {
            if let Some(parent_node) = self.nodes.borrow_mut().get_mut(parent) {
                parent_node.children.push(id);
            }
        }
        id
    }

    /// Run the provided closure with `tracker` set to the given computation.
    pub fn with_tracker<T>(&self, tracker: Option<NodeId>, f: impl FnOnce() -> T) -> T {
        let prev = self.tracker.replace(tracker);
        let ret = f();
        self.tracker.set(prev);
        ret
    }

    /// Register a read of `source` by the currently tracking computation,
    /// establishing the reciprocal subscription. No-op when not tracking,
    /// on self-reads, and on duplicate reads within one run.
    pub fn track_access(&self, source: NodeId) {
        let Some(listener) = self.tracker.get() else {
            return;
        };
        if listener == source {
            return;
        }
        let mut nodes = self.nodes.borrow_mut();
        if !nodes.contains_key(listener) || !nodes.contains_key(source) {
            return;
        }
        if nodes[listener].sources.contains(&source) {
            return;
        }
        let source_slot = nodes[listener].sources.len() as u32;
        let observer_slot = nodes[source].observers.len() as u32;
        {
            let listener_node = &mut nodes[listener];
            listener_node.sources.push(source);
            listener_node.source_slots.push(observer_slot);
        }
        {
            let source_node = &mut nodes[source];
            source_node.observers.push(listener);
            source_node.observer_slots.push(source_slot);
        }
    }

    /// Remove every subscription of `id`, fixing the reciprocal slot of any
    /// neighbour moved by the swap-and-pop removal.
    pub fn clear_sources(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(id) else {
            return;
        };
        let sources = std::mem::take(&mut node.sources);
        let slots = std::mem::take(&mut node.source_slots);
        for (source, slot) in sources.into_iter().zip(slots) {
            let slot = slot as usize;
            let Some(source_node) = nodes.get_mut(source) else {
                continue;
            };
            source_node.observers.swap_remove(slot);
            source_node.observer_slots.swap_remove(slot);
            if slot < source_node.observers.len() {
                // Fix up the reciprocal slot of the moved observer.
                let moved = source_node.observers[slot];
                let moved_source_slot = source_node.observer_slots[slot] as usize;
                if let Some(moved_node) = nodes.get_mut(moved) {
                    moved_node.source_slots[moved_source_slot] = slot as u32;
                }
            }
        }
    }

    /// Remove every observer of `id`, fixing reciprocal slots on both sides.
    fn clear_observers(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(id) else {
            return;
        };
        let observers = std::mem::take(&mut node.observers);
        let slots = std::mem::take(&mut node.observer_slots);
        for (observer, slot) in observers.into_iter().zip(slots) {
            let slot = slot as usize;
            let Some(observer_node) = nodes.get_mut(observer) else {
                continue;
            };
            observer_node.sources.swap_remove(slot);
            observer_node.source_slots.swap_remove(slot);
            if slot < observer_node.sources.len() {
                let moved_source = observer_node.sources[slot];
                let moved_observer_slot = observer_node.source_slots[slot] as usize;
                if let Some(moved_node) = nodes.get_mut(moved_source) {
                    moved_node.observer_slots[moved_observer_slot] = slot as u32;
                }
            }
        }
    }

    /// Dispose everything owned by `id` without freeing the node itself:
    /// owned scopes in reverse insertion order, then cleanups in reverse.
    pub fn dispose_node_children(&'static self, id: NodeId) {
        let Some((children, cleanups)) = self.nodes.borrow_mut().get_mut(id).map(|node| {
            (std::mem::take(&mut node.children), std::mem::take(&mut node.cleanups))
        }) else {
            return;
        };
        for child in children.into_iter().rev() {
            self.dispose_node(child);
        }
        self.with_tracker(None, || {
            for cleanup in cleanups.into_iter().rev() {
                cleanup();
            }
        });
    }

    /// Dispose `id` entirely. Tolerates dead nodes.
    pub fn dispose_node(&'static self, id: NodeId) {
        if !self.nodes.borrow().contains_key(id) {
            return;
        }
        self.dispose_node_children(id);
        self.clear_sources(id);
        self.clear_observers(id);
        self.nodes.borrow_mut().remove(id);
    }

    /// Push a computation onto the queue matching its kind.
    fn enqueue(&self, id: NodeId, kind: NodeKind) {
        match kind {
            NodeKind::Memo | NodeKind::RenderEffect => {
                self.update_queue.borrow_mut().push_back(id)
            }
            NodeKind::Effect => self.effect_queue.borrow_mut().push_back(id),
            NodeKind::Plain => {}
        }
    }

    /// Mark the direct observers of `id` stale and their transitive observers
    /// pending, queueing every computation touched.
    pub fn mark_observers(&self, id: NodeId) {
        let observers = match self.nodes.borrow().get(id) {
            Some(node) => node.observers.clone(),
            None => return,
        };
        for observer in observers {
            let Some((state, kind)) = self
                .nodes
                .borrow()
                .get(observer)
                .map(|node| (node.state, node.kind))
            else {
                continue;
            };
            match state {
                NodeState::Clean => {
                    self.nodes.borrow_mut()[observer].state = NodeState::Stale;
                    self.enqueue(observer, kind);
                    self.mark_downstream(observer);
                }
                NodeState::Pending => {
                    // A direct write trumps the shallow mark.
                    self.nodes.borrow_mut()[observer].state = NodeState::Stale;
                }
                NodeState::Stale => {}
            }
        }
    }

    /// Shallow-mark the transitive observers of `id` as pending.
    fn mark_downstream(&self, id: NodeId) {
        let observers = match self.nodes.borrow().get(id) {
            Some(node) => node.observers.clone(),
            None => return,
        };
        for observer in observers {
            let Some((state, kind)) = self
                .nodes
                .borrow()
                .get(observer)
                .map(|node| (node.state, node.kind))
            else {
                continue;
            };
            if state == NodeState::Clean {
                self.nodes.borrow_mut()[observer].state = NodeState::Pending;
                self.enqueue(observer, kind);
                self.mark_downstream(observer);
            }
        }
    }

    /// Mark a single computation stale out-of-band (used by keyed selectors).
    pub fn mark_node_stale(&self, id: NodeId) {
        let Some((state, kind)) = self
            .nodes
            .borrow()
            .get(id)
            .map(|node| (node.state, node.kind))
        else {
            return;
        };
        match state {
            NodeState::Clean => {
                self.nodes.borrow_mut()[id].state = NodeState::Stale;
                self.enqueue(id, kind);
                self.mark_downstream(id);
            }
            NodeState::Pending => self.nodes.borrow_mut()[id].state = NodeState::Stale,
            NodeState::Stale => {}
        }
    }

    /// Entry point after a signal write: mark and, when idle, drain.
    pub fn propagate_from(&'static self, id: NodeId) {
        self.mark_observers(id);
        self.run_queues_if_idle();
    }

    pub fn run_queues_if_idle(&'static self) {
        if self.batch_depth.get() > 0 || self.draining.get() {
            return;
        }
        self.run_queues();
    }

    /// Drain the update queue, then the effect queue. Effects writing signals
    /// enqueue fresh updates which take priority over remaining effects, so no
    /// consumer ever observes a half-settled graph.
    fn run_queues(&'static self) {
        self.draining.set(true);
        self.executions.set(0);
        loop {
            let next = self
                .update_queue
                .borrow_mut()
                .pop_front()
                .or_else(|| self.effect_queue.borrow_mut().pop_front());
            let Some(id) = next else { break };
            self.update_if_necessary(id);
            if self.executions.get() > MAX_EXECUTIONS_PER_DRAIN {
                tracing::error!(
                    executions = self.executions.get(),
                    "aborting drain: potential infinite loop in reactive graph"
                );
                let _ = self.update_queue.take();
                let _ = self.effect_queue.take();
                crate::error::route_error(
                    self,
                    ScopeError::msg("potential infinite loop: reactive drain exceeded execution cap"),
                );
                break;
            }
        }
        self.draining.set(false);
        let on_flush = self.on_flush.borrow().clone();
        if let Some(on_flush) = on_flush {
            on_flush();
        }
    }

    /// Settle a queued or lazily-read computation, running it from its
    /// deepest unsettled ancestor downward.
    ///
    /// Upstream sources from the last run are settled first, so a consumer
    /// never executes before its sources. A pending node whose upstreams all
    /// settled to equal values becomes clean without re-running.
    pub fn update_if_necessary(&'static self, id: NodeId) {
        let Some(state) = self.nodes.borrow().get(id).map(|node| node.state) else {
            return;
        };
        if state == NodeState::Clean {
            return;
        }
        let sources = self.nodes.borrow()[id].sources.clone();
        for source in sources {
            let is_computation = self
                .nodes
                .borrow()
                .get(source)
                .map(|node| node.is_computation())
                .unwrap_or(false);
            if is_computation {
                self.update_if_necessary(source);
            }
            if !self.nodes.borrow().contains_key(id) {
                return;
            }
        }
        match self.nodes.borrow().get(id).map(|node| node.state) {
            Some(NodeState::Pending) => {
                // Every upstream settled to an equal value.
                self.nodes.borrow_mut()[id].state = NodeState::Clean;
            }
            Some(NodeState::Stale) => self.run_computation(id),
            _ => {}
        }
    }

    /// Re-run a computation: drop old subscriptions and owned scopes, execute
    /// the callback tracked, and when the value changed promote downstream
    /// pending marks to stale.
    pub fn run_computation(&'static self, id: NodeId) {
        self.executions.set(self.executions.get() + 1);
        self.clear_sources(id);
        self.dispose_node_children(id);

        let Some((callback, mut value)) = self.nodes.borrow_mut().get_mut(id).map(|node| {
            node.state = NodeState::Clean;
            (node.callback.take(), node.value.take())
        }) else {
            return;
        };
        let Some(mut callback) = callback else {
            // A plain scope has nothing to run; put the value back.
            if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
                node.value = value;
            }
            return;
        };

        let prev_root = Root::set_global(Some(self));
        let prev_owner = self.current_owner.replace(id);
        let prev_tracker = self.tracker.replace(Some(id));
        let changed = callback(&mut value);
        self.tracker.set(prev_tracker);
        self.current_owner.set(prev_owner);
        Root::set_global(prev_root);

        // The computation may have disposed itself during the run.
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.callback = Some(callback);
            node.value = value;
        } else {
            return;
        }

        if changed {
            self.promote_observers(id);
        }
    }

    /// After a changed run, ensure downstream consumers re-run: pending marks
    /// become stale, and clean observers (subscribed mid-drain) are queued.
    fn promote_observers(&self, id: NodeId) {
        let observers = match self.nodes.borrow().get(id) {
            Some(node) => node.observers.clone(),
            None => return,
        };
        for observer in observers {
            let Some((state, kind)) = self
                .nodes
                .borrow()
                .get(observer)
                .map(|node| (node.state, node.kind))
            else {
                continue;
            };
            match state {
                NodeState::Pending => self.nodes.borrow_mut()[observer].state = NodeState::Stale,
                NodeState::Clean => {
                    self.nodes.borrow_mut()[observer].state = NodeState::Stale;
                    self.enqueue(observer, kind);
                }
                NodeState::Stale => {}
            }
        }
    }

    pub fn start_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    pub fn end_batch(&'static self) {
        let depth = self.batch_depth.get();
        debug_assert!(depth > 0, "end_batch without start_batch");
        self.batch_depth.set(depth - 1);
        if depth == 1 {
            self.run_queues_if_idle();
        }
    }

    /// Verify the reciprocal subscription invariant over the whole arena.
    /// Test-only; panics on the first violation found.
    #[cfg(test)]
    pub fn assert_reciprocal_links(&self) {
        let nodes = self.nodes.borrow();
        for (id, node) in nodes.iter() {
            assert_eq!(node.sources.len(), node.source_slots.len());
            assert_eq!(node.observers.len(), node.observer_slots.len());
            for (i, (&source, &slot)) in
                node.sources.iter().zip(&node.source_slots).enumerate()
            {
                let source_node = &nodes[source];
                assert_eq!(source_node.observers[slot as usize], id, "observer back-reference");
                assert_eq!(
                    source_node.observer_slots[slot as usize] as usize, i,
                    "observer slot back-reference"
                );
            }
        }
    }
}
