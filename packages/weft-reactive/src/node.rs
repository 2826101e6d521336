//! Reactive nodes.

use std::any::{Any, TypeId};
use std::rc::Rc;

use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::error::ScopeError;
use crate::Root;

new_key_type! {
    /// Key into the reactive node arena.
    pub struct NodeId;
}

/// Update callback of a computation. Receives the previous value cell and
/// returns whether the produced value differs from the previous one.
pub(crate) type NodeCallback = Box<dyn FnMut(&mut Option<Box<dyn Any>>) -> bool>;

/// A node inside the reactive graph.
///
/// Every node is an ownership scope. A node with a value but no callback is a
/// signal; a node with a callback is a computation (memo, effect, or render
/// effect). The source/observer lists are reciprocal: if `o.sources[i] == s`
/// and `o.source_slots[i] == j`, then `s.observers[j] == o` and
/// `s.observer_slots[j] == i`.
pub(crate) struct ReactiveNode {
    /// Value of the node, if any. Signals and memos always carry one; effects
    /// use it to store the previous return value.
    pub value: Option<Box<dyn Any>>,
    /// Equality applied to writes. A write producing an equal value does not
    /// notify observers. `None` means every write notifies.
    pub equality: Option<Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>>,
    /// Callback run when the node needs to be updated.
    pub callback: Option<NodeCallback>,
    /// What kind of computation this node is, if any.
    pub kind: NodeKind,
    /// Two-phase staleness state.
    pub state: NodeState,
    /// The node that owns this node, or the null key for roots.
    pub parent: NodeId,
    /// Nodes owned by this node.
    pub children: Vec<NodeId>,
    /// Callbacks run when the node is disposed or re-run.
    pub cleanups: Vec<Box<dyn FnOnce()>>,
    /// Context values provided on this node.
    pub contexts: Vec<(TypeId, Box<dyn Any>)>,
    /// Error handler installed on this node, if any.
    pub error_handler: Option<Rc<dyn Fn(ScopeError)>>,
    /// Nodes this node reads from, with the reciprocal observer slot.
    pub sources: SmallVec<[NodeId; 4]>,
    pub source_slots: SmallVec<[u32; 4]>,
    /// Nodes reading from this node, with the reciprocal source slot.
    pub observers: SmallVec<[NodeId; 4]>,
    pub observer_slots: SmallVec<[u32; 4]>,
}

impl ReactiveNode {
    pub fn new(parent: NodeId, kind: NodeKind) -> Self {
        Self {
            value: None,
            equality: None,
            callback: None,
            kind,
            state: NodeState::Clean,
            parent,
            children: Vec::new(),
            cleanups: Vec::new(),
            contexts: Vec::new(),
            error_handler: None,
            sources: SmallVec::new(),
            source_slots: SmallVec::new(),
            observers: SmallVec::new(),
            observer_slots: SmallVec::new(),
        }
    }

    /// `true` if the node has an update callback, i.e. is a computation.
    pub fn is_computation(&self) -> bool {
        self.callback.is_some()
    }
}

/// What role a node plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// A plain ownership scope or a signal.
    Plain,
    /// A cached pure derivation.
    Memo,
    /// A deferred side effect.
    Effect,
    /// A pure-phase computation run during the updates drain.
    RenderEffect,
}

/// Staleness of a computation.
///
/// `Clean` nodes are up to date. `Stale` nodes have a source that definitely
/// changed and must re-run. `Pending` nodes sit downstream of a stale node;
/// whether they re-run depends on whether the intermediate values actually
/// changed once the upstream settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum NodeState {
    Clean,
    Pending,
    Stale,
}

/// A handle to a reactive node, usable to dispose it or to run code with the
/// node as the current owner.
#[derive(Clone, Copy)]
pub struct NodeHandle(pub(crate) NodeId, pub(crate) &'static Root);

impl NodeHandle {
    /// Dispose the node: recursively dispose owned scopes in reverse insertion
    /// order, run cleanups in reverse order, then unlink the node from the
    /// graph and free it. Disposing a dead node does nothing.
    pub fn dispose(self) {
        self.1.dispose_node(self.0);
    }

    /// Dispose everything owned by the node, keeping the node itself alive.
    pub fn dispose_children(self) {
        self.1.dispose_node_children(self.0);
    }

    /// `true` if the node has not been disposed.
    pub fn is_alive(self) -> bool {
        self.1.nodes.borrow().contains_key(self.0)
    }

    /// Run `f` with this node as the current owner. Anything created inside
    /// is owned by this node rather than by the caller's scope.
    pub fn run_in<T>(self, f: impl FnOnce() -> T) -> T {
        let prev_root = Root::set_global(Some(self.1));
        let prev_owner = self.1.current_owner.replace(self.0);
        let ret = f();
        self.1.current_owner.set(prev_owner);
        Root::set_global(prev_root);
        ret
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.0).finish()
    }
}
