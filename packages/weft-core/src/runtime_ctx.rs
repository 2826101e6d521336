//! Per-runtime render context.
//!
//! One `RenderCtx` exists per runtime: it owns the instance registry, the
//! duplicate-ID ownership map, the hydration data loaded from persisted
//! state, and the render-time cursors (current fiber, resource path). It is
//! installed thread-locally while rendering so that [`use_async_output`]
//! (crate::use_async_output) can reach it from inside component functions,
//! and reactive boundaries re-install it when they re-render during a drain.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use weft_reactive::NodeHandle;

use crate::fiber::FiberRef;
use crate::instance::InstanceNode;
use crate::Value;

/// Registry and cursor state of one runtime.
pub struct RenderCtx {
    /// Registered instances by ID. Entries persist across re-renders so that
    /// a re-registered ID reuses its output signals.
    instances: RefCell<IndexMap<String, Rc<InstanceNode>>>,
    /// ID → fiber path of the claiming fiber; detects ID collisions.
    ownership: RefCell<HashMap<String, String>>,
    /// Outputs loaded from persisted state, consumed on registration.
    hydration: RefCell<HashMap<String, IndexMap<String, Value>>>,
    /// Scope that owns output signals: they must outlive any single fiber.
    signal_owner: RefCell<Option<NodeHandle>>,
    /// Dotted-name ancestry of instance-bearing components.
    resource_path: RefCell<Vec<String>>,
    /// Fiber of the component currently executing.
    current_fiber: RefCell<Option<FiberRef>>,
}

thread_local! {
    static ACTIVE: RefCell<Vec<Rc<RenderCtx>>> = const { RefCell::new(Vec::new()) };
}

/// Uninstalls the context when dropped.
pub struct RenderCtxGuard;

impl Drop for RenderCtxGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl RenderCtx {
    /// A fresh, empty context.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            instances: RefCell::new(IndexMap::new()),
            ownership: RefCell::new(HashMap::new()),
            hydration: RefCell::new(HashMap::new()),
            signal_owner: RefCell::new(None),
            resource_path: RefCell::new(Vec::new()),
            current_fiber: RefCell::new(None),
        })
    }

    /// Install `ctx` as the innermost active context until the guard drops.
    pub fn enter(ctx: &Rc<RenderCtx>) -> RenderCtxGuard {
        ACTIVE.with(|stack| stack.borrow_mut().push(Rc::clone(ctx)));
        RenderCtxGuard
    }

    /// The innermost active context, if rendering.
    pub fn current() -> Option<Rc<RenderCtx>> {
        ACTIVE.with(|stack| stack.borrow().last().cloned())
    }

    /// Set the scope under which output signals are created.
    pub fn set_signal_owner(&self, owner: NodeHandle) {
        *self.signal_owner.borrow_mut() = Some(owner);
    }

    pub(crate) fn signal_owner(&self) -> Option<NodeHandle> {
        *self.signal_owner.borrow()
    }

    /// Seed hydration outputs for an instance ID before rendering.
    pub fn seed_hydration(&self, id: impl Into<String>, outputs: IndexMap<String, Value>) {
        self.hydration.borrow_mut().insert(id.into(), outputs);
    }

    pub(crate) fn take_hydration(&self, id: &str) -> Option<IndexMap<String, Value>> {
        self.hydration.borrow_mut().remove(id)
    }

    /// Look up a registered instance by ID. Entries survive fiber teardown,
    /// keeping output signals and cleanup callbacks reachable until the
    /// scheduler processes the delete.
    pub fn get_instance(&self, id: &str) -> Option<Rc<InstanceNode>> {
        self.instances.borrow().get(id).cloned()
    }

    pub(crate) fn insert_instance(&self, node: Rc<InstanceNode>) {
        self.instances.borrow_mut().insert(node.id().to_string(), node);
    }

    /// Drop every registered instance; used on runtime teardown.
    pub fn clear_instances(&self) {
        self.instances.borrow_mut().clear();
    }

    /// All registered instances, in registration order.
    pub fn registered_instances(&self) -> Vec<Rc<InstanceNode>> {
        self.instances.borrow().values().cloned().collect()
    }

    /// Claim an instance ID for a fiber path. Two distinct paths claiming the
    /// same ID in one render pass is fatal.
    pub(crate) fn claim_id(&self, id: &str, fiber_path: &str, component: &str, key: &str) {
        let mut ownership = self.ownership.borrow_mut();
        match ownership.get(id) {
            Some(existing) if existing != fiber_path => panic!(
                "duplicate instance id `{id}`: component `{component}` with key `{key}` \
                 is rendered at both `{existing}` and `{fiber_path}`"
            ),
            _ => {
                ownership.insert(id.to_string(), fiber_path.to_string());
            }
        }
    }

    pub(crate) fn release_id(&self, id: &str) {
        self.ownership.borrow_mut().remove(id);
    }

    /// Forget every ID claim; called at the start of a full render pass.
    pub fn clear_ownership(&self) {
        self.ownership.borrow_mut().clear();
    }

    pub(crate) fn push_resource_segment(&self, segment: String) {
        self.resource_path.borrow_mut().push(segment);
    }

    pub(crate) fn resource_path_len(&self) -> usize {
        self.resource_path.borrow().len()
    }

    pub(crate) fn truncate_resource_path(&self, len: usize) {
        self.resource_path.borrow_mut().truncate(len);
    }

    pub(crate) fn resource_path_snapshot(&self) -> Vec<String> {
        self.resource_path.borrow().clone()
    }

    pub(crate) fn swap_resource_path(&self, path: Vec<String>) -> Vec<String> {
        std::mem::replace(&mut self.resource_path.borrow_mut(), path)
    }

    /// The dotted join of the current resource path.
    pub(crate) fn resource_id(&self) -> String {
        self.resource_path.borrow().join(".")
    }

    pub(crate) fn swap_current_fiber(&self, fiber: Option<FiberRef>) -> Option<FiberRef> {
        std::mem::replace(&mut self.current_fiber.borrow_mut(), fiber)
    }

    pub(crate) fn current_fiber(&self) -> Option<FiberRef> {
        self.current_fiber.borrow().clone()
    }
}
