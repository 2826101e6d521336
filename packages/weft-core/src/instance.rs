//! The managed-instance registry.
//!
//! A component declares at most one managed instance with
//! [`use_async_output`]: a deterministic ID derived from the keyed component
//! ancestry, a props snapshot the scheduler diffs, a handler that
//! materialises the resource, and output signals that survive re-renders so
//! downstream consumers stay subscribed.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use weft_reactive::{batch, create_effect, create_signal_with, untrack, NodeHandle, Signal};

use crate::fiber::FiberKind;
use crate::runtime_ctx::RenderCtx;
use crate::{ElementKind, Props, Value};

/// Error type surfaced by handlers and cleanups.
pub type HandlerError = Box<dyn std::error::Error>;

/// What a handler resolves to: an optional cleanup to run when the instance
/// is removed (never on update or resume).
pub type HandlerResult = Result<Option<Cleanup>, HandlerError>;

/// The setup function of a managed instance. Receives the props snapshot at
/// launch time and the instance's [`Outputs`] handle.
pub type Handler = Rc<dyn Fn(Props, Outputs) -> LocalBoxFuture<'static, HandlerResult>>;

/// An async cleanup callable stored on the instance after its handler ran.
#[derive(Clone)]
pub struct Cleanup(Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), HandlerError>>>);

impl Cleanup {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + 'static,
    {
        Self(Rc::new(move || Box::pin(f())))
    }

    /// Invoke the cleanup.
    pub fn run(&self) -> LocalBoxFuture<'static, Result<(), HandlerError>> {
        (self.0)()
    }
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cleanup")
    }
}

/// Wrap an async closure into a [`Handler`].
///
/// ```
/// # use weft_core::{handler, Value};
/// let h = handler(|_props, outputs| async move {
///     outputs.set([("url".to_string(), Value::str("https://example"))]);
///     Ok(None)
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Props, Outputs) -> Fut + 'static,
    Fut: Future<Output = HandlerResult> + 'static,
{
    Rc::new(move |props, outputs| Box::pin(f(props, outputs)))
}

/// A registered managed resource.
pub struct InstanceNode {
    id: String,
    path: Vec<String>,
    props: RefCell<Props>,
    handler: RefCell<Handler>,
    output_signals: RefCell<IndexMap<String, Signal<Value>>>,
    outputs: RefCell<IndexMap<String, Value>>,
    cleanup: RefCell<Option<Cleanup>>,
    signal_owner: Option<NodeHandle>,
}

impl InstanceNode {
    fn new(id: String, path: Vec<String>, handler: Handler, signal_owner: Option<NodeHandle>) -> Self {
        Self {
            id,
            path,
            props: RefCell::new(Props::new()),
            handler: RefCell::new(handler),
            output_signals: RefCell::new(IndexMap::new()),
            outputs: RefCell::new(IndexMap::new()),
            cleanup: RefCell::new(None),
            signal_owner,
        }
    }

    /// Deterministic instance ID: the dotted join of the resource path.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The resource path segments the ID derives from.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Current resolved props snapshot.
    pub fn props_snapshot(&self) -> Props {
        self.props.borrow().clone()
    }

    /// The current handler. Re-registration replaces it, so stale closures
    /// from previous renders never run.
    pub fn handler(&self) -> Handler {
        self.handler.borrow().clone()
    }

    /// Last-known outputs snapshot.
    pub fn outputs(&self) -> IndexMap<String, Value> {
        self.outputs.borrow().clone()
    }

    /// The outputs handle given to handlers and consumers.
    pub fn outputs_handle(self: &Rc<Self>) -> Outputs {
        Outputs {
            node: Rc::clone(self),
        }
    }

    /// Store the cleanup a handler returned.
    pub fn set_cleanup(&self, cleanup: Option<Cleanup>) {
        if cleanup.is_some() {
            *self.cleanup.borrow_mut() = cleanup;
        }
    }

    /// The stored cleanup, if any.
    pub fn cleanup(&self) -> Option<Cleanup> {
        self.cleanup.borrow().clone()
    }

    /// Run `f` under the scope that owns output signals. Installs that
    /// scope's reactive root, so output writes work from handler futures
    /// running outside any render pass.
    fn with_signal_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match self.signal_owner {
            Some(owner) => owner.run_in(f),
            None => f(),
        }
    }

    /// The signal backing one output key, created empty on first access.
    pub fn output_signal(&self, key: &str) -> Signal<Value> {
        if let Some(signal) = self.output_signals.borrow().get(key) {
            return *signal;
        }
        let signal = self.with_signal_scope(|| {
            create_signal_with(Value::Undefined, |a: &Value, b: &Value| Value::shallow_eq(a, b))
        });
        self.output_signals.borrow_mut().insert(key.to_string(), signal);
        signal
    }

    /// Seed outputs from persisted state before the handler runs. Consumers
    /// subscribed to the output signals see the persisted values on first
    /// read.
    pub fn seed_outputs(&self, outputs: IndexMap<String, Value>) {
        for (key, value) in &outputs {
            self.output_signal(key).set(value.clone());
        }
        *self.outputs.borrow_mut() = outputs;
    }

    fn set_outputs(&self, updates: IndexMap<String, Value>) {
        let unchanged = updates.iter().all(|(key, value)| {
            self.outputs
                .borrow()
                .get(key)
                .is_some_and(|current| Value::shallow_eq(current, value))
        });
        if unchanged {
            return;
        }
        self.outputs.borrow_mut().extend(updates.clone());
        self.with_signal_scope(|| {
            batch(|| {
                for (key, value) in updates {
                    self.output_signal(&key).set(value);
                }
            });
        });
    }

    pub(crate) fn replace_registration(&self, props: Props, handler: Handler) {
        *self.props.borrow_mut() = props;
        *self.handler.borrow_mut() = handler;
    }

    pub(crate) fn set_props(&self, props: Props) {
        *self.props.borrow_mut() = props;
    }
}

impl std::fmt::Debug for InstanceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceNode")
            .field("id", &self.id)
            .field("props", &*self.props.borrow())
            .finish()
    }
}

/// Read/write handle over an instance's outputs.
#[derive(Clone)]
pub struct Outputs {
    node: Rc<InstanceNode>,
}

impl Outputs {
    /// Accessor for one output key. Reading it subscribes to the key's
    /// signal; the signal is created empty on first access.
    pub fn get(&self, key: &str) -> OutputAccessor {
        OutputAccessor {
            signal: self.node.output_signal(key),
        }
    }

    /// Write outputs. A write in which every key's value is shallow-equal to
    /// the current one is a no-op; otherwise changed signals are written
    /// inside a single batch.
    pub fn set(&self, updates: impl IntoIterator<Item = (String, Value)>) {
        self.node.set_outputs(updates.into_iter().collect());
    }

    /// Write outputs computed from the previous snapshot.
    pub fn set_with(
        &self,
        f: impl FnOnce(&IndexMap<String, Value>) -> IndexMap<String, Value>,
    ) {
        let updates = f(&self.node.outputs.borrow().clone());
        self.node.set_outputs(updates);
    }
}

/// A zero-arg read over one output key.
#[derive(Clone, Copy)]
pub struct OutputAccessor {
    signal: Signal<Value>,
}

impl OutputAccessor {
    /// Current value, tracked. A stored accessor value is invoked once, so
    /// consumers never see a bare closure.
    pub fn get(&self) -> Value {
        match self.signal.get_clone() {
            Value::Accessor(f) => f(),
            value => value,
        }
    }
}

impl From<OutputAccessor> for Value {
    fn from(accessor: OutputAccessor) -> Value {
        Value::accessor(move || accessor.get())
    }
}

/// Where an instance's props come from.
pub enum PropsSource {
    /// A plain snapshot taken at registration.
    Snapshot(Props),
    /// A reactive getter; an effect keeps the instance's snapshot current so
    /// the scheduler sees prop changes.
    Getter(Rc<dyn Fn() -> Props>),
}

impl From<Props> for PropsSource {
    fn from(props: Props) -> Self {
        PropsSource::Snapshot(props)
    }
}

impl PropsSource {
    /// Build the reactive-getter form.
    pub fn getter(f: impl Fn() -> Props + 'static) -> Self {
        PropsSource::Getter(Rc::new(f))
    }
}

/// Turn a component name into its ID segment prefix.
pub(crate) fn kebab(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Declare the managed instance of the current component.
///
/// Must be called at most once per component, during its execution, and the
/// component must carry a user-supplied key: the instance ID is the dotted
/// join of `kebab(component-name)-key` segments along the instance-bearing
/// ancestry, so it is deterministic across renders and restarts.
///
/// The returned [`Outputs`] handle exposes one accessor per output key;
/// values arrive once the deployment scheduler has run the handler (or
/// immediately, when hydrated from persisted state).
///
/// # Panics
/// Panics when called outside a component, twice in one component, without a
/// key, or when two distinct fiber paths derive the same ID.
pub fn use_async_output(props: impl Into<PropsSource>, handler: Handler) -> Outputs {
    let ctx = RenderCtx::current()
        .expect("use_async_output called outside of a render pass");
    let fiber = ctx
        .current_fiber()
        .expect("use_async_output called outside of a component");

    let (component_name, key, fiber_path) = {
        let fiber = fiber.borrow();
        let name = match &fiber.kind {
            FiberKind::Component(el) => match el.kind() {
                ElementKind::Component(component) => component.name(),
                _ => unreachable!("component fiber holds a component element"),
            },
            _ => panic!("use_async_output may only be called from a component"),
        };
        if fiber.instance.is_some() {
            panic!("component `{name}` declared more than one managed instance");
        }
        (name, fiber.key.clone(), fiber.path.join("/"))
    };
    let Some(key) = key else {
        panic!(
            "component `{component_name}` declares a managed instance and must be \
             given a key"
        );
    };

    let segment = format!("{}-{}", kebab(component_name), key);
    ctx.push_resource_segment(segment);
    let id = ctx.resource_id();
    ctx.claim_id(&id, &fiber_path, component_name, &key);

    let source = props.into();
    let snapshot = match &source {
        PropsSource::Snapshot(props) => props.resolved(),
        PropsSource::Getter(getter) => untrack(|| getter().resolved()),
    };

    let existing = ctx.get_instance(&id);
    let hydrated = ctx.take_hydration(&id);
    // A fresh fiber starts from the snapshot's definedness even when it
    // reattaches an existing registry node: an instance with undefined props
    // must never ride a re-render into the published set.
    let deferred = !snapshot.fully_defined() && hydrated.is_none();

    let node = match existing {
        Some(node) => {
            node.replace_registration(snapshot.clone(), handler);
            node
        }
        None => {
            let node = Rc::new(InstanceNode::new(
                id.clone(),
                ctx.resource_path_snapshot(),
                handler,
                ctx.signal_owner(),
            ));
            node.set_props(snapshot.clone());
            if let Some(outputs) = hydrated {
                node.seed_outputs(outputs);
            }
            ctx.insert_instance(Rc::clone(&node));
            node
        }
    };
    {
        let mut fiber = fiber.borrow_mut();
        fiber.placeholder = deferred;
        fiber.instance = Some(Rc::clone(&node));
    }

    if let PropsSource::Getter(getter) = source {
        // Keeps the snapshot current and promotes the deferred placeholder
        // once every non-children prop is defined.
        let effect_node = Rc::clone(&node);
        let fiber_weak = Rc::downgrade(&fiber);
        let getter = Rc::clone(&getter);
        create_effect(move |_: Option<()>| {
            let snapshot = getter().resolved();
            effect_node.set_props(snapshot.clone());
            if let Some(fiber) = fiber_weak.upgrade() {
                let promote = fiber.borrow().placeholder && snapshot.fully_defined();
                if promote {
                    fiber.borrow_mut().placeholder = false;
                }
            }
        });
    }

    node.outputs_handle()
}
