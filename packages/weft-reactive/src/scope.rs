//! Reactive roots, ownership scopes, and batching.

use std::rc::Rc;

use crate::node::NodeKind;
use crate::{NodeHandle, Root};

/// A handle to a root. This lets you reinitialize or dispose the root for
/// resource cleanup.
///
/// This is generally obtained from [`create_root`].
#[derive(Clone, Copy)]
pub struct RootHandle {
    _ref: &'static Root,
}

impl RootHandle {
    /// Destroy everything that was created in this root.
    pub fn dispose(&self) {
        self._ref.reinit();
    }

    /// Runs the closure with this root installed as the current one.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = Root::set_global(Some(self._ref));
        let ret = f();
        Root::set_global(prev);
        ret
    }

    /// Handle to the top-level ownership scope of this root.
    pub fn root_scope(&self) -> NodeHandle {
        NodeHandle(self._ref.root_node.get(), self._ref)
    }

    /// Take the error that escaped every boundary since the last call, if any.
    pub fn take_error(&self) -> Option<crate::ScopeError> {
        self._ref.pending_error.borrow_mut().take()
    }

    /// Install the callback invoked after every full drain of the reactive
    /// queues. Passing `None` clears it.
    pub fn set_on_flush(&self, callback: Option<Rc<dyn Fn()>>) {
        *self._ref.on_flush.borrow_mut() = callback;
    }
}

/// Creates a new reactive root with a top-level scope. The returned
/// [`RootHandle`] can be used to [`dispose`](RootHandle::dispose) the root.
///
/// # Example
/// ```rust
/// # use weft_reactive::*;
/// create_root(|| {
///     let signal = create_signal(123);
///
///     let child_scope = create_child_scope(move || {
///         // ...
///     });
/// });
/// ```
#[must_use = "root should be disposed"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let _ref = Root::new_static();
    Root::set_global(Some(_ref));
    f();
    Root::set_global(None);
    RootHandle { _ref }
}

/// Create a child scope owned by the current scope.
///
/// Returns the created [`NodeHandle`] which can be used to dispose it before
/// its owner goes away.
pub fn create_child_scope(f: impl FnOnce()) -> NodeHandle {
    let root = Root::global();
    let id = root.create_node(NodeKind::Plain);
    let prev = root.current_owner.replace(id);
    f();
    root.current_owner.set(prev);
    NodeHandle(id, root)
}

/// Adds a callback that is called when the current scope is disposed or, for
/// computations, before every re-run.
///
/// # Example
/// ```rust
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let child_scope = create_child_scope(|| {
///     on_cleanup(|| {
///         println!("scope is going away");
///     });
/// });
/// child_scope.dispose(); // Executes the on_cleanup callback.
/// # });
/// ```
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    let root = Root::global();
    let owner = root.current_owner.get();
    if let Some(node) = root.nodes.borrow_mut().get_mut(owner) {
        node.cleanups.push(Box::new(f));
    }
}

/// Get a handle to the current ownership scope.
pub fn use_current_scope() -> NodeHandle {
    let root = Root::global();
    NodeHandle(root.current_owner.get(), root)
}

/// Run `f` with `owner` as the current ownership scope. Everything created
/// inside belongs to `owner` instead of the calling scope.
pub fn with_owner<T>(owner: NodeHandle, f: impl FnOnce() -> T) -> T {
    owner.run_in(f)
}

/// Batch updates from related signals together, running observers only once
/// at the end of the scope. Nested batches merge into the outermost one.
///
/// # Example
///
/// ```
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let double = create_memo(move || state.get() * 2);
/// batch(move || {
///     state.set(2);
///     state.set(3);
/// });
/// assert_eq!(double.get(), 6);
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.start_batch();
    let ret = f();
    root.end_batch();
    ret
}

/// Run the passed closure with signal tracking disabled.
///
/// # Example
///
/// ```
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let double = create_memo(move || untrack(|| state.get() * 2));
/// assert_eq!(double.get(), 2);
///
/// state.set(2);
/// // Still the old value: the read was untracked.
/// assert_eq!(double.get(), 2);
/// # });
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.with_tracker(None, f)
}

/// Something whose reads can be registered as dependencies without reading a
/// value: signals, memos, and tuples of them.
pub trait Trackable {
    /// Track all contained sources in the current computation.
    fn track_all(&self);
}

impl<A: Trackable, B: Trackable> Trackable for (A, B) {
    fn track_all(&self) {
        self.0.track_all();
        self.1.track_all();
    }
}
impl<A: Trackable, B: Trackable, C: Trackable> Trackable for (A, B, C) {
    fn track_all(&self) {
        self.0.track_all();
        self.1.track_all();
        self.2.track_all();
    }
}
impl<T: Trackable, const N: usize> Trackable for [T; N] {
    fn track_all(&self) {
        for t in self {
            t.track_all();
        }
    }
}

/// A set of sources [`on`] can track and read as a unit: a signal, a memo,
/// or a tuple or array of them.
pub trait DependencyList: Trackable {
    /// What reading every source produces.
    type Values: 'static;

    /// Read every source, subscribing the current computation.
    fn read_all(&self) -> Self::Values;
}

impl<A: DependencyList, B: DependencyList> DependencyList for (A, B) {
    type Values = (A::Values, B::Values);
    fn read_all(&self) -> Self::Values {
        (self.0.read_all(), self.1.read_all())
    }
}
impl<A: DependencyList, B: DependencyList, C: DependencyList> DependencyList for (A, B, C) {
    type Values = (A::Values, B::Values, C::Values);
    fn read_all(&self) -> Self::Values {
        (self.0.read_all(), self.1.read_all(), self.2.read_all())
    }
}
impl<D: DependencyList, const N: usize> DependencyList for [D; N] {
    type Values = [D::Values; N];
    fn read_all(&self) -> Self::Values {
        std::array::from_fn(|i| self[i].read_all())
    }
}

/// Adapter making dependencies explicit: the listed sources are read eagerly
/// and are the only subscriptions; the body runs untracked and receives the
/// new values, the values from the previous run, and its own previous return
/// value.
///
/// To skip the body on the first run, see [`on_deferred`].
///
/// # Example
/// ```
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let other = create_signal(10);
///
/// create_effect(on(state, move |new: &i32, prev: Option<&i32>, _: Option<()>| {
///     // `other` is read here but only `state` re-runs this effect.
///     let _ = other.get() + *new;
///     assert!(prev.is_none() || prev < Some(new));
/// }));
/// # });
/// ```
pub fn on<D, U>(
    deps: D,
    mut f: impl FnMut(&D::Values, Option<&D::Values>, Option<U>) -> U + 'static,
) -> impl FnMut(Option<U>) -> U + 'static
where
    D: DependencyList + 'static,
{
    let mut prev: Option<D::Values> = None;
    move |prev_value| {
        let new = deps.read_all();
        let result = untrack(|| f(&new, prev.as_ref(), prev_value));
        prev = Some(new);
        result
    }
}

/// The deferred form of [`on`]: the first run only records the sources'
/// values, and the body runs from the first change onward. The wrapped
/// computation's value type becomes `Option<U>`, `None` until the body has
/// run.
pub fn on_deferred<D, U>(
    deps: D,
    mut f: impl FnMut(&D::Values, Option<&D::Values>, Option<U>) -> U + 'static,
) -> impl FnMut(Option<Option<U>>) -> Option<U> + 'static
where
    D: DependencyList + 'static,
{
    let mut prev: Option<D::Values> = None;
    move |prev_value| {
        let new = deps.read_all();
        let result = if prev.is_some() {
            Some(untrack(|| f(&new, prev.as_ref(), prev_value.flatten())))
        } else {
            None
        };
        prev = Some(new);
        result
    }
}
