//! Error routing along the ownership tree.
//!
//! A user computation that fails calls [`throw_error`]; the error walks the
//! owner chain until a handler installed by [`catch_error`] (or
//! [`on_error`]) is found. An error that escapes every boundary is recorded
//! on the root, where the runtime picks it up at the next flush.

use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::node::NodeId;
use crate::Root;

/// A cheaply clonable, type-erased user error.
#[derive(Clone)]
pub struct ScopeError {
    inner: Rc<dyn Error>,
}

impl ScopeError {
    /// Wrap any error type.
    pub fn new(err: impl Error + 'static) -> Self {
        Self { inner: Rc::new(err) }
    }

    /// Build an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        #[derive(Debug)]
        struct Message(String);
        impl fmt::Display for Message {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
        impl Error for Message {}
        Self::new(Message(message.into()))
    }
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Debug for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl<E: Error + 'static> From<E> for ScopeError {
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

/// Install an error handler on the current scope. Errors thrown by this scope
/// or any descendant that has no nearer boundary are passed to `handler`.
pub fn on_error(handler: impl Fn(ScopeError) + 'static) {
    let root = Root::global();
    let owner = root.current_owner.get();
    if let Some(node) = root.nodes.borrow_mut().get_mut(owner) {
        node.error_handler = Some(Rc::new(handler));
    }
}

/// Run `f` inside a fresh scope carrying an error handler.
///
/// Anything created inside `f` — computations included — routes its thrown
/// errors to `handler` instead of escaping.
pub fn catch_error<T>(f: impl FnOnce() -> T, handler: impl Fn(ScopeError) + 'static) -> T {
    let mut out = None;
    crate::create_child_scope(|| {
        on_error(handler);
        out = Some(f());
    });
    match out {
        Some(out) => out,
        // The closure runs synchronously.
        None => unreachable!("child scope closure did not run"),
    }
}

/// Route an error up the owner chain to the nearest handler.
///
/// Called from inside user computations. If no boundary handles the error it
/// is recorded on the root and logged.
pub fn throw_error(err: impl Into<ScopeError>) {
    let root = Root::global();
    route_error(root, err.into());
}

pub(crate) fn route_error(root: &Root, err: ScopeError) {
    // Prefer the running computation's scope; fall back to the current owner.
    let start = root.tracker.get().unwrap_or_else(|| root.current_owner.get());
    if let Some(handler) = find_handler(root, start) {
        handler(err);
        return;
    }
    tracing::error!(error = %err, "uncaught reactive error");
    *root.pending_error.borrow_mut() = Some(err);
}

fn find_handler(root: &Root, start: NodeId) -> Option<Rc<dyn Fn(ScopeError)>> {
    let nodes = root.nodes.borrow();
    let mut current = start;
    while let Some(node) = nodes.get(current) {
        if let Some(handler) = &node.error_handler {
            return Some(Rc::clone(handler));
        }
        current = node.parent;
    }
    None
}
