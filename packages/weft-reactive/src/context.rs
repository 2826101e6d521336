//! Context state management.
//!
//! A context value provided on a scope is visible from every descendant
//! scope; providing the same type lower in the tree shadows the outer value.

use std::any::TypeId;

use crate::Root;

/// Provides a context value in the current scope.
///
/// Because context values are handed out by clone, they are usually cheap
/// handles: a [`Signal`](crate::Signal), an `Rc`, etc.
///
/// # Panics
/// Panics if a context of the same type was already provided on this scope.
/// Shadowing a context from a _parent_ scope is fine.
pub fn provide_context<T: Clone + 'static>(value: T) {
    let root = Root::global();
    let owner = root.current_owner.get();
    let type_id = TypeId::of::<T>();
    let mut nodes = root.nodes.borrow_mut();
    let Some(node) = nodes.get_mut(owner) else {
        return;
    };
    if node.contexts.iter().any(|(id, _)| *id == type_id) {
        panic!("a context of this type already exists on this scope");
    }
    node.contexts.push((type_id, Box::new(value)));
}

/// Tries to get a context value of the given type by walking up the scope
/// tree. Returns `None` if no scope provides one.
pub fn try_use_context<T: Clone + 'static>() -> Option<T> {
    let root = Root::global();
    let type_id = TypeId::of::<T>();
    let nodes = root.nodes.borrow();
    let mut current = root.current_owner.get();
    while let Some(node) = nodes.get(current) {
        for (id, value) in node.contexts.iter().rev() {
            if *id == type_id {
                return value.downcast_ref::<T>().cloned();
            }
        }
        current = node.parent;
    }
    None
}

/// Gets a context value of the given type.
///
/// # Panics
/// Panics if the context cannot be found in the current scope hierarchy. For
/// a non-panicking version, see [`try_use_context`].
pub fn use_context<T: Clone + 'static>() -> T {
    try_use_context().expect("context not found for type")
}

/// Gets a context value of the given type, or provides the result of the
/// closure on the _current_ scope and returns it.
pub fn use_context_or_else<T: Clone + 'static>(f: impl FnOnce() -> T) -> T {
    try_use_context().unwrap_or_else(|| {
        let value = f();
        provide_context(value.clone());
        value
    })
}
