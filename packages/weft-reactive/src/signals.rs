//! Reactive signals.

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;

use crate::node::{NodeId, NodeKind, NodeState};
use crate::{NodeHandle, Root};

/// A read-only reactive value.
///
/// A `ReadSignal` can be obtained by dereferencing a [`Signal`], and is what
/// [`create_memo`](crate::create_memo) returns. Reading it inside a
/// computation subscribes that computation; handles are `Copy` and can be
/// moved into any number of closures.
pub struct ReadSignal<T: 'static> {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
    _phantom: PhantomData<T>,
}

/// A reactive value that can be read and written to.
///
/// Writing a value equal to the current one (per the signal's equality, by
/// default the type's `PartialEq`) is a no-op: observers are not notified.
///
/// See [`create_signal`] for more information.
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// Create a new [`Signal`] with the type's structural equality.
///
/// Signals are reactive atoms: reading one inside a computation subscribes
/// the computation, and writing a different value re-runs every subscriber.
///
/// # Example
/// ```rust
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
/// let double = create_memo(move || state.get() * 2);
/// state.set(2);
/// assert_eq!(double.get(), 4);
/// # });
/// ```
pub fn create_signal<T: PartialEq + 'static>(value: T) -> Signal<T> {
    create_signal_with(value, T::eq)
}

/// Create a new [`Signal`] with a custom equality function. Pass
/// `|_, _| false` to make every write notify.
pub fn create_signal_with<T: 'static>(
    value: T,
    eq: impl Fn(&T, &T) -> bool + 'static,
) -> Signal<T> {
    let signal = create_empty_signal();
    {
        let mut node = signal.get_mut();
        node.value = Some(Box::new(value));
        node.equality = Some(Rc::new(move |a: &dyn Any, b: &dyn Any| {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => eq(a, b),
                _ => false,
            }
        }));
    }
    signal
}

/// Creates a new [`Signal`] with the `value` field set to `None`.
pub(crate) fn create_empty_signal<T>() -> Signal<T> {
    let root = Root::global();
    let id = root.create_node(NodeKind::Plain);
    Signal(ReadSignal {
        id,
        root,
        _phantom: PhantomData,
    })
}

impl<T> ReadSignal<T> {
    /// Get an immutable view of the underlying node's state.
    fn with_node<U>(self, f: impl FnOnce(&crate::node::ReactiveNode) -> U) -> U {
        let nodes = self.root.nodes.borrow();
        match nodes.get(self.id) {
            Some(node) => f(node),
            None => panic!("signal was disposed"),
        }
    }

    /// Get a mutable view of the underlying node's state.
    pub(crate) fn get_mut(self) -> std::cell::RefMut<'static, crate::node::ReactiveNode> {
        std::cell::RefMut::map(self.root.nodes.borrow_mut(), |nodes| {
            match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("signal was disposed"),
            }
        })
    }

    /// Returns `true` if the signal has not yet been disposed.
    pub fn is_alive(self) -> bool {
        self.root.nodes.borrow().contains_key(self.id)
    }

    /// Disposes the signal. Accessing a disposed signal panics.
    pub fn dispose(self) {
        NodeHandle(self.id, self.root).dispose();
    }

    /// Resolve a stale or pending memo before its value is read.
    fn settle(self) {
        let needs_update = self.with_node(|node| {
            node.is_computation() && node.state != NodeState::Clean
        });
        if needs_update {
            self.root.update_if_necessary(self.id);
        }
    }

    /// Get the value without tracking. The type must implement [`Copy`]; use
    /// [`ReadSignal::get_clone_untracked`] or [`ReadSignal::with_untracked`]
    /// otherwise.
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Get the value without tracking, cloning it.
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get the value, subscribing the current computation. The type must
    /// implement [`Copy`]; use [`ReadSignal::get_clone`] otherwise.
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Get the value, subscribing the current computation and cloning.
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Borrow the value inside a closure without tracking.
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.settle();
        self.with_node(|node| {
            let value = node.value.as_ref().expect("signal value is being updated");
            f(value.downcast_ref().expect("wrong signal type"))
        })
    }

    /// Borrow the value inside a closure, subscribing the current computation.
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Subscribe the current computation to this signal without reading the
    /// value. Done automatically by [`ReadSignal::get`] and friends.
    pub fn track(self) {
        self.root.track_access(self.id);
    }
}

impl<T> Signal<T> {
    /// Set a new value without notifying dependents.
    pub fn set_silent(self, new: T) {
        self.replace_silent(new);
    }

    /// Set a new value and notify dependents unless it equals the current one.
    pub fn set(self, new: T) {
        self.replace(new);
    }

    /// Silently set a new value, returning the previous one.
    pub fn replace_silent(self, new: T) -> T {
        self.update_silent(|value| std::mem::replace(value, new))
    }

    /// Set a new value, returning the previous one. Notifies dependents
    /// unless the new value equals the old.
    pub fn replace(self, new: T) -> T {
        let equal = {
            let nodes = self.0.root.nodes.borrow();
            let node = match nodes.get(self.0.id) {
                Some(node) => node,
                None => panic!("signal was disposed"),
            };
            match (&node.equality, &node.value) {
                (Some(eq), Some(old)) => eq(old.as_ref(), &new),
                _ => false,
            }
        };
        let old = self.replace_silent(new);
        if !equal {
            self.0.root.propagate_from(self.0.id);
        }
        old
    }

    /// Take the value, leaving `T::default()` and notifying dependents.
    pub fn take(self) -> T
    where
        T: Default,
    {
        self.replace(T::default())
    }

    /// Mutate the value in place without notifying dependents.
    pub fn update_silent<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut value = self.get_mut().value.take().expect("signal value is being updated");
        let ret = f(value.downcast_mut().expect("wrong signal type"));
        self.get_mut().value = Some(value);
        ret
    }

    /// Mutate the value in place and notify dependents. In-place updates
    /// always notify; there is no previous value left to compare against.
    pub fn update<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        let ret = self.update_silent(f);
        self.0.root.propagate_from(self.0.id);
        ret
    }

    /// Set the value computed from the previous one.
    pub fn set_fn(self, f: impl FnOnce(&T) -> T) {
        let next = self.with_untracked(|value| f(value));
        self.set(next);
    }
}

/// Manual `Clone` + `Copy` so that `T` needs no bounds.
impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

impl<T: Default + PartialEq> Default for Signal<T> {
    fn default() -> Self {
        create_signal(Default::default())
    }
}

impl<T: PartialEq> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for ReadSignal<T> {}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T> crate::Trackable for ReadSignal<T> {
    fn track_all(&self) {
        self.track();
    }
}
impl<T> crate::Trackable for Signal<T> {
    fn track_all(&self) {
        self.0.track();
    }
}

impl<T: Clone + 'static> crate::DependencyList for ReadSignal<T> {
    type Values = T;
    fn read_all(&self) -> T {
        self.get_clone()
    }
}
impl<T: Clone + 'static> crate::DependencyList for Signal<T> {
    type Values = T;
    fn read_all(&self) -> T {
        self.0.get_clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            assert_eq!(state.get(), 0);

            state.set(1);
            assert_eq!(state.get(), 1);

            state.set_fn(|n| *n + 1);
            assert_eq!(state.get(), 2);
        });
    }

    #[test]
    fn signal_composition() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = || state.get() * 2;

            assert_eq!(double(), 0);
            state.set(1);
            assert_eq!(double(), 2);
        });
    }

    #[test]
    fn set_silent_signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_memo(move || state.get() * 2);

            assert_eq!(double.get(), 0);
            state.set_silent(1);
            assert_eq!(double.get(), 0); // double value is unchanged.
        });
    }

    #[test]
    fn read_signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let readonly: ReadSignal<i32> = *state;

            assert_eq!(readonly.get(), 0);
            state.set(1);
            assert_eq!(readonly.get(), 1);
        });
    }

    #[test]
    fn equal_write_is_a_no_op() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(move |_: Option<()>| {
                state.track();
                runs.set(runs.get_untracked() + 1);
            });
            assert_eq!(runs.get(), 1);

            state.set(0);
            state.set(0);
            assert_eq!(runs.get(), 1);

            state.set(1);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn custom_equality_can_always_notify() {
        let _ = create_root(|| {
            let state = create_signal_with(0, |_, _| false);
            let runs = create_signal(0);
            create_effect(move |_: Option<()>| {
                state.track();
                runs.set(runs.get_untracked() + 1);
            });
            assert_eq!(runs.get(), 1);
            state.set(0);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn signal_update_notifies() {
        let _ = create_root(|| {
            let signal = create_signal("Hello ".to_string());
            let counter = create_signal(0);
            create_effect(move |_: Option<()>| {
                signal.track();
                counter.set(counter.get_untracked() + 1);
            });
            signal.update(|value| value.push_str("World!"));
            assert_eq!(signal.get_clone(), "Hello World!");
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn signal_display_and_debug() {
        let _ = create_root(|| {
            let signal = create_signal(0);
            assert_eq!(format!("{signal}"), "0");
            assert_eq!(format!("{signal:?}"), "0");
        });
    }

    #[test]
    fn reciprocal_links_hold_after_retracking() {
        let root = create_root(|| {
            let condition = create_signal(true);
            let a = create_signal(0);
            let b = create_signal(0);
            let c = create_signal(0);

            create_effect(move |_: Option<()>| {
                if condition.get() {
                    a.track();
                    b.track();
                } else {
                    c.track();
                }
            });
            create_memo(move || a.get() + b.get() + c.get());

            condition.set(false);
            a.set(1);
            condition.set(true);
            b.set(2);
        });
        root.run_in(|| {
            crate::Root::global().assert_reciprocal_links();
        });
        root.dispose();
    }
}
