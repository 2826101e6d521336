//! Memos: cached lazy derivations.

use std::any::Any;

use crate::node::{NodeKind, NodeState};
use crate::signals::create_empty_signal;
use crate::{ReadSignal, Root};

/// Creates a memoized computation from some signals, with a custom comparison
/// deciding whether dependents should be notified. The comparison receives
/// the new and the previous value and returns `true` if they are the same.
pub fn create_memo_with<T: 'static>(
    mut f: impl FnMut() -> T + 'static,
    eq: impl Fn(&T, &T) -> bool + 'static,
) -> ReadSignal<T> {
    let root = Root::global();
    let signal = create_empty_signal::<T>();
    {
        let mut node = signal.get_mut();
        node.kind = NodeKind::Memo;
        node.callback = Some(Box::new(move |value: &mut Option<Box<dyn Any>>| {
            let new = f();
            match value.as_ref().and_then(|old| old.downcast_ref::<T>()) {
                Some(old) if eq(&new, old) => false,
                _ => {
                    *value = Some(Box::new(new));
                    true
                }
            }
        }));
        node.state = NodeState::Stale;
    }
    // Compute the initial value and collect dependencies.
    root.run_computation(signal.id);
    *signal
}

/// Creates a memoized computation from some signals.
///
/// The output is re-derived whenever one of the signals read inside the
/// closure changes, and dependents are notified only when the derived value
/// actually differs from the previous one.
///
/// Reading a memo whose sources changed since its last run resolves it
/// synchronously before returning.
///
/// # Example
/// ```
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
/// let double = create_memo(move || state.get() * 2);
///
/// assert_eq!(double.get(), 0);
/// state.set(1);
/// assert_eq!(double.get(), 2);
/// # });
/// ```
pub fn create_memo<T: PartialEq + 'static>(f: impl FnMut() -> T + 'static) -> ReadSignal<T> {
    create_memo_with(f, T::eq)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn memo() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_memo(move || state.get() * 2);

            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    /// Make sure value is memoized rather than executed on demand.
    #[test]
    fn memo_only_run_once() {
        let _ = create_root(|| {
            let state = create_signal(0);

            let counter = create_signal(0);
            let double = create_memo(move || {
                counter.set_silent(counter.get_untracked() + 1);
                state.get() * 2
            });

            assert_eq!(counter.get(), 1); // once for calculating initial derived state
            state.set(2);
            assert_eq!(counter.get(), 2);
            assert_eq!(double.get(), 4);
            assert_eq!(counter.get(), 2); // should still be 2 after access
        });
    }

    #[test]
    fn dependency_on_memo() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_memo(move || state.get() * 2);
            let quadruple = create_memo(move || double.get() * 2);

            assert_eq!(quadruple.get(), 0);
            state.set(1);
            assert_eq!(quadruple.get(), 4);
        });
    }

    #[test]
    fn untracked_memo() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_memo(move || state.get_untracked() * 2);

            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 2); // state was not tracked
        });
    }

    #[test]
    fn memos_should_recreate_dependencies_each_time() {
        let _ = create_root(|| {
            let condition = create_signal(true);

            let state1 = create_signal(0);
            let state2 = create_signal(1);

            let counter = create_signal(0);
            create_memo(move || {
                counter.set_silent(counter.get_untracked() + 1);

                if condition.get() {
                    state1.track();
                } else {
                    state2.track();
                }
            });

            assert_eq!(counter.get(), 1);

            state1.set(1);
            assert_eq!(counter.get(), 2);

            state2.set(1);
            assert_eq!(counter.get(), 2); // not tracked

            condition.set(false);
            assert_eq!(counter.get(), 3);

            state1.set(2);
            assert_eq!(counter.get(), 3); // not tracked

            state2.set(2);
            assert_eq!(counter.get(), 4); // tracked after condition.set
        });
    }

    #[test]
    fn destroy_memos_on_scope_dispose() {
        let _ = create_root(|| {
            let counter = create_signal(0);
            let trigger = create_signal_with((), |_, _| false);

            let child_scope = create_child_scope(move || {
                let _ = create_memo(move || {
                    trigger.track();
                    counter.set_silent(counter.get_untracked() + 1);
                });
            });

            assert_eq!(counter.get(), 1);

            trigger.set(());
            assert_eq!(counter.get(), 2);

            child_scope.dispose();
            trigger.set(());
            assert_eq!(counter.get(), 2); // memo was destroyed and no longer runs
        });
    }

    /// Equal derived values stop propagation downstream.
    #[test]
    fn memo_short_circuits_equal_values() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let parity = create_memo(move || state.get() % 2);

            let runs = Rc::new(Cell::new(0));
            let runs2 = Rc::clone(&runs);
            let _downstream = create_memo(move || {
                runs2.set(runs2.get() + 1);
                parity.get()
            });
            assert_eq!(runs.get(), 1);

            state.set(3); // parity unchanged
            assert_eq!(runs.get(), 1);

            state.set(4); // parity flips
            assert_eq!(runs.get(), 2);
        });
    }

    /// Writing a signal runs sibling memos before their common consumer.
    #[test]
    fn topological_propagation_order() {
        let _ = create_root(|| {
            let log = Rc::new(std::cell::RefCell::new(Vec::new()));
            let state = create_signal(false);

            let b1 = {
                let log = Rc::clone(&log);
                create_memo(move || {
                    log.borrow_mut().push("b1");
                    state.get()
                })
            };
            let b2 = {
                let log = Rc::clone(&log);
                create_memo(move || {
                    log.borrow_mut().push("b2");
                    state.get()
                })
            };
            {
                let log = Rc::clone(&log);
                create_memo(move || {
                    log.borrow_mut().push("c");
                    (b1.get(), b2.get())
                });
            }

            log.borrow_mut().clear();
            state.set(true);
            assert_eq!(*log.borrow(), ["b1", "b2", "c"]);
        });
    }

    /// A wide diamond converges to a single downstream run per change.
    #[test]
    fn diamond_runs_downstream_once() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let branches: Vec<_> = (0..5)
                .map(|i| create_memo(move || state.get() + i))
                .collect();

            let runs = Rc::new(Cell::new(0));
            let sum = {
                let runs = Rc::clone(&runs);
                let branches = branches.clone();
                create_memo(move || {
                    runs.set(runs.get() + 1);
                    branches.iter().map(|memo| memo.get()).sum::<i32>()
                })
            };
            assert_eq!(runs.get(), 1);
            assert_eq!(sum.get(), 15);

            state.set(2);
            assert_eq!(runs.get(), 2);
            assert_eq!(sum.get(), 20);
        });
    }
}
