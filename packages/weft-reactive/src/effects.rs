//! Side effects.

use std::any::Any;

use crate::node::{NodeKind, NodeState};
use crate::Root;

fn create_computation<T: 'static>(
    kind: NodeKind,
    mut f: impl FnMut(Option<T>) -> T + 'static,
) -> crate::node::NodeId {
    let root = Root::global();
    let id = root.create_node(kind);
    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.callback = Some(Box::new(move |value: &mut Option<Box<dyn Any>>| {
            let prev = value.take().and_then(|prev| prev.downcast::<T>().ok());
            let next = f(prev.map(|prev| *prev));
            *value = Some(Box::new(next));
            false
        }));
        node.state = NodeState::Stale;
    }
    id
}

/// Creates an effect re-run whenever a signal read inside it changes.
///
/// The closure receives its own previous return value (`None` on the first
/// run). Effects are deferred: they run once the pure layer of the graph has
/// settled, so an effect never observes a half-updated memo.
///
/// # Example
/// ```
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
///
/// create_effect(move |_: Option<()>| {
///     println!("new state = {}", state.get());
/// });
/// // Prints "new state = 0"
///
/// state.set(1);
/// // Prints "new state = 1"
/// # });
/// ```
///
/// Returns a handle to the effect's scope, usable to dispose it before its
/// owner goes away.
pub fn create_effect<T: 'static>(f: impl FnMut(Option<T>) -> T + 'static) -> crate::NodeHandle {
    let root = Root::global();
    let id = create_computation(NodeKind::Effect, f);
    root.effect_queue.borrow_mut().push_back(id);
    root.run_queues_if_idle();
    crate::NodeHandle(id, root)
}

/// Creates a pure-phase computation: like an effect, but run during the
/// updates drain, before deferred effects. The first run happens immediately.
///
/// This is the primitive behind reactive boundaries and list projection,
/// where downstream structures must be consistent within the same batch that
/// changed their inputs.
pub fn create_render_effect<T: 'static>(
    f: impl FnMut(Option<T>) -> T + 'static,
) -> crate::NodeHandle {
    let root = Root::global();
    let id = create_computation(NodeKind::RenderEffect, f);
    root.run_computation(id);
    crate::NodeHandle(id, root)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn effect() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_signal(-1);

            create_effect(move |_: Option<()>| {
                double.set(state.get() * 2);
            });
            assert_eq!(double.get(), 0); // effect ran at creation

            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn effect_receives_previous_value() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let observed = Rc::new(RefCell::new(Vec::new()));

            let observed2 = Rc::clone(&observed);
            create_effect(move |prev: Option<i32>| {
                observed2.borrow_mut().push(prev);
                state.get()
            });

            state.set(2);
            state.set(5);
            assert_eq!(*observed.borrow(), [None, Some(1), Some(2)]);
        });
    }

    #[test]
    fn effect_should_only_subscribe_once_to_same_signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let counter = create_signal(0);

            create_effect(move |_: Option<()>| {
                counter.set(counter.get_untracked() + 1);

                // Track state twice, subscribe once.
                state.track();
                state.track();
            });

            assert_eq!(counter.get(), 1);

            state.set(1);
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn effect_should_recreate_dependencies_each_time() {
        let _ = create_root(|| {
            let condition = create_signal(true);

            let state1 = create_signal(0);
            let state2 = create_signal(1);

            let counter = create_signal(0);
            create_effect(move |_: Option<()>| {
                counter.set(counter.get_untracked() + 1);

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
    fn outer_effects_run_first() {
        let _ = create_root(|| {
            let trigger = create_signal_with((), |_, _| false);

            let outer_counter = create_signal(0);
            let inner_counter = create_signal(0);

            create_effect(move |_: Option<()>| {
                trigger.track();
                outer_counter.set(outer_counter.get_untracked() + 1);

                create_effect(move |_: Option<()>| {
                    trigger.track();
                    inner_counter.set(inner_counter.get_untracked() + 1);
                });
            });

            assert_eq!(outer_counter.get(), 1);
            assert_eq!(inner_counter.get(), 1);

            trigger.set(());

            assert_eq!(outer_counter.get(), 2);
            assert_eq!(inner_counter.get(), 2);
        });
    }

    #[test]
    fn destroy_effects_on_scope_dispose() {
        let _ = create_root(|| {
            let counter = create_signal(0);
            let trigger = create_signal_with((), |_, _| false);

            let child_scope = create_child_scope(move || {
                create_effect(move |_: Option<()>| {
                    trigger.track();
                    counter.set(counter.get_untracked() + 1);
                });
            });

            assert_eq!(counter.get(), 1);

            trigger.set(());
            assert_eq!(counter.get(), 2);

            child_scope.dispose();
            trigger.set(());
            assert_eq!(counter.get(), 2); // effect was destroyed
        });
    }

    #[test]
    fn effects_run_after_memos_settle() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_memo(move || state.get() * 2);

            let seen = Rc::new(RefCell::new(Vec::new()));
            let seen2 = Rc::clone(&seen);
            create_effect(move |_: Option<()>| {
                seen2.borrow_mut().push((state.get(), double.get()));
            });

            state.set(3);
            // The effect never observes a half-settled pair.
            assert_eq!(*seen.borrow(), [(1, 2), (3, 6)]);
        });
    }

    #[test]
    fn render_effect_runs_in_pure_phase() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let order = Rc::new(RefCell::new(Vec::new()));

            let order2 = Rc::clone(&order);
            create_effect(move |_: Option<()>| {
                state.track();
                order2.borrow_mut().push("effect");
            });
            let order3 = Rc::clone(&order);
            create_render_effect(move |_: Option<()>| {
                state.track();
                order3.borrow_mut().push("render");
            });

            order.borrow_mut().clear();
            state.set(1);
            assert_eq!(*order.borrow(), ["render", "effect"]);
        });
    }
}
