//! Keyed membership selectors.
//!
//! A keyed selector turns a single source into an O(1)-per-change membership
//! signal: each reader subscribes under a key, and a change of the source
//! only wakes the readers whose membership actually flipped.

use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::node::NodeId;
use crate::{create_render_effect, on_cleanup, Root};

struct SelectorState<K, T> {
    subscribers: HashMap<K, Vec<NodeId>>,
    current: Option<T>,
}

/// A membership view over a reactive source. Obtained from
/// [`create_keyed_selector`].
pub struct KeyedSelector<K: 'static, T: 'static> {
    state: Rc<RefCell<SelectorState<K, T>>>,
    eq: Rc<dyn Fn(&K, &T) -> bool>,
    root: &'static Root,
}

impl<K, T> Clone for KeyedSelector<K, T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            eq: Rc::clone(&self.eq),
            root: self.root,
        }
    }
}

/// Build a keyed selector over `source`.
///
/// `eq` decides whether a key is a member for a given source value. Reading
/// the selector with [`KeyedSelector::check`] inside a computation registers
/// the computation under that key; a source change re-runs only computations
/// whose `eq` result changed.
///
/// # Example
/// ```
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let selected = create_signal(0usize);
/// let is_selected = create_keyed_selector(move || selected.get(), |key, value| key == value);
///
/// let under_first = {
///     let is_selected = is_selected.clone();
///     create_memo(move || is_selected.check(&0))
/// };
/// assert!(under_first.get());
/// selected.set(2);
/// assert!(!under_first.get());
/// # });
/// ```
pub fn create_keyed_selector<K, T>(
    mut source: impl FnMut() -> T + 'static,
    eq: impl Fn(&K, &T) -> bool + 'static,
) -> KeyedSelector<K, T>
where
    K: Eq + Hash + Clone + 'static,
    T: 'static,
{
    let root = Root::global();
    let state = Rc::new(RefCell::new(SelectorState {
        subscribers: HashMap::new(),
        current: None,
    }));
    let eq: Rc<dyn Fn(&K, &T) -> bool> = Rc::new(eq);

    let effect_state = Rc::clone(&state);
    let effect_eq = Rc::clone(&eq);
    create_render_effect(move |_: Option<()>| {
        let new = source();
        let stale: Vec<NodeId> = {
            let state = effect_state.borrow();
            state
                .subscribers
                .iter()
                .filter(|(key, _)| match &state.current {
                    Some(old) => effect_eq(key, old) != effect_eq(key, &new),
                    None => effect_eq(key, &new),
                })
                .flat_map(|(_, nodes)| nodes.iter().copied())
                .collect()
        };
        effect_state.borrow_mut().current = Some(new);
        for node in stale {
            root.mark_node_stale(node);
        }
    });

    KeyedSelector { state, eq, root }
}

impl<K, T> KeyedSelector<K, T>
where
    K: Eq + Hash + Clone + 'static,
{
    /// `true` if `key` is currently a member. When called inside a
    /// computation, the computation is woken only when this key's membership
    /// changes, not on every source change.
    pub fn check(&self, key: &K) -> bool {
        if let Some(reader) = self.root.tracker.get() {
            let mut state = self.state.borrow_mut();
            let entry = state.subscribers.entry(key.clone()).or_default();
            if !entry.contains(&reader) {
                entry.push(reader);
                // The reader clears its slot before every re-run and on
                // dispose, mirroring source re-tracking.
                let unsubscribe_state = Rc::clone(&self.state);
                let key = key.clone();
                on_cleanup(move || {
                    let mut state = unsubscribe_state.borrow_mut();
                    if let Some(nodes) = state.subscribers.get_mut(&key) {
                        nodes.retain(|node| *node != reader);
                        if nodes.is_empty() {
                            state.subscribers.remove(&key);
                        }
                    }
                });
            }
        }
        let state = self.state.borrow();
        match &state.current {
            Some(value) => (self.eq)(key, value),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn only_flipped_keys_re_run() {
        let _ = create_root(|| {
            let selected = create_signal(0usize);
            let is_selected =
                create_keyed_selector(move || selected.get(), |key: &usize, value| key == value);

            let runs: Vec<_> = (0..3).map(|_| Rc::new(Cell::new(0))).collect();
            let memos: Vec<_> = (0..3)
                .map(|i| {
                    let is_selected = is_selected.clone();
                    let runs = Rc::clone(&runs[i]);
                    create_memo(move || {
                        runs.set(runs.get() + 1);
                        is_selected.check(&i)
                    })
                })
                .collect();

            assert_eq!(memos.iter().map(|m| m.get()).collect::<Vec<_>>(), [true, false, false]);
            assert_eq!(runs.iter().map(|r| r.get()).collect::<Vec<_>>(), [1, 1, 1]);

            selected.set(2);
            assert_eq!(memos.iter().map(|m| m.get()).collect::<Vec<_>>(), [false, false, true]);
            // Key 1 never flipped, so its memo never re-ran.
            assert_eq!(runs.iter().map(|r| r.get()).collect::<Vec<_>>(), [2, 1, 2]);
        });
    }

    #[test]
    fn disposed_readers_are_unsubscribed() {
        let _ = create_root(|| {
            let selected = create_signal(0usize);
            let is_selected =
                create_keyed_selector(move || selected.get(), |key: &usize, value| key == value);

            let runs = Rc::new(Cell::new(0));
            let scope = create_child_scope({
                let is_selected = is_selected.clone();
                let runs = Rc::clone(&runs);
                move || {
                    create_memo(move || {
                        runs.set(runs.get() + 1);
                        is_selected.check(&0)
                    });
                }
            });
            assert_eq!(runs.get(), 1);

            scope.dispose();
            selected.set(1);
            assert_eq!(runs.get(), 1);
        });
    }
}
