//! Reactive projection of lists with per-item scopes.
//!
//! [`map_keyed`] reuses an item's scope and mapped value as long as its key
//! survives, no matter where the item moved; [`map_indexed`] reuses by
//! position and streams value changes through the item signal.

use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::{
    create_child_scope, create_render_effect, create_signal, create_signal_with, untrack,
    use_current_scope, with_owner, NodeHandle, Signal,
};

struct IndexSlot {
    value: usize,
    signal: Option<Signal<usize>>,
}

/// Handle passed to the map function: access to the item's value and index.
///
/// The map function runs once per item; reactivity flows through the
/// accessors. The index signal is created lazily on first read, so items
/// whose mapper never looks at the index are not woken when they move.
pub struct ItemRef<T: 'static> {
    item: Signal<T>,
    scope: NodeHandle,
    index: Rc<RefCell<IndexSlot>>,
}

impl<T> Clone for ItemRef<T> {
    fn clone(&self) -> Self {
        Self {
            item: self.item,
            scope: self.scope,
            index: Rc::clone(&self.index),
        }
    }
}

impl<T: Clone> ItemRef<T> {
    /// Current item value, tracked.
    pub fn value(&self) -> T {
        self.item.get_clone()
    }

    /// Borrow the current item value, tracked.
    pub fn with_value<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        self.item.with(f)
    }

    /// Current position of the item, tracked.
    pub fn index(&self) -> usize {
        let missing = self.index.borrow().signal.is_none();
        if missing {
            let value = self.index.borrow().value;
            let signal = self.scope.run_in(|| create_signal(value));
            self.index.borrow_mut().signal = Some(signal);
        }
        let signal = self.index.borrow().signal.expect("index signal just created");
        signal.get()
    }
}

struct Entry<K, T: 'static, U> {
    key: K,
    scope: NodeHandle,
    item: Signal<T>,
    index: Rc<RefCell<IndexSlot>>,
    mapped: U,
}

fn create_entry<K, T, U>(
    owner: NodeHandle,
    key: K,
    value: T,
    position: usize,
    map_fn: &Rc<dyn Fn(ItemRef<T>) -> U>,
) -> Entry<K, T, U>
where
    T: PartialEq + 'static,
{
    let slot = Rc::new(RefCell::new(None));
    let scope = with_owner(owner, || {
        create_child_scope({
            let slot = Rc::clone(&slot);
            let map_fn = Rc::clone(map_fn);
            move || {
                let item = create_signal(value);
                let index = Rc::new(RefCell::new(IndexSlot {
                    value: position,
                    signal: None,
                }));
                let item_ref = ItemRef {
                    item,
                    scope: use_current_scope(),
                    index: Rc::clone(&index),
                };
                *slot.borrow_mut() = Some((map_fn(item_ref), item, index));
            }
        })
    });
    let (mapped, item, index) = slot.borrow_mut().take().expect("map function did not run");
    Entry {
        key,
        scope,
        item,
        index,
        mapped,
    }
}

struct FallbackSlot<U> {
    scope: NodeHandle,
    value: U,
}

fn enter_fallback<U: Clone>(
    owner: NodeHandle,
    slot: &mut Option<FallbackSlot<U>>,
    fallback: &Option<Rc<dyn Fn() -> U>>,
) -> Vec<U> {
    match (&slot, fallback) {
        (Some(existing), _) => vec![existing.value.clone()],
        (None, Some(fallback)) => {
            let value = Rc::new(RefCell::new(None));
            let scope = with_owner(owner, || {
                create_child_scope({
                    let value = Rc::clone(&value);
                    let fallback = Rc::clone(fallback);
                    move || *value.borrow_mut() = Some(fallback())
                })
            });
            let value = value.borrow_mut().take().expect("fallback did not run");
            *slot = Some(FallbackSlot {
                scope,
                value: value.clone(),
            });
            vec![value]
        }
        (None, None) => Vec::new(),
    }
}

fn leave_fallback<U>(slot: &mut Option<FallbackSlot<U>>) {
    if let Some(fallback) = slot.take() {
        fallback.scope.dispose();
    }
}

/// Keyed variant of list projection, with an optional fallback rendered while
/// the list is empty.
///
/// See [`map_keyed`] for the semantics.
pub fn map_keyed_with<T, K, U>(
    mut list: impl FnMut() -> Vec<T> + 'static,
    map_fn: impl Fn(ItemRef<T>) -> U + 'static,
    key_fn: impl Fn(&T) -> K + 'static,
    fallback: Option<Rc<dyn Fn() -> U>>,
) -> impl Fn() -> Vec<U>
where
    T: PartialEq + Clone + 'static,
    K: Eq + Hash + Clone + 'static,
    U: Clone + 'static,
{
    let owner = use_current_scope();
    let map_fn: Rc<dyn Fn(ItemRef<T>) -> U> = Rc::new(map_fn);
    let entries: Rc<RefCell<Vec<Entry<K, T, U>>>> = Rc::new(RefCell::new(Vec::new()));
    let fallback_slot: Rc<RefCell<Option<FallbackSlot<U>>>> = Rc::new(RefCell::new(None));
    let out = create_signal_with(Vec::<U>::new(), |_, _| false);

    create_render_effect(move |_: Option<()>| {
        let new_items = list();
        let mapped = untrack(|| {
            let mut entries = entries.borrow_mut();
            if new_items.is_empty() {
                for entry in entries.drain(..) {
                    entry.scope.dispose();
                }
                return enter_fallback(owner, &mut fallback_slot.borrow_mut(), &fallback);
            }
            leave_fallback(&mut fallback_slot.borrow_mut());

            let mut old_by_key: HashMap<K, usize> = HashMap::with_capacity(entries.len());
            for (i, entry) in entries.iter().enumerate() {
                old_by_key.insert(entry.key.clone(), i);
            }
            let mut taken: Vec<Option<Entry<K, T, U>>> =
                entries.drain(..).map(Some).collect();

            let mut new_entries = Vec::with_capacity(new_items.len());
            for (position, item) in new_items.iter().enumerate() {
                let key = key_fn(item);
                let reused = old_by_key
                    .get(&key)
                    .and_then(|&i| taken[i].take())
                    .map(|entry| {
                        // A kept key with a new item flows the item through
                        // its signal; a move updates the index signal only if
                        // the mapper registered for it.
                        entry.item.set(item.clone());
                        let mut slot = entry.index.borrow_mut();
                        slot.value = position;
                        if let Some(signal) = slot.signal {
                            signal.set(position);
                        }
                        drop(slot);
                        entry
                    });
                new_entries.push(match reused {
                    Some(entry) => entry,
                    None => create_entry(owner, key, item.clone(), position, &map_fn),
                });
            }
            for dropped in taken.into_iter().flatten() {
                dropped.scope.dispose();
            }
            let mapped = new_entries.iter().map(|entry| entry.mapped.clone()).collect();
            *entries = new_entries;
            mapped
        });
        out.set(mapped);
    });

    move || out.get_clone()
}

/// Function that maps a reactive `Vec` to another `Vec` through a map
/// function, diffing updates by key so unchanged items keep their scope and
/// mapped output.
///
/// # Params
/// * `list` - Accessor producing the input list; tracked.
/// * `map_fn` - Maps an [`ItemRef`] to the output. Runs once per key.
/// * `key_fn` - Returns a unique key for each entry.
///
/// # Example
/// ```
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let list = create_signal(vec![1, 2, 3]);
/// let mapped = map_keyed(move || list.get_clone(), |item| item.value() * 2, |x| *x);
/// assert_eq!(mapped(), vec![2, 4, 6]);
/// # });
/// ```
pub fn map_keyed<T, K, U>(
    list: impl FnMut() -> Vec<T> + 'static,
    map_fn: impl Fn(ItemRef<T>) -> U + 'static,
    key_fn: impl Fn(&T) -> K + 'static,
) -> impl Fn() -> Vec<U>
where
    T: PartialEq + Clone + 'static,
    K: Eq + Hash + Clone + 'static,
    U: Clone + 'static,
{
    map_keyed_with(list, map_fn, key_fn, None)
}

/// Positional variant of list projection, with an optional fallback rendered
/// while the list is empty. See [`map_indexed`].
pub fn map_indexed_with<T, U>(
    mut list: impl FnMut() -> Vec<T> + 'static,
    map_fn: impl Fn(ItemRef<T>) -> U + 'static,
    fallback: Option<Rc<dyn Fn() -> U>>,
) -> impl Fn() -> Vec<U>
where
    T: PartialEq + Clone + 'static,
    U: Clone + 'static,
{
    let owner = use_current_scope();
    let map_fn: Rc<dyn Fn(ItemRef<T>) -> U> = Rc::new(map_fn);
    let entries: Rc<RefCell<Vec<Entry<(), T, U>>>> = Rc::new(RefCell::new(Vec::new()));
    let fallback_slot: Rc<RefCell<Option<FallbackSlot<U>>>> = Rc::new(RefCell::new(None));
    let out = create_signal_with(Vec::<U>::new(), |_, _| false);

    create_render_effect(move |_: Option<()>| {
        let new_items = list();
        let mapped = untrack(|| {
            let mut entries = entries.borrow_mut();
            if new_items.is_empty() {
                for entry in entries.drain(..) {
                    entry.scope.dispose();
                }
                return enter_fallback(owner, &mut fallback_slot.borrow_mut(), &fallback);
            }
            leave_fallback(&mut fallback_slot.borrow_mut());

            for (position, item) in new_items.iter().enumerate() {
                if position < entries.len() {
                    // The scope is positional; the new value flows through
                    // the item signal (a no-op when equal).
                    entries[position].item.set(item.clone());
                } else {
                    entries.push(create_entry(owner, (), item.clone(), position, &map_fn));
                }
            }
            for dropped in entries.drain(new_items.len()..) {
                dropped.scope.dispose();
            }
            entries.iter().map(|entry| entry.mapped.clone()).collect()
        });
        out.set(mapped);
    });

    move || out.get_clone()
}

/// Function that maps a reactive `Vec` to another `Vec` through a map
/// function, diffing updates by position. Prefer [`map_keyed`] when a stable
/// key is available.
pub fn map_indexed<T, U>(
    list: impl FnMut() -> Vec<T> + 'static,
    map_fn: impl Fn(ItemRef<T>) -> U + 'static,
) -> impl Fn() -> Vec<U>
where
    T: PartialEq + Clone + 'static,
    U: Clone + 'static,
{
    map_indexed_with(list, map_fn, None)
}
