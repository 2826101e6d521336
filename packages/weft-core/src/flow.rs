//! Control-flow components.
//!
//! All four builders produce elements whose component returns an accessor
//! child, so the fiber layer mounts them as reactive boundaries: the
//! condition (or list) drives in-place re-renders while untouched children
//! keep their fibers and scopes.

use std::rc::Rc;

use weft_reactive::{
    create_memo, create_memo_with, create_signal_with, map_indexed_with, map_keyed_with, on_error,
    untrack, ItemRef, ScopeError,
};

use crate::element::component_fn;
use crate::{Child, ComponentFn, Element, Value, ValueAccessor};

enum WhenBody {
    Static(Child),
    WithValue(Rc<dyn Fn(ValueAccessor) -> Child>),
}

/// Conditional rendering.
///
/// The condition is wrapped in a memo; a second memo tracks only its
/// truthiness, so a condition changing value without changing truthiness
/// never re-renders the children. The function-children form receives an
/// accessor to the condition's value instead.
///
/// ```
/// # use weft_core::*;
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let show = create_signal(false);
/// let el = when(move || Value::Bool(show.get()))
///     .child("visible")
///     .fallback("hidden")
///     .build();
/// # });
/// ```
pub fn when(condition: impl Fn() -> Value + 'static) -> When {
    When {
        condition: Rc::new(condition),
        body: WhenBody::Static(Child::Hole),
        fallback: None,
    }
}

/// Builder returned by [`when`].
pub struct When {
    condition: Rc<dyn Fn() -> Value>,
    body: WhenBody,
    fallback: Option<Child>,
}

impl When {
    /// Children rendered while the condition is truthy.
    pub fn child(mut self, child: impl Into<Child>) -> Self {
        self.body = WhenBody::Static(child.into());
        self
    }

    /// Function children: invoked untracked with an accessor to the
    /// condition's value, so consumers can follow value changes without the
    /// subtree being recreated.
    pub fn with_value(mut self, f: impl Fn(ValueAccessor) -> Child + 'static) -> Self {
        self.body = WhenBody::WithValue(Rc::new(f));
        self
    }

    /// Children rendered while the condition is falsy.
    pub fn fallback(mut self, child: impl Into<Child>) -> Self {
        self.fallback = Some(child.into());
        self
    }

    /// Finish the element.
    pub fn build(self) -> Element {
        let When {
            condition,
            body,
            fallback,
        } = self;
        let body = Rc::new(body);
        component_fn(ComponentFn::new("When", move |_, _| {
            let condition = Rc::clone(&condition);
            let value = create_memo_with(move || condition(), Value::eq);
            let truthy = create_memo_with(
                move || value.get_clone(),
                |a: &Value, b: &Value| a.truthy() == b.truthy(),
            );
            let body = Rc::clone(&body);
            let fallback = fallback.clone();
            Child::accessor(move || {
                if truthy.get_clone().truthy() {
                    match &*body {
                        WhenBody::Static(child) => child.clone(),
                        WhenBody::WithValue(f) => {
                            let accessor: ValueAccessor = Rc::new(move || value.get_clone());
                            untrack(|| f(accessor))
                        }
                    }
                } else {
                    fallback.clone().unwrap_or(Child::Hole)
                }
            })
        }))
        .build()
    }
}

/// Multi-arm conditional: arms are scanned in order, the first truthy arm
/// renders, else the fallback.
///
/// ```
/// # use weft_core::*;
/// # use weft_reactive::*;
/// # let _ = create_root(|| {
/// let status = create_signal("ready");
/// let el = match_arms()
///     .arm(move || Value::Bool(status.get() == "ready"), "go")
///     .arm(move || Value::Bool(status.get() == "failed"), "stop")
///     .fallback("wait")
///     .build();
/// # });
/// ```
pub fn match_arms() -> Match {
    Match {
        arms: Vec::new(),
        fallback: None,
    }
}

/// Builder returned by [`match_arms`].
pub struct Match {
    arms: Vec<(Rc<dyn Fn() -> Value>, Child)>,
    fallback: Option<Child>,
}

impl Match {
    /// Add an arm.
    pub fn arm(mut self, condition: impl Fn() -> Value + 'static, child: impl Into<Child>) -> Self {
        self.arms.push((Rc::new(condition), child.into()));
        self
    }

    /// Children rendered when no arm matches.
    pub fn fallback(mut self, child: impl Into<Child>) -> Self {
        self.fallback = Some(child.into());
        self
    }

    /// Finish the element.
    pub fn build(self) -> Element {
        let Match { arms, fallback } = self;
        let arms = Rc::new(arms);
        component_fn(ComponentFn::new("Match", move |_, _| {
            let scan = Rc::clone(&arms);
            let selected = create_memo(move || {
                scan.iter()
                    .position(|(condition, _)| condition().truthy())
            });
            let arms = Rc::clone(&arms);
            let fallback = fallback.clone();
            Child::accessor(move || match selected.get() {
                Some(index) => arms[index].1.clone(),
                None => fallback.clone().unwrap_or(Child::Hole),
            })
        }))
        .build()
    }
}

/// Keyed or positional list rendering over the list reconciler.
///
/// With a key function, items keep their mapped subtree (and therefore their
/// component state and instances) across reorderings; without one, reuse is
/// positional.
pub fn each<T: PartialEq + Clone + 'static>(items: impl Fn() -> Vec<T> + 'static) -> Each<T> {
    Each {
        items: Rc::new(items),
        view: None,
        key: None,
        fallback: None,
    }
}

/// Builder returned by [`each`].
pub struct Each<T: 'static> {
    items: Rc<dyn Fn() -> Vec<T>>,
    view: Option<Rc<dyn Fn(ItemRef<T>) -> Child>>,
    key: Option<Rc<dyn Fn(&T) -> String>>,
    fallback: Option<Child>,
}

impl<T: PartialEq + Clone + 'static> Each<T> {
    /// How to render one item.
    pub fn view(mut self, view: impl Fn(ItemRef<T>) -> Child + 'static) -> Self {
        self.view = Some(Rc::new(view));
        self
    }

    /// Key function enabling identity-preserving reuse across reorderings.
    pub fn key(mut self, key: impl Fn(&T) -> String + 'static) -> Self {
        self.key = Some(Rc::new(key));
        self
    }

    /// Children rendered while the list is empty.
    pub fn fallback(mut self, child: impl Into<Child>) -> Self {
        self.fallback = Some(child.into());
        self
    }

    /// Finish the element.
    pub fn build(self) -> Element {
        let Each {
            items,
            view,
            key,
            fallback,
        } = self;
        let view = view.expect("each(..) requires a view function");
        component_fn(ComponentFn::new("Each", move |_, _| {
            let items = Rc::clone(&items);
            let view = Rc::clone(&view);
            let fallback = fallback.clone().map(|child| {
                let f: Rc<dyn Fn() -> Child> = Rc::new(move || child.clone());
                f
            });
            let mapped: Rc<dyn Fn() -> Vec<Child>> = match &key {
                Some(key) => {
                    let key = Rc::clone(key);
                    Rc::new(map_keyed_with(
                        move || items(),
                        move |item| view(item),
                        move |item| key(item),
                        fallback,
                    ))
                }
                None => Rc::new(map_indexed_with(
                    move || items(),
                    move |item| view(item),
                    fallback,
                )),
            };
            Child::accessor(move || Child::List(mapped()))
        }))
        .build()
    }
}

/// Error boundary: renders its children until a descendant computation
/// throws, then renders the fallback with the error and a reset callback.
pub fn error_boundary(
    children: impl Into<Child>,
    fallback: impl Fn(ScopeError, Rc<dyn Fn()>) -> Child + 'static,
) -> Element {
    let children = children.into();
    let fallback: Rc<dyn Fn(ScopeError, Rc<dyn Fn()>) -> Child> = Rc::new(fallback);
    component_fn(ComponentFn::new("ErrorBoundary", move |_, _| {
        // Any `Some` write must notify, even for the same error value.
        let error = create_signal_with(None::<ScopeError>, |a, b| a.is_none() && b.is_none());
        on_error(move |err| error.set(Some(err)));
        let reset: Rc<dyn Fn()> = Rc::new(move || error.set(None));
        let children = children.clone();
        let fallback = Rc::clone(&fallback);
        Child::accessor(move || match error.get_clone() {
            Some(err) => fallback(err, Rc::clone(&reset)),
            None => children.clone(),
        })
    }))
    .build()
}
