//! Immutable element records.
//!
//! Elements are what user code builds and what the fiber reconciler
//! consumes. An [`Element`] is a cheaply clonable `Rc` record; its pointer
//! identity is what lets the reconciler preserve component state across list
//! reorderings.

use std::borrow::Cow;
use std::rc::Rc;

use crate::{Props, Value};

/// A function component: a name (used for instance IDs and debugging) plus
/// the render function, run exactly once per mounted fiber.
#[derive(Clone)]
pub struct ComponentFn {
    name: &'static str,
    f: Rc<dyn Fn(Props, Child) -> Child>,
}

impl ComponentFn {
    /// Wrap a render function under a name.
    pub fn new(name: &'static str, f: impl Fn(Props, Child) -> Child + 'static) -> Self {
        Self { name, f: Rc::new(f) }
    }

    /// The component's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Execute the component with the given props and children.
    pub fn call(&self, props: Props, children: Child) -> Child {
        (self.f)(props, children)
    }
}

impl std::fmt::Debug for ComponentFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFn").field("name", &self.name).finish()
    }
}

/// What an element renders as.
#[derive(Clone, Debug)]
pub enum ElementKind {
    /// A leaf with a string tag.
    Tag(Cow<'static, str>),
    /// A function component.
    Component(ComponentFn),
    /// A grouping node with no semantics of its own.
    Fragment,
}

struct ElementInner {
    kind: ElementKind,
    props: Props,
    key: Option<String>,
    children: Child,
}

/// An immutable element record. Cloning shares the record; the shared
/// identity keys reconciliation.
#[derive(Clone)]
pub struct Element(Rc<ElementInner>);

impl Element {
    /// Build an element directly. Usually [`component`] or [`tag`] builders
    /// are more convenient.
    pub fn new(kind: ElementKind, props: Props, key: Option<String>, children: Child) -> Self {
        Self(Rc::new(ElementInner {
            kind,
            props,
            key,
            children,
        }))
    }

    /// The element's kind.
    pub fn kind(&self) -> &ElementKind {
        &self.0.kind
    }

    /// The element's props.
    pub fn props(&self) -> &Props {
        &self.0.props
    }

    /// The user-supplied key, if any.
    pub fn key(&self) -> Option<&str> {
        self.0.key.as_deref()
    }

    /// The element's children.
    pub fn children(&self) -> &Child {
        &self.0.children
    }

    /// A copy of this element with a different key. The copy is a fresh
    /// record; used by the runtime to inject the stack name at the root.
    pub fn with_key(&self, key: impl Into<String>) -> Element {
        Self(Rc::new(ElementInner {
            kind: self.0.kind.clone(),
            props: self.0.props.clone(),
            key: Some(key.into()),
            children: self.0.children.clone(),
        }))
    }

    /// Record identity.
    pub fn ptr_eq(a: &Element, b: &Element) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn identity(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("kind", &self.0.kind)
            .field("key", &self.0.key)
            .finish()
    }
}

/// A zero-arg function producing children; rendered as a reactive boundary
/// whose children re-render in place when its reads change.
pub type ChildAccessor = Rc<dyn Fn() -> Child>;

/// Anything an element can have as a child.
#[derive(Clone)]
pub enum Child {
    /// A nested element.
    Element(Element),
    /// Several children; rendered as a fragment fiber.
    List(Vec<Child>),
    /// A text leaf.
    Text(Rc<str>),
    /// Renders nothing.
    Hole,
    /// A reactive boundary driven by the accessor.
    Accessor(ChildAccessor),
}

impl Child {
    /// Build an accessor child from a closure.
    pub fn accessor(f: impl Fn() -> Child + 'static) -> Self {
        Child::Accessor(Rc::new(f))
    }

    /// `true` if this is the hole.
    pub fn is_hole(&self) -> bool {
        matches!(self, Child::Hole)
    }

    pub(crate) fn accessor_identity(&self) -> Option<*const ()> {
        match self {
            Child::Accessor(f) => Some(Rc::as_ptr(f) as *const ()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Child::Element(el) => el.fmt(f),
            Child::List(list) => list.fmt(f),
            Child::Text(text) => text.fmt(f),
            Child::Hole => f.write_str("Hole"),
            Child::Accessor(_) => f.write_str("<accessor>"),
        }
    }
}

impl Default for Child {
    fn default() -> Self {
        Child::Hole
    }
}

impl From<Element> for Child {
    fn from(el: Element) -> Self {
        Child::Element(el)
    }
}
impl From<Vec<Child>> for Child {
    fn from(list: Vec<Child>) -> Self {
        Child::List(list)
    }
}
impl From<&str> for Child {
    fn from(text: &str) -> Self {
        Child::Text(Rc::from(text))
    }
}
impl From<String> for Child {
    fn from(text: String) -> Self {
        Child::Text(Rc::from(text.as_str()))
    }
}
impl From<()> for Child {
    fn from(_: ()) -> Self {
        Child::Hole
    }
}
impl<T: Into<Child>> From<Option<T>> for Child {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(child) => child.into(),
            None => Child::Hole,
        }
    }
}

/// Builder for an [`Element`].
pub struct ElementBuilder {
    kind: ElementKind,
    props: Props,
    key: Option<String>,
    children: Vec<Child>,
}

impl ElementBuilder {
    fn new(kind: ElementKind) -> Self {
        Self {
            kind,
            props: Props::new(),
            key: None,
            children: Vec::new(),
        }
    }

    /// Set a single prop.
    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key, value);
        self
    }

    /// Replace the whole prop set.
    pub fn props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Set the element key. Required on any component that registers a
    /// managed instance.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append one child.
    pub fn child(mut self, child: impl Into<Child>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Append several children.
    pub fn children(mut self, children: impl IntoIterator<Item = Child>) -> Self {
        self.children.extend(children);
        self
    }

    /// Finish the element.
    pub fn build(self) -> Element {
        let children = match self.children.len() {
            0 => Child::Hole,
            1 => self.children.into_iter().next().unwrap_or_default(),
            _ => Child::List(self.children),
        };
        Element::new(self.kind, self.props, self.key, children)
    }
}

/// Start building a component element.
///
/// ```
/// # use weft_core::{component, Child};
/// let el = component("Banner", |props, _children| {
///     Child::from(format!("hello {:?}", props.get("name")))
/// })
/// .prop("name", "weft")
/// .build();
/// ```
pub fn component(
    name: &'static str,
    f: impl Fn(Props, Child) -> Child + 'static,
) -> ElementBuilder {
    ElementBuilder::new(ElementKind::Component(ComponentFn::new(name, f)))
}

/// Start building a component element from an existing [`ComponentFn`].
pub fn component_fn(f: ComponentFn) -> ElementBuilder {
    ElementBuilder::new(ElementKind::Component(f))
}

/// Start building a leaf tag element.
pub fn tag(name: impl Into<Cow<'static, str>>) -> ElementBuilder {
    ElementBuilder::new(ElementKind::Tag(name.into()))
}

/// Start building a fragment element.
pub fn fragment() -> ElementBuilder {
    ElementBuilder::new(ElementKind::Fragment)
}
