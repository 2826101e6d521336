//! Fibers: the rendered, mutable form of the element tree.

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

use weft_reactive::NodeHandle;

use crate::instance::InstanceNode;
use crate::runtime_ctx::RenderCtx;
use crate::{ChildAccessor, Element, Props};

/// Shared mutable handle to a fiber. The reconciler mutates fibers in place;
/// reactive boundaries hold their fiber across re-renders.
pub type FiberRef = Rc<RefCell<Fiber>>;

/// What a fiber renders.
pub enum FiberKind {
    /// A leaf with a string tag.
    Tag(Cow<'static, str>),
    /// A mounted function component; holds the element record whose pointer
    /// identity keys reuse.
    Component(Element),
    /// A reactive boundary; holds the accessor whose pointer identity keys
    /// reuse.
    Boundary(ChildAccessor),
    /// A grouping node.
    Fragment,
    /// A text leaf.
    Text(Rc<str>),
    /// Renders nothing.
    Hole,
}

/// The rendered record of an element. Created on first render, preserved
/// across re-renders when identity-matched, torn down when orphaned.
pub struct Fiber {
    /// What this fiber renders.
    pub kind: FiberKind,
    /// Current props (updated in place on positional reuse).
    pub props: Props,
    /// User-supplied key, if any.
    pub key: Option<String>,
    /// Name segments from the root; used for debugging and collision
    /// reporting.
    pub path: Vec<String>,
    /// Rendered children, in order.
    pub children: Vec<FiberRef>,
    /// The reactive scope owning everything this fiber created: a component's
    /// owner, or a boundary's render computation.
    pub owner: Option<NodeHandle>,
    /// The managed instance registered by this component, if any.
    pub instance: Option<Rc<InstanceNode>>,
    /// `true` while the instance is deferred: registered but withheld from
    /// the published set until its props are fully defined.
    pub placeholder: bool,
}

impl Fiber {
    pub(crate) fn new(kind: FiberKind, props: Props, key: Option<String>, path: Vec<String>) -> FiberRef {
        Rc::new(RefCell::new(Fiber {
            kind,
            props,
            key,
            path,
            children: Vec::new(),
            owner: None,
            instance: None,
            placeholder: false,
        }))
    }

    /// The name segment this fiber contributes to paths.
    pub fn name(&self) -> &str {
        if let Some(key) = &self.key {
            return key;
        }
        match &self.kind {
            FiberKind::Tag(tag) => tag,
            FiberKind::Component(el) => match el.kind() {
                crate::ElementKind::Component(component) => component.name(),
                _ => "Component",
            },
            FiberKind::Boundary(_) => "Boundary",
            FiberKind::Fragment => "Fragment",
            FiberKind::Text(_) => "Text",
            FiberKind::Hole => "Hole",
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("path", &self.path.join("/"))
            .field("children", &self.children.len())
            .field("instance", &self.instance.as_ref().map(|node| node.id()))
            .finish()
    }
}

/// Collect the published instances of the fiber tree in document order.
/// Deferred placeholders are skipped.
pub fn collect_instances(fiber: &FiberRef) -> Vec<Rc<InstanceNode>> {
    let mut out = Vec::new();
    collect_into(fiber, &mut out);
    out
}

fn collect_into(fiber: &FiberRef, out: &mut Vec<Rc<InstanceNode>>) {
    let fiber = fiber.borrow();
    if let Some(instance) = &fiber.instance {
        if !fiber.placeholder {
            out.push(Rc::clone(instance));
        }
    }
    for child in &fiber.children {
        collect_into(child, out);
    }
}

/// Tear down an orphaned fiber: dispose its reactive owner (which runs
/// cleanups and disposes owned scopes), release its instance-ID claim, and
/// recurse into its children.
pub fn cleanup_fiber(ctx: &Rc<RenderCtx>, fiber: &FiberRef) {
    let (owner, instance, children) = {
        let mut fiber = fiber.borrow_mut();
        (
            fiber.owner.take(),
            fiber.instance.take(),
            std::mem::take(&mut fiber.children),
        )
    };
    if let Some(instance) = instance {
        ctx.release_id(instance.id());
    }
    if let Some(owner) = owner {
        owner.dispose();
    }
    for child in children {
        cleanup_fiber(ctx, &child);
    }
}
