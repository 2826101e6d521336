//! Element-to-fiber rendering and in-place reconciliation.
//!
//! Function components execute exactly once; zero-arg accessor children
//! become reactive-boundary fibers whose children are re-rendered in place by
//! a render computation. Reconciliation preserves child identity three ways,
//! in priority order: accessor pointer identity, element record identity,
//! positional same-kind reuse.

use std::rc::Rc;

use hashbrown::HashMap;
use weft_reactive::{create_render_effect, untrack, use_current_scope, with_owner};

use crate::fiber::{cleanup_fiber, Fiber, FiberKind, FiberRef};
use crate::runtime_ctx::RenderCtx;
use crate::{Child, Element, ElementKind};

/// Render an element tree into a fresh fiber tree.
///
/// Must run inside a reactive scope: boundary computations and component
/// effects attach to the current owner. The context's ownership map is reset,
/// as a new pass re-claims every instance ID.
pub fn render_root(ctx: &Rc<RenderCtx>, element: Element) -> FiberRef {
    ctx.clear_ownership();
    let _guard = RenderCtx::enter(ctx);
    let root = Fiber::new(FiberKind::Fragment, Default::default(), None, Vec::new());
    set_children(ctx, &root, Child::Element(element));
    root
}

/// Reconcile `value` against the fiber's current children, reusing fibers by
/// identity or position and tearing down the rest.
pub fn set_children(ctx: &Rc<RenderCtx>, parent: &FiberRef, value: Child) {
    let old_children = std::mem::take(&mut parent.borrow_mut().children);
    let parent_path = parent.borrow().path.clone();

    // Identity maps over the old children: accessor pointer for boundaries,
    // element record pointer for components.
    let mut by_accessor: HashMap<*const (), usize> = HashMap::new();
    let mut by_element: HashMap<*const (), usize> = HashMap::new();
    for (index, child) in old_children.iter().enumerate() {
        match &child.borrow().kind {
            FiberKind::Boundary(accessor) => {
                by_accessor.insert(Rc::as_ptr(accessor) as *const (), index);
            }
            FiberKind::Component(element) => {
                by_element.insert(element.identity(), index);
            }
            _ => {}
        }
    }

    let news: Vec<Child> = match value {
        Child::List(list) => list,
        other => vec![other],
    };
    let mut used = vec![false; old_children.len()];
    let mut new_children = Vec::with_capacity(news.len());

    for (position, child) in news.into_iter().enumerate() {
        let positional = old_children
            .get(position)
            .filter(|_| !used.get(position).copied().unwrap_or(true));
        let fiber = match child {
            Child::Accessor(accessor) => {
                let identity = Rc::as_ptr(&accessor) as *const ();
                match by_accessor.get(&identity).copied().filter(|&i| !used[i]) {
                    Some(index) => {
                        // The existing render computation keeps driving it.
                        used[index] = true;
                        old_children[index].clone()
                    }
                    None => create_boundary(ctx, accessor, &parent_path),
                }
            }
            Child::Element(element) => match element.kind() {
                ElementKind::Component(_) => {
                    match by_element.get(&element.identity()).copied().filter(|&i| !used[i]) {
                        Some(index) => {
                            // Same record: keep the scope, the instance, the
                            // whole subtree.
                            used[index] = true;
                            old_children[index].clone()
                        }
                        None => run_component(ctx, element.clone(), &parent_path),
                    }
                }
                ElementKind::Tag(tag) => {
                    let reusable = positional.filter(|old| {
                        matches!(&old.borrow().kind, FiberKind::Tag(existing) if existing == tag)
                    });
                    match reusable {
                        Some(old) => {
                            used[position] = true;
                            old.borrow_mut().props = element.props().clone();
                            set_children(ctx, old, element.children().clone());
                            old.clone()
                        }
                        None => create_tag(ctx, &element, &parent_path),
                    }
                }
                ElementKind::Fragment => {
                    let reusable = positional
                        .filter(|old| matches!(&old.borrow().kind, FiberKind::Fragment));
                    match reusable {
                        Some(old) => {
                            used[position] = true;
                            set_children(ctx, old, element.children().clone());
                            old.clone()
                        }
                        None => create_fragment(ctx, element.children().clone(), &parent_path),
                    }
                }
            },
            Child::List(list) => {
                let reusable =
                    positional.filter(|old| matches!(&old.borrow().kind, FiberKind::Fragment));
                match reusable {
                    Some(old) => {
                        used[position] = true;
                        set_children(ctx, old, Child::List(list));
                        old.clone()
                    }
                    None => create_fragment(ctx, Child::List(list), &parent_path),
                }
            }
            Child::Text(text) => {
                let reusable =
                    positional.filter(|old| matches!(&old.borrow().kind, FiberKind::Text(_)));
                match reusable {
                    Some(old) => {
                        used[position] = true;
                        old.borrow_mut().kind = FiberKind::Text(text);
                        old.clone()
                    }
                    None => {
                        let mut path = parent_path.clone();
                        path.push("Text".to_string());
                        Fiber::new(FiberKind::Text(text), Default::default(), None, path)
                    }
                }
            }
            Child::Hole => {
                let reusable =
                    positional.filter(|old| matches!(&old.borrow().kind, FiberKind::Hole));
                match reusable {
                    Some(old) => {
                        used[position] = true;
                        old.clone()
                    }
                    None => {
                        let mut path = parent_path.clone();
                        path.push("Hole".to_string());
                        Fiber::new(FiberKind::Hole, Default::default(), None, path)
                    }
                }
            }
        };
        new_children.push(fiber);
    }

    for (index, old) in old_children.iter().enumerate() {
        if !used[index] {
            cleanup_fiber(ctx, old);
        }
    }
    parent.borrow_mut().children = new_children;
}

fn child_path(parent_path: &[String], name: &str, key: Option<&str>) -> Vec<String> {
    let mut path = parent_path.to_vec();
    path.push(key.unwrap_or(name).to_string());
    path
}

fn create_tag(ctx: &Rc<RenderCtx>, element: &Element, parent_path: &[String]) -> FiberRef {
    let ElementKind::Tag(tag) = element.kind() else {
        unreachable!("create_tag requires a tag element");
    };
    let path = child_path(parent_path, tag, element.key());
    let fiber = Fiber::new(
        FiberKind::Tag(tag.clone()),
        element.props().clone(),
        element.key().map(String::from),
        path,
    );
    set_children(ctx, &fiber, element.children().clone());
    fiber
}

fn create_fragment(ctx: &Rc<RenderCtx>, children: Child, parent_path: &[String]) -> FiberRef {
    let path = child_path(parent_path, "Fragment", None);
    let fiber = Fiber::new(FiberKind::Fragment, Default::default(), None, path);
    set_children(ctx, &fiber, children);
    fiber
}

/// Execute a function component: fresh owner, exactly one call, children from
/// the returned value. The resource-path segment the component may have
/// pushed while registering an instance stays visible to its children and is
/// popped afterwards.
fn run_component(ctx: &Rc<RenderCtx>, element: Element, parent_path: &[String]) -> FiberRef {
    let ElementKind::Component(component) = element.kind() else {
        unreachable!("run_component requires a component element");
    };
    let component = component.clone();
    let path = child_path(parent_path, component.name(), element.key());
    let fiber = Fiber::new(
        FiberKind::Component(element.clone()),
        element.props().clone(),
        element.key().map(String::from),
        path,
    );

    let base_len = ctx.resource_path_len();
    let previous_fiber = ctx.swap_current_fiber(Some(fiber.clone()));
    let owner = weft_reactive::create_child_scope(|| {
        let result = untrack(|| component.call(element.props().clone(), element.children().clone()));
        if result.is_hole() {
            tracing::warn!(
                component = component.name(),
                "component rendered nothing; conditional rendering usually belongs in `when`"
            );
        }
        set_children(ctx, &fiber, result);
    });
    fiber.borrow_mut().owner = Some(owner);
    ctx.swap_current_fiber(previous_fiber);
    ctx.truncate_resource_path(base_len);
    fiber
}

/// Mount a reactive boundary: capture the owner and resource path, then
/// register a render computation that re-renders the boundary's children in
/// place on every change of the accessor's reads.
fn create_boundary(
    ctx: &Rc<RenderCtx>,
    accessor: crate::ChildAccessor,
    parent_path: &[String],
) -> FiberRef {
    let path = child_path(parent_path, "Boundary", None);
    let fiber = Fiber::new(
        FiberKind::Boundary(accessor.clone()),
        Default::default(),
        None,
        path,
    );

    let captured_owner = use_current_scope();
    let captured_path = ctx.resource_path_snapshot();
    let ctx = Rc::clone(ctx);
    let boundary = fiber.clone();
    let computation = create_render_effect(move |_: Option<()>| {
        // Track whatever the accessor reads; everything below is untracked.
        let value = accessor();
        let _guard = RenderCtx::enter(&ctx);
        let saved_path = ctx.swap_resource_path(captured_path.clone());
        // New fibers attach their scopes to the captured owner, not to this
        // computation: reused children must survive the next re-run.
        untrack(|| with_owner(captured_owner, || set_children(&ctx, &boundary, value)));
        ctx.swap_resource_path(saved_path);
    });
    fiber.borrow_mut().owner = Some(computation);
    fiber
}
