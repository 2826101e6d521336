//! Element tree, fiber reconciler, and managed-instance registry for Weft.
//!
//! User code builds a tree of [`Element`] records; [`render_root`] turns it
//! into a fiber tree, executing each component once and mounting reactive
//! boundaries for accessor children. Components declare managed resources
//! with [`use_async_output`]; the published instance set is collected from
//! the fiber tree and handed to the deployment scheduler.

#![warn(missing_docs)]

mod element;
mod fiber;
mod flow;
mod instance;
mod render;
mod runtime_ctx;
mod value;

pub use element::*;
pub use fiber::{cleanup_fiber, collect_instances, Fiber, FiberKind, FiberRef};
pub use flow::*;
pub use instance::*;
pub use render::{render_root, set_children};
pub use runtime_ctx::{RenderCtx, RenderCtxGuard};
pub use value::*;
