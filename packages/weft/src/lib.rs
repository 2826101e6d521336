//! A reactive declarative runtime for long-lived resources.
//!
//! A program describes what should exist as a tree of components; each
//! component may declare one managed instance with an async setup handler
//! and optional cleanup. The runtime renders the tree, orders instances by
//! output provenance, runs their handlers concurrently with cascading
//! discovery, and persists outputs for crash recovery.
//!
//! ```no_run
//! use std::rc::Rc;
//! use weft::prelude::*;
//!
//! # async fn demo() {
//! let app = || {
//!     component("Server", |props, _| {
//!         use_async_output(
//!             props,
//!             handler(|_props, outputs| async move {
//!                 outputs.set([("url".to_string(), Value::str("https://made"))]);
//!                 Ok(None)
//!             }),
//!         );
//!         Child::Hole
//!     })
//!     .key("web")
//!     .build()
//! };
//!
//! let backend = Rc::new(MemoryBackend::new());
//! let handle = render(app, backend, "prod", RenderOptions::default());
//! handle.ready().await.unwrap();
//! # }
//! ```

#![warn(missing_docs)]

mod runtime;

pub use runtime::{render, reset_runtimes, runtime_count, RenderOptions, RuntimeHandle};

pub use weft_core;
pub use weft_engine;
pub use weft_reactive;

/// The common imports for building and running a resource tree.
pub mod prelude {
    pub use crate::{render, reset_runtimes, runtime_count, RenderOptions, RuntimeHandle};
    pub use weft_core::{
        component, each, error_boundary, fragment, handler, match_arms, props, tag, use_async_output,
        when, Child, Cleanup, Element, Handler, HandlerError, HandlerResult, Outputs, Props,
        PropsSource, Value,
    };
    pub use weft_engine::{
        Backend, DeploymentState, DeploymentStatus, EngineError, JsonFileBackend, MemoryBackend,
        NodeRecord, ResourceState,
    };
    pub use weft_reactive::{
        batch, create_effect, create_memo, create_signal, on, on_cleanup, on_deferred, untrack,
        Signal,
    };
}
