//! Engine error taxonomy.

use thiserror::Error;

/// Errors surfaced by persistence backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// An I/O failure talking to the store.
    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The stored blob could not be decoded.
    #[error("corrupt state for stack `{stack}`: {message}")]
    Corrupt {
        /// Stack whose blob failed to decode.
        stack: String,
        /// Decoder error text.
        message: String,
    },
    /// Anything else the embedder wants to surface.
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the state machine and scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A resource handler failed. The deployment is marked failed.
    #[error("handler for `{id}` failed: {message}")]
    Handler {
        /// Instance whose handler failed.
        id: String,
        /// The handler's error text.
        message: String,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving: {0:?}")]
    Cycle(Vec<String>),
    /// A runaway cascade exceeded the execution cap.
    #[error("deployment exceeded the handler execution cap")]
    ExecutionCap,
    /// The advisory lock for the stack is held elsewhere.
    #[error("stack `{0}` is locked by another holder")]
    Locked(String),
    /// A reactive computation failed with no boundary to catch it.
    #[error("reactive error: {0}")]
    Reactive(String),
    /// The persistence backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The runtime was disposed while work was pending.
    #[error("runtime disposed")]
    Disposed,
}
