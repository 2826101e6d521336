//! The runtime façade: wiring the reactive graph, the fiber tree, and the
//! deployment scheduler into one long-lived handle.
//!
//! [`render`] builds the element tree inside a fresh reactive root, loads
//! and hydrates any persisted state, renders, and runs the initial apply.
//! Afterwards every reactive flush re-collects the instance set: a changed
//! set schedules another apply; an unchanged set with possibly-new outputs
//! arms a debounced save.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use weft_core::{cleanup_fiber, collect_instances, Element, FiberRef, RenderCtx};
use weft_engine::{
    AuditEntry, Backend, CollectFn, EngineError, LookupFn, NodeRecord, Scheduler, StateMachine,
};
use weft_reactive::{create_root, RootHandle};

/// Tuning knobs for [`render`].
#[derive(Clone)]
pub struct RenderOptions {
    /// Operator identity recorded in persisted state and audit entries.
    pub user: Option<String>,
    /// TTL requested for the advisory stack lock.
    pub lock_ttl: Duration,
    /// Quiet period before output-only changes are persisted.
    pub save_debounce: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            user: None,
            lock_ttl: Duration::from_secs(60),
            save_debounce: Duration::from_millis(100),
        }
    }
}

enum ReadyState {
    Pending,
    Done(Result<(), Rc<EngineError>>),
}

struct RuntimeShared {
    stack: String,
    options: RenderOptions,
    root: RootHandle,
    ctx: Rc<RenderCtx>,
    machine: Rc<StateMachine>,
    scheduler: Scheduler,
    tree: Rc<RefCell<Option<FiberRef>>>,
    last_applied: RefCell<Vec<NodeRecord>>,
    applying: Cell<bool>,
    pending_flush: Cell<bool>,
    disposed: Rc<Cell<bool>>,
    debounce: RefCell<Option<tokio::task::JoinHandle<()>>>,
    debounce_pending: Cell<bool>,
    ready: RefCell<ReadyState>,
    error: RefCell<Option<Rc<EngineError>>>,
    notify: Rc<Notify>,
}

thread_local! {
    static RUNTIMES: RefCell<Vec<Weak<RuntimeShared>>> = const { RefCell::new(Vec::new()) };
}

/// Handle to a running Weft runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Rc<RuntimeShared>,
}

/// Start a runtime: build the element tree from `f`, hydrate persisted state
/// for `stack`, render, and run the initial deployment in a background task.
///
/// Must be called on a thread driving a `tokio` current-thread runtime
/// inside a `LocalSet`: handlers, cascades, and the debounced save all run
/// as local tasks.
pub fn render(
    f: impl FnOnce() -> Element + 'static,
    backend: Rc<dyn Backend>,
    stack: impl Into<String>,
    options: RenderOptions,
) -> RuntimeHandle {
    let stack = stack.into();
    let root = create_root(|| {});
    let ctx = RenderCtx::new();
    ctx.set_signal_owner(root.root_scope());
    let machine = StateMachine::new(backend, options.user.clone());

    let tree: Rc<RefCell<Option<FiberRef>>> = Rc::new(RefCell::new(None));
    let disposed = Rc::new(Cell::new(false));
    let collect: CollectFn = {
        let tree = Rc::clone(&tree);
        Rc::new(move || match &*tree.borrow() {
            Some(tree) => collect_instances(tree),
            None => Vec::new(),
        })
    };
    let lookup: LookupFn = {
        let ctx = Rc::clone(&ctx);
        Rc::new(move |id: &str| ctx.get_instance(id))
    };
    let scheduler = Scheduler::new(
        stack.clone(),
        Rc::clone(&machine),
        Rc::clone(&collect),
        lookup,
        Rc::clone(&disposed),
    );

    let shared = Rc::new(RuntimeShared {
        stack,
        options,
        root,
        ctx,
        machine,
        scheduler,
        tree,
        last_applied: RefCell::new(Vec::new()),
        applying: Cell::new(false),
        pending_flush: Cell::new(false),
        disposed,
        debounce: RefCell::new(None),
        debounce_pending: Cell::new(false),
        ready: RefCell::new(ReadyState::Pending),
        error: RefCell::new(None),
        notify: Rc::new(Notify::new()),
    });

    {
        let weak = Rc::downgrade(&shared);
        shared.root.set_on_flush(Some(Rc::new(move || {
            if let Some(shared) = weak.upgrade() {
                on_flush(&shared);
            }
        })));
    }
    RUNTIMES.with(|runtimes| runtimes.borrow_mut().push(Rc::downgrade(&shared)));

    {
        let shared = Rc::clone(&shared);
        tokio::task::spawn_local(async move {
            let result = run(&shared, f).await.map_err(Rc::new);
            if let Err(err) = &result {
                *shared.error.borrow_mut() = Some(Rc::clone(err));
                tracing::error!(stack = %shared.stack, error = %err, "initial deployment failed");
            }
            *shared.ready.borrow_mut() = ReadyState::Done(result);
            shared.notify.notify_waiters();
        });
    }

    RuntimeHandle { shared }
}

async fn run(
    shared: &Rc<RuntimeShared>,
    f: impl FnOnce() -> Element + 'static,
) -> Result<(), EngineError> {
    let stack = shared.stack.clone();
    let holder = shared
        .options
        .user
        .clone()
        .unwrap_or_else(|| "weft".to_string());
    if !shared
        .machine
        .acquire_lock(&stack, &holder, shared.options.lock_ttl)
        .await?
    {
        return Err(EngineError::Locked(stack));
    }

    let state = shared.machine.backend().get_state(&stack).await?;
    if let Some(state) = &state {
        if state.status == weft_engine::DeploymentStatus::Applying {
            tracing::info!(
                stack = %stack,
                applying = ?state.applying_node_ids,
                "resuming interrupted deployment"
            );
        }
    }
    let previous = state.map(|state| state.nodes).unwrap_or_default();
    shared.machine.rehydrate(&previous);
    for record in &previous {
        if !record.outputs.is_empty() {
            shared
                .ctx
                .seed_hydration(record.id.clone(), record.outputs.clone());
        }
    }

    // Build and render inside the root scope: signals the user creates at
    // build time live exactly as long as the runtime.
    let element = shared.root.run_in(f).with_key(&stack);
    let tree = {
        let ctx = Rc::clone(&shared.ctx);
        shared.root.run_in(|| weft_core::render_root(&ctx, element))
    };
    *shared.tree.borrow_mut() = Some(tree);

    shared.applying.set(true);
    let result = shared.scheduler.apply_changes(previous, true).await;
    shared.applying.set(false);
    let records = result?;
    *shared.last_applied.borrow_mut() = records;

    if shared.pending_flush.get()
        && current_fingerprints(shared) != fingerprints(&shared.last_applied.borrow())
    {
        shared.applying.set(true);
        apply_loop(Rc::clone(shared)).await;
    } else {
        shared.pending_flush.set(false);
    }
    Ok(())
}

fn fingerprints(records: &[NodeRecord]) -> Vec<(String, weft_core::Props)> {
    records
        .iter()
        .map(|record| (record.id.clone(), record.props.clone()))
        .collect()
}

fn current_fingerprints(shared: &RuntimeShared) -> Vec<(String, weft_core::Props)> {
    match &*shared.tree.borrow() {
        Some(tree) => collect_instances(tree)
            .iter()
            .map(|node| (node.id().to_string(), node.props_snapshot()))
            .collect(),
        None => Vec::new(),
    }
}

/// Called by the reactive root after every full drain.
fn on_flush(shared: &Rc<RuntimeShared>) {
    if shared.disposed.get() {
        return;
    }
    if let Some(err) = shared.root.take_error() {
        *shared.error.borrow_mut() = Some(Rc::new(EngineError::Reactive(err.to_string())));
        shared.notify.notify_waiters();
    }
    if shared.tree.borrow().is_none() {
        // Still inside the initial render; the run task applies afterwards.
        return;
    }
    if shared.applying.get() {
        shared.pending_flush.set(true);
        return;
    }

    let changed = current_fingerprints(shared) != fingerprints(&shared.last_applied.borrow());
    if changed {
        shared.applying.set(true);
        let shared = Rc::clone(shared);
        tokio::task::spawn_local(async move {
            apply_loop(shared).await;
        });
    } else {
        arm_debounced_save(shared);
    }
}

/// Apply until no flush arrived mid-apply. The caller sets `applying` before
/// any suspension so a second flush can never spawn a second loop.
async fn apply_loop(shared: Rc<RuntimeShared>) {
    shared.applying.set(true);
    loop {
        shared.pending_flush.set(false);
        let previous = shared.last_applied.borrow().clone();
        match shared.scheduler.apply_changes(previous, false).await {
            Ok(records) => *shared.last_applied.borrow_mut() = records,
            Err(err) => {
                let err = Rc::new(err);
                tracing::error!(stack = %shared.stack, error = %err, "apply failed");
                *shared.error.borrow_mut() = Some(err);
                break;
            }
        }
        let rerun = shared.pending_flush.replace(false)
            && current_fingerprints(&shared) != fingerprints(&shared.last_applied.borrow());
        if !rerun {
            break;
        }
    }
    shared.applying.set(false);
    shared.notify.notify_waiters();
}

/// Persist output-only changes after a quiet period; re-armed per flush and
/// cancelled on dispose.
fn arm_debounced_save(shared: &Rc<RuntimeShared>) {
    if let Some(previous) = shared.debounce.borrow_mut().take() {
        previous.abort();
    }
    shared.debounce_pending.set(true);
    let delay = shared.options.save_debounce;
    let task = {
        let shared = Rc::clone(shared);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if !shared.disposed.get() && !shared.applying.get() {
                let records = shared.current_records();
                if let Err(err) = shared
                    .machine
                    .complete_deployment(&shared.stack, records.clone())
                    .await
                {
                    tracing::warn!(stack = %shared.stack, error = %err, "debounced save failed");
                } else {
                    *shared.last_applied.borrow_mut() = records;
                }
            }
            shared.debounce_pending.set(false);
            shared.notify.notify_waiters();
        })
    };
    *shared.debounce.borrow_mut() = Some(task);
}

impl RuntimeShared {
    fn current_records(&self) -> Vec<NodeRecord> {
        match &*self.tree.borrow() {
            Some(tree) => collect_instances(tree)
                .iter()
                .map(|node| NodeRecord::of(node, self.machine.resource_state(node.id())))
                .collect(),
            None => Vec::new(),
        }
    }

    fn busy(&self) -> bool {
        if self.disposed.get() {
            return false;
        }
        if self.applying.get() || self.pending_flush.get() {
            return true;
        }
        if matches!(&*self.ready.borrow(), ReadyState::Pending) {
            return true;
        }
        self.debounce_pending.get()
    }
}

impl RuntimeHandle {
    /// Resolves once the initial deployment completed or failed.
    pub async fn ready(&self) -> Result<(), Rc<EngineError>> {
        loop {
            let notified = self.shared.notify.notified();
            if let ReadyState::Done(result) = &*self.shared.ready.borrow() {
                return result.clone();
            }
            notified.await;
        }
    }

    /// Resolves when no work is pending: no active flush, no in-flight
    /// apply, no pending debounced save.
    pub async fn settled(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if !self.shared.busy() {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of the current instance set with persisted-shape records.
    pub fn get_nodes(&self) -> Vec<NodeRecord> {
        self.shared.current_records()
    }

    /// The first error the runtime hit, if any.
    pub fn error(&self) -> Option<Rc<EngineError>> {
        self.shared.error.borrow().clone()
    }

    /// Read back audit entries from the backend.
    pub async fn audit_log(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self
            .shared
            .machine
            .backend()
            .audit_log(&self.shared.stack, limit)
            .await?)
    }

    /// Tear the runtime down: cancel the debounced save, fire instance
    /// cleanups best-effort, clean up the fiber tree, and dispose the
    /// reactive root. In-flight handlers are not cancelled; scheduler
    /// decisions that check the disposed flag become no-ops.
    pub fn dispose(&self) {
        let shared = &self.shared;
        if shared.disposed.replace(true) {
            return;
        }
        if let Some(task) = shared.debounce.borrow_mut().take() {
            task.abort();
        }
        shared.debounce_pending.set(false);
        for node in shared.ctx.registered_instances() {
            if let Some(cleanup) = node.cleanup() {
                let id = node.id().to_string();
                tokio::task::spawn_local(async move {
                    if let Err(err) = cleanup.run().await {
                        tracing::warn!(id = %id, error = %err, "cleanup failed during dispose");
                    }
                });
            }
        }
        if let Some(tree) = shared.tree.borrow_mut().take() {
            shared.root.run_in(|| cleanup_fiber(&shared.ctx, &tree));
        }
        shared.ctx.clear_instances();
        shared.root.set_on_flush(None);
        shared.root.dispose();
        {
            let machine = Rc::clone(&shared.machine);
            let stack = shared.stack.clone();
            tokio::task::spawn_local(async move {
                if let Err(err) = machine.release_lock(&stack).await {
                    tracing::warn!(stack = %stack, error = %err, "failed to release stack lock");
                }
            });
        }
        shared.notify.notify_waiters();
    }
}

/// Number of live runtimes on this thread.
pub fn runtime_count() -> usize {
    RUNTIMES.with(|runtimes| {
        runtimes
            .borrow()
            .iter()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    })
}

/// Dispose every live runtime on this thread and clear the registry.
/// Cleanups run best-effort; errors are logged and swallowed.
pub fn reset_runtimes() {
    let live: Vec<Rc<RuntimeShared>> = RUNTIMES.with(|runtimes| {
        let mut runtimes = runtimes.borrow_mut();
        let live = runtimes.iter().filter_map(Weak::upgrade).collect();
        runtimes.clear();
        live
    });
    for shared in live {
        RuntimeHandle { shared }.dispose();
    }
}
