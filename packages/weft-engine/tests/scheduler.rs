//! Scheduler behavior: ordering, concurrency, cascading, failure isolation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weft_core::*;
use weft_engine::*;
use weft_reactive::*;

struct Harness {
    root: RootHandle,
    tree: FiberRef,
    backend: Rc<MemoryBackend>,
    scheduler: Scheduler,
}

impl Harness {
    /// Render `element` and wire a scheduler over the resulting tree.
    fn new(element: Element) -> Self {
        let ctx = RenderCtx::new();
        let backend = Rc::new(MemoryBackend::new());
        let mut tree = None;
        let root = create_root(|| {
            ctx.set_signal_owner(use_current_scope());
            tree = Some(render_root(&ctx, element));
        });
        let tree = tree.expect("rendered");
        let machine = StateMachine::new(backend.clone(), None);
        let collect = {
            let tree = tree.clone();
            let root = root;
            Rc::new(move || root.run_in(|| collect_instances(&tree))) as CollectFn
        };
        let lookup = {
            let ctx = Rc::clone(&ctx);
            Rc::new(move |id: &str| ctx.get_instance(id)) as LookupFn
        };
        let scheduler = Scheduler::new("test", machine, collect, lookup, Rc::new(Cell::new(false)));
        Self {
            root,
            tree,
            backend,
            scheduler,
        }
    }

    fn collect(&self) -> Vec<Rc<InstanceNode>> {
        self.root.run_in(|| collect_instances(&self.tree))
    }
}

type Log = Rc<RefCell<Vec<String>>>;

fn logging_handler(log: Log, name: &'static str) -> Handler {
    handler(move |_props, _outputs| {
        let log = Rc::clone(&log);
        async move {
            log.borrow_mut().push(format!("{name}:start"));
            tokio::task::yield_now().await;
            log.borrow_mut().push(format!("{name}:end"));
            Ok(None)
        }
    })
}

fn instance_component(
    name: &'static str,
    key: &'static str,
    props: Props,
    h: Handler,
) -> Element {
    component(name, move |props, _| {
        use_async_output(props.clone(), h.clone());
        Child::Hole
    })
    .key(key)
    .props(props)
    .build()
}

#[tokio::test]
async fn no_op_apply_short_circuits_to_complete() {
    let harness = Harness::new(fragment().build());
    let records = harness.scheduler.apply_changes(Vec::new(), false).await.unwrap();
    assert!(records.is_empty());
    let state = harness.backend.peek("test").unwrap();
    assert_eq!(state.status, DeploymentStatus::Deployed);
    // Straight to complete: no deploy_start event.
    let audit = harness.backend.audit_log("test", None).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::DeployComplete);
}

#[tokio::test]
async fn dependency_order_is_respected_and_independent_nodes_interleave() {
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    // a -> {b, c} -> d, wired through output provenance.
    let a_handler = {
        let log = Rc::clone(&log);
        handler(move |_props, outputs| {
            let log = Rc::clone(&log);
            async move {
                log.borrow_mut().push("a:start".into());
                tokio::task::yield_now().await;
                outputs.set([("url".to_string(), Value::str("https://a"))]);
                log.borrow_mut().push("a:end".into());
                Ok(None)
            }
        })
    };
    let mid_handler = |name: &'static str, log: &Log| {
        let log = Rc::clone(log);
        handler(move |_props, outputs| {
            let log = Rc::clone(&log);
            let name = name;
            async move {
                log.borrow_mut().push(format!("{name}:start"));
                tokio::task::yield_now().await;
                outputs.set([("token".to_string(), Value::str(name))]);
                log.borrow_mut().push(format!("{name}:end"));
                Ok(None)
            }
        })
    };

    let a = instance_component("Alpha", "1", props! {}, a_handler);
    // b and c read a's output through the registry; d reads b's and c's.
    let log_b = mid_handler("b", &log);
    let log_c = mid_handler("c", &log);
    let d_handler = logging_handler(Rc::clone(&log), "d");

    let el = fragment()
        .child(a)
        .child(
            component("Beta", move |_, _| {
                let upstream = RenderCtx::current()
                    .and_then(|ctx| ctx.get_instance("alpha-1"))
                    .expect("alpha registered first");
                let url = upstream.outputs_handle().get("url");
                use_async_output(
                    PropsSource::getter(move || props! { "url" => url }),
                    log_b.clone(),
                );
                Child::Hole
            })
            .key("1")
            .build(),
        )
        .child(
            component("Gamma", move |_, _| {
                let upstream = RenderCtx::current()
                    .and_then(|ctx| ctx.get_instance("alpha-1"))
                    .expect("alpha registered first");
                let url = upstream.outputs_handle().get("url");
                use_async_output(
                    PropsSource::getter(move || props! { "url" => url }),
                    log_c.clone(),
                );
                Child::Hole
            })
            .key("1")
            .build(),
        )
        .child(
            component("Delta", move |_, _| {
                let ctx = RenderCtx::current().expect("rendering");
                let b = ctx.get_instance("beta-1").expect("beta registered");
                let c = ctx.get_instance("gamma-1").expect("gamma registered");
                let b_token = b.outputs_handle().get("token");
                let c_token = c.outputs_handle().get("token");
                use_async_output(
                    PropsSource::getter(move || {
                        props! { "b" => b_token, "c" => c_token }
                    }),
                    d_handler.clone(),
                );
                Child::Hole
            })
            .key("1")
            .build(),
        )
        .build();

    let harness = Harness::new(el);
    harness.scheduler.apply_changes(Vec::new(), true).await.unwrap();

    let log = log.borrow();
    let position = |event: &str| {
        log.iter()
            .position(|entry| entry == event)
            .unwrap_or_else(|| panic!("missing {event} in {log:?}"))
    };
    // a fully precedes b and c; both fully precede d.
    assert!(position("a:end") < position("b:start"));
    assert!(position("a:end") < position("c:start"));
    assert!(position("b:end") < position("d:start"));
    assert!(position("c:end") < position("d:start"));
    // b and c ran concurrently: each started before the other ended.
    assert!(position("b:start") < position("c:end"));
    assert!(position("c:start") < position("b:end"));
}

#[tokio::test]
async fn handler_failure_settles_in_flight_and_fails_the_deployment() {
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    let failing = handler(move |_props, _outputs| async move {
        tokio::task::yield_now().await;
        Err::<Option<Cleanup>, HandlerError>("a exploded".into())
    });
    let slow = {
        let log = Rc::clone(&log);
        handler(move |_props, _outputs| {
            let log = Rc::clone(&log);
            async move {
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                log.borrow_mut().push("b:done".into());
                Ok(None)
            }
        })
    };

    let el = fragment()
        .child(instance_component("Alpha", "1", props! {}, failing))
        .child(instance_component("Beta", "1", props! {}, slow))
        .build();
    let harness = Harness::new(el);

    let err = harness
        .scheduler
        .apply_changes(Vec::new(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Handler { ref id, .. } if id == "alpha-1"));
    // The independent concurrent handler settled before the bubble-up.
    assert_eq!(*log.borrow(), ["b:done"]);

    let state = harness.backend.peek("test").unwrap();
    assert_eq!(state.status, DeploymentStatus::Failed);
    let audit = harness.backend.audit_log("test", None).await.unwrap();
    assert_eq!(audit.last().unwrap().action, AuditAction::DeployFailed);
}

#[tokio::test]
async fn outputs_are_persisted_after_each_handler() {
    let writer = handler(|_props, outputs| async move {
        outputs.set([("url".to_string(), Value::str("https://made"))]);
        Ok(None)
    });
    let el = instance_component("Server", "web", props! {}, writer);
    let harness = Harness::new(el);
    harness.scheduler.apply_changes(Vec::new(), true).await.unwrap();

    let state = harness.backend.peek("test").unwrap();
    assert_eq!(state.status, DeploymentStatus::Deployed);
    let node = &state.nodes[0];
    assert_eq!(node.id, "server-web");
    assert_eq!(node.outputs.get("url"), Some(&Value::str("https://made")));
    assert!(state.applying_node_ids.is_empty());
}

#[tokio::test]
async fn initial_run_resumes_unchanged_nodes() {
    let runs = Rc::new(Cell::new(0));
    let counting = {
        let runs = Rc::clone(&runs);
        handler(move |_props, _outputs| {
            let runs = Rc::clone(&runs);
            async move {
                runs.set(runs.get() + 1);
                Ok(None)
            }
        })
    };
    let el = instance_component("Server", "web", props! { "port" => 1 }, counting);
    let harness = Harness::new(el);

    // Previous state already contains the identical node.
    let previous = vec![NodeRecord {
        id: "server-web".into(),
        path: vec!["server-web".into()],
        props: props! { "port" => 1 },
        outputs: Default::default(),
        state: None,
    }];

    harness
        .scheduler
        .apply_changes(previous.clone(), true)
        .await
        .unwrap();
    assert_eq!(runs.get(), 1, "resumed node re-ran idempotently");

    // A non-initial apply with identical state is a no-op.
    let records = harness.backend.peek("test").unwrap().nodes;
    harness.scheduler.apply_changes(records, false).await.unwrap();
    assert_eq!(runs.get(), 1);
}

#[tokio::test]
async fn deletes_run_dependents_first_and_invoke_cleanups() {
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    // Render a tree with two instances wired a -> b, apply, then re-render
    // empty and apply again to delete both.
    let make_handler = |name: &'static str, log: &Log| {
        let log = Rc::clone(log);
        handler(move |_props, outputs| {
            let log = Rc::clone(&log);
            let name = name;
            async move {
                outputs.set([("out".to_string(), Value::str(name))]);
                let cleanup_log = Rc::clone(&log);
                Ok(Some(Cleanup::new(move || {
                    let log = Rc::clone(&cleanup_log);
                    async move {
                        log.borrow_mut().push(format!("cleanup:{name}"));
                        Ok(())
                    }
                })))
            }
        })
    };

    let show = Rc::new(RefCell::new(None::<Signal<bool>>));
    let a_handler = make_handler("a", &log);
    let b_handler = make_handler("b", &log);
    let show_setup = Rc::clone(&show);
    let el = component("App", move |_, _| {
        let toggle = create_signal(true);
        *show_setup.borrow_mut() = Some(toggle);
        let a_handler = a_handler.clone();
        let b_handler = b_handler.clone();
        when(move || Value::Bool(toggle.get()))
            .child(
                fragment()
                    .child(
                        component("Alpha", move |props, _| {
                            use_async_output(props.clone(), a_handler.clone());
                            Child::Hole
                        })
                        .key("1")
                        .build(),
                    )
                    .child(
                        component("Beta", move |_, _| {
                            let a = RenderCtx::current()
                                .and_then(|ctx| ctx.get_instance("alpha-1"))
                                .expect("alpha registered");
                            let out = a.outputs_handle().get("out");
                            use_async_output(
                                PropsSource::getter(move || props! { "in" => out }),
                                b_handler.clone(),
                            );
                            Child::Hole
                        })
                        .key("1")
                        .build(),
                    )
                    .build(),
            )
            .build()
            .into()
    })
    .build();

    let harness = Harness::new(el);
    let records = harness.scheduler.apply_changes(Vec::new(), true).await.unwrap();
    assert_eq!(records.len(), 2);

    // Toggle everything away and apply the delta.
    let toggle = (*show.borrow()).expect("toggle captured");
    harness.root.run_in(|| toggle.set(false));
    assert!(harness.collect().is_empty());

    harness.scheduler.apply_changes(records, false).await.unwrap();
    // Dependent destroyed before its dependency.
    assert_eq!(*log.borrow(), ["cleanup:b", "cleanup:a"]);

    let state = harness.backend.peek("test").unwrap();
    assert!(state.nodes.is_empty());
    let destroyed: Vec<_> = harness
        .backend
        .audit_log("test", None)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.action == AuditAction::ResourceDestroyed)
        .map(|entry| entry.node_id.unwrap())
        .collect();
    assert_eq!(destroyed, ["beta-1", "alpha-1"]);
}

#[tokio::test]
async fn cascade_discovers_instances_materialised_by_outputs() {
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    let a_handler = {
        let log = Rc::clone(&log);
        handler(move |_props, outputs| {
            let log = Rc::clone(&log);
            async move {
                log.borrow_mut().push("a".into());
                outputs.set([("summary".to_string(), Value::str("s"))]);
                Ok(None)
            }
        })
    };
    let b_handler = {
        let log = Rc::clone(&log);
        handler(move |props, _outputs| {
            let log = Rc::clone(&log);
            async move {
                let summary = props.get("summary").cloned().unwrap_or(Value::Null);
                log.borrow_mut().push(format!("b:{summary:?}"));
                Ok(None)
            }
        })
    };

    let el = component("App", move |_, _| {
        let b_handler = b_handler.clone();
        let a_out = use_async_output(props! {}, a_handler.clone());
        let summary = a_out.get("summary");
        let summary_for_child = summary;
        when(move || summary.get())
            .child(
                component("Report", move |_, _| {
                    use_async_output(
                        PropsSource::getter(move || {
                            props! { "summary" => summary_for_child }
                        }),
                        b_handler.clone(),
                    );
                    Child::Hole
                })
                .key("1")
                .build(),
            )
            .build()
            .into()
    })
    .key("app")
    .build();

    let harness = Harness::new(el);
    // Only `app` is published before the apply.
    assert_eq!(harness.collect().len(), 1);

    harness.scheduler.apply_changes(Vec::new(), true).await.unwrap();

    // B materialised from A's output and ran within the same apply call.
    assert_eq!(*log.borrow(), ["a", "b:\"s\""]);
    let state = harness.backend.peek("test").unwrap();
    assert_eq!(state.nodes.len(), 2);
    assert_eq!(state.status, DeploymentStatus::Deployed);
}
