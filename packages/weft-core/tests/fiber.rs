//! Fiber reconciliation and registry behavior across the core crate.

use std::cell::Cell;
use std::rc::Rc;

use indexmap::IndexMap;
use weft_core::*;
use weft_reactive::*;

fn noop_handler() -> Handler {
    handler(|_, _| async { Ok(None) })
}

/// Render inside a fresh root + context, run assertions, dispose.
fn with_render<T>(f: impl FnOnce(&Rc<RenderCtx>) -> T) -> T {
    let mut out = None;
    let root = create_root(|| {
        let ctx = RenderCtx::new();
        ctx.set_signal_owner(use_current_scope());
        out = Some(f(&ctx));
    });
    root.dispose();
    out.expect("render closure did not run")
}

#[test]
fn renders_components_exactly_once() {
    with_render(|ctx| {
        let runs = Rc::new(Cell::new(0));
        let el = component("App", {
            let runs = Rc::clone(&runs);
            move |_, _| {
                runs.set(runs.get() + 1);
                Child::from("done")
            }
        })
        .build();
        let _tree = render_root(ctx, el);
        assert_eq!(runs.get(), 1);
    });
}

#[test]
fn boundary_rerenders_in_place_on_signal_change() {
    with_render(|ctx| {
        let label = create_signal("first");
        let el = component("App", move |_, _| {
            Child::accessor(move || Child::from(label.get().to_string()))
        })
        .build();
        let tree = render_root(ctx, el);

        let read_text = |tree: &FiberRef| -> String {
            // App -> Boundary -> Text
            let app = tree.borrow().children[0].clone();
            let boundary = app.borrow().children[0].clone();
            let text = boundary.borrow().children[0].clone();
            let out = match &text.borrow().kind {
                FiberKind::Text(text) => text.to_string(),
                _ => panic!("expected text fiber"),
            };
            out
        };
        assert_eq!(read_text(&tree), "first");

        label.set("second");
        assert_eq!(read_text(&tree), "second");
    });
}

/// A boundary whose condition changes value but not truthiness keeps the
/// inner fiber subtree: the same fiber objects, the same scopes.
#[test]
fn value_change_preserves_inner_fiber_identity() {
    with_render(|ctx| {
        let outer = create_signal("hello".to_string());
        let inner = create_signal(0);

        let el = component("App", move |_, _| {
            when(move || Value::str(outer.get_clone()))
                .with_value(move |_value| {
                    when(move || Value::Int(inner.get()))
                        .child("inner on")
                        .fallback("inner off")
                        .build()
                        .into()
                })
                .build()
                .into()
        })
        .build();
        let tree = render_root(ctx, el);

        // App -> When -> Boundary -> When(inner) fiber.
        let find_inner_when = |tree: &FiberRef| -> FiberRef {
            let app = tree.borrow().children[0].clone();
            let outer_when = app.borrow().children[0].clone();
            let boundary = outer_when.borrow().children[0].clone();
            let fiber = boundary.borrow().children[0].clone();
            fiber
        };
        let before = find_inner_when(&tree);

        outer.set("world".to_string());
        inner.set(42);
        let after = find_inner_when(&tree);
        assert!(Rc::ptr_eq(&before, &after), "inner fiber was recreated");
    });
}

#[test]
fn when_toggles_between_children_and_fallback() {
    with_render(|ctx| {
        let show = create_signal(false);
        let el = component("App", move |_, _| {
            when(move || Value::Bool(show.get()))
                .child("on")
                .fallback("off")
                .build()
                .into()
        })
        .build();
        let tree = render_root(ctx, el);

        let read = |tree: &FiberRef| -> String {
            let app = tree.borrow().children[0].clone();
            let when_fiber = app.borrow().children[0].clone();
            let boundary = when_fiber.borrow().children[0].clone();
            let text = boundary.borrow().children[0].clone();
            let out = match &text.borrow().kind {
                FiberKind::Text(text) => text.to_string(),
                _ => panic!("expected text fiber"),
            };
            out
        };
        assert_eq!(read(&tree), "off");
        show.set(true);
        assert_eq!(read(&tree), "on");
        show.set(false);
        assert_eq!(read(&tree), "off");
    });
}

#[test]
fn each_preserves_mapped_children_across_reorder() {
    with_render(|ctx| {
        #[derive(Clone, PartialEq)]
        struct Row {
            id: &'static str,
        }
        let rows = create_signal(vec![Row { id: "a" }, Row { id: "b" }]);
        let created = Rc::new(Cell::new(0));

        let el = component("App", {
            let created = Rc::clone(&created);
            move |_, _| {
                let created = Rc::clone(&created);
                each(move || rows.get_clone())
                    .key(|row: &Row| row.id.to_string())
                    .view(move |item| {
                        created.set(created.get() + 1);
                        Child::from(item.with_value(|row| row.id.to_string()))
                    })
                    .build()
                    .into()
            }
        })
        .build();
        let _tree = render_root(ctx, el);
        assert_eq!(created.get(), 2);

        rows.set(vec![Row { id: "b" }, Row { id: "a" }]);
        // Reorder reused both mapped subtrees.
        assert_eq!(created.get(), 2);

        rows.set(vec![Row { id: "b" }, Row { id: "a" }, Row { id: "c" }]);
        assert_eq!(created.get(), 3);
    });
}

#[test]
fn instance_ids_derive_from_keyed_ancestry() {
    with_render(|ctx| {
        let leaf = component("Database", |props, _| {
            use_async_output(props, noop_handler());
            Child::Hole
        })
        .key("main")
        .build();
        let el = component("Stack", move |_, children| {
            use_async_output(props! {}, noop_handler());
            children
        })
        .key("prod")
        .child(leaf.clone())
        .build();

        let tree = render_root(ctx, el);
        let instances = collect_instances(&tree);
        let ids: Vec<_> = instances.iter().map(|node| node.id().to_string()).collect();
        assert_eq!(ids, ["stack-prod", "stack-prod.database-main"]);
    });
}

#[test]
fn rendering_twice_yields_the_same_ids() {
    let build = || {
        component("Server", |props, _| {
            use_async_output(props, noop_handler());
            Child::Hole
        })
        .key("web")
        .build()
    };
    let first = with_render(|ctx| {
        let tree = render_root(ctx, build());
        collect_instances(&tree)[0].id().to_string()
    });
    let second = with_render(|ctx| {
        let tree = render_root(ctx, build());
        collect_instances(&tree)[0].id().to_string()
    });
    assert_eq!(first, second);
}

#[test]
#[should_panic(expected = "must be given a key")]
fn missing_key_is_fatal() {
    with_render(|ctx| {
        let el = component("Database", |props, _| {
            use_async_output(props, noop_handler());
            Child::Hole
        })
        .build();
        let _ = render_root(ctx, el);
    });
}

#[test]
#[should_panic(expected = "duplicate instance id")]
fn id_collision_across_paths_is_fatal() {
    with_render(|ctx| {
        let make = || {
            component("Database", |props, _| {
                use_async_output(props, noop_handler());
                Child::Hole
            })
            .key("main")
            .build()
        };
        let el = fragment().child(make()).child(make()).build();
        let _ = render_root(ctx, el);
    });
}

#[test]
fn undefined_props_defer_publication() {
    with_render(|ctx| {
        let el = component("Consumer", |props, _| {
            use_async_output(props, noop_handler());
            Child::Hole
        })
        .key("c")
        .prop("input", Value::Undefined)
        .build();
        let tree = render_root(ctx, el);
        assert!(collect_instances(&tree).is_empty(), "placeholder was published");
        // It is still registered.
        assert!(ctx.get_instance("consumer-c").is_some());
    });
}

#[test]
fn getter_promotes_placeholder_when_props_fill_in() {
    with_render(|ctx| {
        let upstream = create_signal(Value::Undefined);
        let el = component("Consumer", move |_, _| {
            use_async_output(
                PropsSource::getter(move || props! { "input" => upstream.get_clone() }),
                noop_handler(),
            );
            Child::Hole
        })
        .key("c")
        .build();
        let tree = render_root(ctx, el);
        assert!(collect_instances(&tree).is_empty());

        upstream.set(Value::str("ready"));
        let instances = collect_instances(&tree);
        assert_eq!(instances.len(), 1);
        assert_eq!(
            instances[0].props_snapshot().get("input"),
            Some(&Value::str("ready"))
        );
    });
}

/// A torn-down fiber whose registry node is reattached by a rebuilt element
/// must re-derive deferral; the fresh fiber's default `placeholder` state
/// must not leak a still-undefined instance into the published set.
#[test]
fn reused_registration_stays_deferred_until_defined() {
    with_render(|ctx| {
        let show = create_signal(true);
        let upstream = create_signal(Value::Undefined);

        let el = component("App", move |_, _| {
            when(move || Value::Bool(show.get()))
                .with_value(move |_| {
                    // Built fresh on every truthiness flip, so the fiber is
                    // never identity-reused even though the registry node is.
                    component("Consumer", move |_, _| {
                        use_async_output(
                            PropsSource::getter(move || {
                                props! { "input" => upstream.get_clone() }
                            }),
                            noop_handler(),
                        );
                        Child::Hole
                    })
                    .key("c")
                    .build()
                    .into()
                })
                .build()
                .into()
        })
        .build();
        let tree = render_root(ctx, el);
        assert!(collect_instances(&tree).is_empty());

        // Tear the subtree down, then rebuild it around the same node.
        show.set(false);
        show.set(true);
        assert!(
            collect_instances(&tree).is_empty(),
            "reattached deferred node was published"
        );
        assert!(ctx.get_instance("consumer-c").is_some());

        upstream.set(Value::str("ready"));
        assert_eq!(collect_instances(&tree).len(), 1);
    });
}

#[test]
fn hydration_seeds_outputs_before_handlers() {
    with_render(|ctx| {
        let mut outputs = IndexMap::new();
        outputs.insert("url".to_string(), Value::str("https://restored"));
        ctx.seed_hydration("server-web", outputs);

        let seen = Rc::new(Cell::new(false));
        let el = component("Server", {
            let seen = Rc::clone(&seen);
            move |props, _| {
                let out = use_async_output(props, noop_handler());
                seen.set(out.get("url").get() == Value::str("https://restored"));
                Child::Hole
            }
        })
        .key("web")
        .build();
        let _tree = render_root(ctx, el);
        assert!(seen.get(), "hydrated output was not readable during render");
    });
}

#[test]
fn set_outputs_is_idempotent_per_signal() {
    with_render(|ctx| {
        let el = component("Server", |props, _| {
            use_async_output(props, noop_handler());
            Child::Hole
        })
        .key("web")
        .build();
        let tree = render_root(ctx, el);
        let node = collect_instances(&tree).remove(0);
        let outputs = node.outputs_handle();

        let writes = Rc::new(Cell::new(0));
        let url = outputs.get("url");
        create_effect({
            let writes = Rc::clone(&writes);
            move |_: Option<()>| {
                let _ = url.get();
                writes.set(writes.get() + 1);
            }
        });
        assert_eq!(writes.get(), 1);

        outputs.set([("url".to_string(), Value::str("https://x"))]);
        assert_eq!(writes.get(), 2);

        // Equal write: the backing signal is not written again.
        outputs.set([("url".to_string(), Value::str("https://x"))]);
        assert_eq!(writes.get(), 2);
    });
}

#[test]
fn toggled_instance_keeps_output_signals() {
    with_render(|ctx| {
        let show = create_signal(true);
        let el = component("App", move |_, _| {
            when(move || Value::Bool(show.get()))
                .child(
                    component("Server", |props, _| {
                        use_async_output(props, noop_handler());
                        Child::Hole
                    })
                    .key("web")
                    .build(),
                )
                .build()
                .into()
        })
        .build();
        let tree = render_root(ctx, el);
        assert_eq!(collect_instances(&tree).len(), 1);
        let node = ctx.get_instance("server-web").expect("registered");
        node.outputs_handle()
            .set([("url".to_string(), Value::str("https://x"))]);

        show.set(false);
        assert!(collect_instances(&tree).is_empty());

        show.set(true);
        let back = ctx.get_instance("server-web").expect("still registered");
        assert_eq!(back.outputs_handle().get("url").get(), Value::str("https://x"));
    });
}

#[test]
fn error_boundary_renders_fallback_and_resets() {
    with_render(|ctx| {
        let trigger = create_signal(0);
        let el = component("App", move |_, _| {
            error_boundary(
                Child::accessor(move || {
                    if trigger.get() > 0 {
                        throw_error(ScopeError::msg("exploded"));
                    }
                    Child::from("content")
                }),
                |err, _reset| Child::from(format!("failed: {err}")),
            )
            .into()
        })
        .build();
        let tree = render_root(ctx, el);

        fn texts(fiber: &FiberRef, out: &mut Vec<String>) {
            let fiber = fiber.borrow();
            if let FiberKind::Text(text) = &fiber.kind {
                out.push(text.to_string());
            }
            for child in &fiber.children {
                texts(child, out);
            }
        }
        let read = |tree: &FiberRef| {
            let mut out = Vec::new();
            texts(tree, &mut out);
            out
        };
        assert_eq!(read(&tree), ["content"]);

        trigger.set(1);
        assert_eq!(read(&tree), ["failed: exploded"]);
    });
}
