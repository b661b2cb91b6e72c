/// End-to-end scenarios exercising the queue, driver, diff, and commit
/// pipeline together through the public surface.
use crate::{
    CallbackError, Component, ContextId, Element, ExecuteMode, HostHandle, HostOp, ModeGuard,
    PropValue, Props, ReconcileError, RecordingHost, RootId, flush_pending_work, mount,
    pending_task_count, schedule_callback, unmount, update, ORDER_DEFAULT, ORDER_IMMEDIATE,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// Scenario tests drain the shared queue and must not interleave; the driver
// test additionally owns the driver slot.
fn serialized() -> parking_lot::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    crate::queue::TEST_QUEUE_LOCK.lock()
}

fn container() -> HostHandle {
    HostHandle::from_raw(0)
}

fn mount_recording(desc: Element) -> (RootId, crate::Journal) {
    let backend = RecordingHost::new();
    let journal = backend.journal();
    let root = mount(desc, container(), Box::new(backend)).expect("mount failed");
    (root, journal)
}

/// Queue an update without arming the background driver, the way an event
/// handler would.
fn quiet_update(root: RootId, desc: Element) -> Result<(), ReconcileError> {
    let _event = ModeGuard::enter(ExecuteMode::EVENT);
    update(root, desc)
}

#[test]
fn mount_update_flush_round_trip() {
    let _serial = serialized();
    let (root, journal) = mount_recording(Element::host("app").children([Element::text("a")]));
    journal.take();

    quiet_update(root, Element::host("app").children([Element::text("b")])).unwrap();
    assert_eq!(pending_task_count(), 1);

    let processed = flush_pending_work().unwrap();
    assert_eq!(processed, 1);
    assert_eq!(pending_task_count(), 0);

    // The only mutation is the text content change, as the reserved prop.
    let ops = journal.take();
    assert_eq!(ops.len(), 1);
    assert!(matches!(
        &ops[0],
        HostOp::SetProps { changes, .. }
            if changes.len() == 1
                && changes[0].name == "text"
                && changes[0].value == Some(PropValue::Str("b".into()))
    ));
    unmount(root).unwrap();
}

#[test]
fn newer_update_supersedes_queued_render() {
    let _serial = serialized();
    cov_mark::check!(superseded_queued_render);
    let (root, journal) = mount_recording(Element::host("app").children([Element::text("a")]));
    journal.take();

    quiet_update(root, Element::host("app").children([Element::text("b")])).unwrap();
    quiet_update(root, Element::host("app").children([Element::text("c")])).unwrap();
    assert_eq!(pending_task_count(), 1);

    // Only the final description renders; "b" never reaches the host.
    let processed = flush_pending_work().unwrap();
    assert_eq!(processed, 1);
    let ops = journal.take();
    assert_eq!(ops.len(), 1);
    assert!(matches!(
        &ops[0],
        HostOp::SetProps { changes, .. }
            if changes[0].value == Some(PropValue::Str("c".into()))
    ));
    unmount(root).unwrap();
}

#[test]
fn update_appends_a_sibling_with_create_then_attach() {
    let _serial = serialized();
    let (root, journal) = mount_recording(Element::host("app").children([Element::text("a")]));
    let root_handle = crate::root::committed_root(root).unwrap().host().unwrap();
    journal.take();

    quiet_update(
        root,
        Element::host("app").children([Element::text("a"), Element::text("b")]),
    )
    .unwrap();
    flush_pending_work().unwrap();

    // The untouched first child produces no ops; the new sibling is one
    // creation plus one attachment at the end of the list.
    let ops = journal.take();
    assert_eq!(ops.len(), 2, "append produced {ops:?}");
    assert!(matches!(&ops[0], HostOp::CreateText { value, .. } if value == "b"));
    assert!(matches!(&ops[1], HostOp::Append { parent, .. } if *parent == root_handle));
    unmount(root).unwrap();
}

#[test]
fn identical_redescription_touches_nothing() {
    let _serial = serialized();
    let desc = || {
        Element::host("app")
            .with_prop("mode", "dark")
            .children([Element::text("stable"), Element::host("row").with_key("r")])
    };
    let (root, journal) = mount_recording(desc());
    journal.take();

    quiet_update(root, desc()).unwrap();
    let processed = flush_pending_work().unwrap();
    assert_eq!(processed, 1);
    assert!(journal.is_empty(), "no-op update reached the host: {:?}", journal.ops());
    unmount(root).unwrap();
}

#[test]
fn keyed_rotation_is_two_host_mutations() {
    let _serial = serialized();
    let row = |k: &str| Element::host("row").with_key(k);
    let (root, journal) =
        mount_recording(Element::host("list").children([row("a"), row("b"), row("c")]));
    journal.take();

    quiet_update(root, Element::host("list").children([row("c"), row("a"), row("b")])).unwrap();
    flush_pending_work().unwrap();

    // No creations, no removals: one append plus one insert_before realize
    // the rotation.
    let ops = journal.take();
    assert_eq!(ops.len(), 2, "rotation produced {ops:?}");
    assert!(matches!(ops[0], HostOp::Append { .. }));
    assert!(matches!(ops[1], HostOp::InsertBefore { .. }));
    unmount(root).unwrap();
}

struct MountLogger {
    label: &'static str,
    log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    children: Vec<Arc<dyn Component>>,
}

impl Component for MountLogger {
    fn render(&self, _props: &Props) -> Element {
        if self.children.is_empty() {
            Element::text(self.label)
        } else {
            Element::fragment().children(self.children.iter().cloned().map(Element::component))
        }
    }

    fn did_mount(&self) -> Result<(), CallbackError> {
        self.log.lock().push(self.label);
        Ok(())
    }
}

#[test]
fn did_mount_runs_children_before_parent() {
    let _serial = serialized();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let child = |label| -> Arc<dyn Component> {
        Arc::new(MountLogger {
            label,
            log: log.clone(),
            children: Vec::new(),
        })
    };
    let parent = Arc::new(MountLogger {
        label: "parent",
        log: log.clone(),
        children: vec![child("child1"), child("child2")],
    });

    let (root, _journal) = mount_recording(Element::host("app").children([Element::component(parent)]));
    assert_eq!(*log.lock(), vec!["child1", "child2", "parent"]);
    unmount(root).unwrap();
}

#[test]
fn immediate_order_runs_ahead_of_default() {
    let _serial = serialized();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let _event = ModeGuard::enter(ExecuteMode::EVENT);
    let slow = log.clone();
    schedule_callback(ORDER_DEFAULT, move || slow.lock().push("default"));
    let fast = log.clone();
    schedule_callback(ORDER_IMMEDIATE, move || fast.lock().push("immediate"));
    drop(_event);

    flush_pending_work().unwrap();
    assert_eq!(*log.lock(), vec!["immediate", "default"]);
}

#[test]
fn flush_drains_work_enqueued_by_tasks() {
    let _serial = serialized();
    let ran = Arc::new(AtomicUsize::new(0));

    let _event = ModeGuard::enter(ExecuteMode::EVENT);
    let outer = ran.clone();
    schedule_callback(ORDER_DEFAULT, move || {
        outer.fetch_add(1, Ordering::Relaxed);
        let inner = outer.clone();
        schedule_callback(ORDER_DEFAULT, move || {
            inner.fetch_add(1, Ordering::Relaxed);
        });
    });
    drop(_event);

    // The follow-up task queued mid-flush is drained in the same call.
    let processed = flush_pending_work().unwrap();
    assert_eq!(processed, 2);
    assert_eq!(ran.load(Ordering::Relaxed), 2);
}

#[test]
fn flush_requested_during_render_is_deferred() {
    let _serial = serialized();
    cov_mark::check!(flush_deferred_mid_pass);

    struct FlushesInRender {
        observed: Arc<parking_lot::Mutex<Option<usize>>>,
    }
    impl Component for FlushesInRender {
        fn render(&self, _props: &Props) -> Element {
            // Reentrant flush from inside a render pass must not recurse
            // into the queue.
            if let Ok(processed) = flush_pending_work() {
                *self.observed.lock() = Some(processed);
            }
            Element::text("rendered")
        }
    }

    let observed = Arc::new(parking_lot::Mutex::new(None));
    let component = Arc::new(FlushesInRender {
        observed: observed.clone(),
    });
    let (root, _journal) =
        mount_recording(Element::host("app").children([Element::component(component)]));
    assert_eq!(*observed.lock(), Some(0));
    unmount(root).unwrap();
}

#[test]
fn provider_value_change_reaches_consumer() {
    let _serial = serialized();
    let context = ContextId::new();
    let desc = |value: &str| {
        Element::host("app").children([Element::provider(context, value).children([
            Element::consumer(context, |value| match value {
                Some(PropValue::Str(s)) => Element::text(s.clone()),
                _ => Element::text("none"),
            }),
        ])])
    };

    let (root, journal) = mount_recording(desc("one"));
    journal.take();

    quiet_update(root, desc("two")).unwrap();
    flush_pending_work().unwrap();

    let ops = journal.take();
    assert_eq!(ops.len(), 1);
    assert!(matches!(
        &ops[0],
        HostOp::SetProps { changes, .. }
            if changes[0].value == Some(PropValue::Str("two".into()))
    ));
    unmount(root).unwrap();
}

#[test]
fn unmount_detaches_content_and_drops_queued_work() {
    let _serial = serialized();
    let (root, journal) = mount_recording(Element::host("app").children([Element::text("x")]));
    let root_handle = crate::root::committed_root(root).unwrap().host().unwrap();
    journal.take();

    quiet_update(root, Element::host("app").children([Element::text("y")])).unwrap();
    assert_eq!(pending_task_count(), 1);

    unmount(root).unwrap();
    assert_eq!(pending_task_count(), 0);
    assert_eq!(
        journal.take(),
        vec![HostOp::Remove {
            parent: container(),
            child: root_handle
        }]
    );
    assert!(matches!(
        update(root, Element::host("app")),
        Err(ReconcileError::StaleRoot(_))
    ));
}

#[test]
fn portal_content_lives_in_its_own_container() {
    let _serial = serialized();
    let overlay = HostHandle::from_raw(7777);
    let desc = |text: &str| {
        Element::host("app")
            .children([Element::portal(overlay).children([Element::text(text)])])
    };

    let (root, journal) = mount_recording(desc("tip"));
    let ops = journal.take();
    assert!(ops.iter().any(|op| matches!(
        op,
        HostOp::Append { parent, .. } if *parent == overlay
    )));

    // Updating portal content stays inside the overlay container.
    quiet_update(root, desc("tip2")).unwrap();
    flush_pending_work().unwrap();
    let ops = journal.take();
    assert_eq!(ops.len(), 1);
    assert!(matches!(ops[0], HostOp::SetProps { .. }));
    unmount(root).unwrap();
}
