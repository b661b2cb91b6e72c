//! Mounted roots and the public reconciliation operations.
//!
//! A root pairs a host container with its committed tree and backend. Roots
//! live in a lock-free registry; each root's state sits behind its own mutex,
//! which is what serializes work per root: at most one render task ever
//! holds a root, while unrelated roots proceed in parallel.
//!
//! `mount` renders synchronously. `update` validates synchronously, then
//! queues a render task that carries the description itself, so enqueueing
//! never touches root state; a lifecycle callback may therefore request an
//! update for the very root being committed without deadlocking. A queued
//! render not yet started is superseded by a newer request for the same
//! root; a render already holding the root runs to completion and the newer
//! description queues behind it.
//!
//! Promotion is the last step of a successful task: superseded committed
//! entries and deleted subtrees are released, alternate links and diff flags
//! cleared, and the work-in-progress root becomes the committed root. A
//! failed diff releases only its own work-in-progress nodes; readers of the
//! committed tree never observe a half-reconciled state.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};

use papaya::HashMap as PapayaHashMap;
use parking_lot::Mutex;

use crate::arena::NodeId;
use crate::commit;
use crate::diff::{self, DiffCx};
use crate::element::{Element, ElementKind};
use crate::error::ReconcileError;
use crate::host::{HostBackend, HostHandle};
use crate::mode::{self, ExecuteMode, ModeGuard};
use crate::queue::{self, ORDER_DEFAULT, Task, TaskPayload};
use crate::scheduler::{self, TimeSlice};

static NEXT_ROOT_ID: AtomicU32 = AtomicU32::new(1);

/// Handle to a mounted root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u32);

impl RootId {
    fn next() -> Self {
        Self(NEXT_ROOT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw registry value.
    pub fn raw(self) -> u32 {
        self.0
    }
}

struct RootState {
    container: HostHandle,
    backend: Box<dyn HostBackend>,
    current: Option<NodeId>,
}

/// Live roots. Reads are lock-free; per-root work serializes on the inner
/// mutex.
static ROOTS: LazyLock<PapayaHashMap<RootId, Mutex<RootState>>> =
    LazyLock::new(PapayaHashMap::new);

fn validate_root_description(description: &Element) -> Result<(), ReconcileError> {
    description.validate()?;
    if matches!(description.kind(), ElementKind::Empty) {
        return Err(ReconcileError::construction(
            "an empty description cannot occupy a root; use unmount",
        ));
    }
    Ok(())
}

/// Mount `description` into `container`, rendering synchronously.
///
/// Returns a handle for subsequent [`update`]/[`unmount`] calls. A malformed
/// description or a failing initial commit leaves nothing mounted.
pub fn mount(
    description: Element,
    container: HostHandle,
    backend: Box<dyn HostBackend>,
) -> Result<RootId, ReconcileError> {
    validate_root_description(&description)?;

    let root = RootId::next();
    ROOTS.pin().insert(
        root,
        Mutex::new(RootState {
            container,
            backend,
            current: None,
        }),
    );

    let result = {
        let _sync = ModeGuard::enter(ExecuteMode::SYNC);
        render_root(root, &description)
    };
    if let Err(error) = result {
        ROOTS.pin().remove(&root);
        return Err(error);
    }

    // Renders requested from inside the initial mount were queued while a
    // mode was active; hand them to the driver now.
    if queue::pending_task_count() > 0 {
        scheduler::request_callback(|slice| drive_queue(slice));
    }
    Ok(root)
}

/// Request that `root` reconcile toward `description`.
///
/// Validation is synchronous; the render itself is queued at default order
/// and runs when the driver or a flush gets to it.
pub fn update(root: RootId, description: Element) -> Result<(), ReconcileError> {
    validate_root_description(&description)?;
    if !ROOTS.pin().contains_key(&root) {
        return Err(ReconcileError::StaleRoot(root));
    }

    queue::with_task_queue(|queue| {
        if queue.remove_render_for(root).is_some() {
            cov_mark::hit!(superseded_queued_render);
            log::debug!("superseding queued render for {root:?}");
        }
        queue.insert(Task::render(ORDER_DEFAULT, root, description));
    });

    // When no pass is active on this thread, arm the driver; otherwise the
    // active pass (or its driver) drains the queue.
    if !mode::is_any_active() {
        scheduler::request_callback(|slice| drive_queue(slice));
    }
    Ok(())
}

/// Queue an arbitrary closure at the given order.
///
/// Effects scheduled as follow-up work go through the same queue as renders
/// and interleave by order.
pub fn schedule_callback(order: i32, f: impl FnOnce() + Send + 'static) {
    queue::with_task_queue(|queue| queue.insert(Task::callback(order, f)));
    if !mode::is_any_active() {
        scheduler::request_callback(|slice| drive_queue(slice));
    }
}

/// Tear down `root`: unmount callbacks bottom-up, detach its host content,
/// release its tree, and drop its queued work.
pub fn unmount(root: RootId) -> Result<(), ReconcileError> {
    queue::with_task_queue(|queue| queue.remove_all_for(root));

    let roots = ROOTS.pin();
    let Some(state) = roots.get(&root) else {
        return Err(ReconcileError::StaleRoot(root));
    };

    let result = {
        let mut state = state.lock();
        let _sync = ModeGuard::enter(ExecuteMode::SYNC);
        match state.current.take() {
            Some(current) => {
                let container = state.container;
                let outcome = commit::teardown_root(current, container, state.backend.as_mut());
                crate::arena::release_subtree(current);
                outcome
            }
            None => Ok(()),
        }
    };

    roots.remove(&root);
    // An unmount callback error still unmounts; the caller learns about it
    // after the cleanup is complete.
    result
}

/// Synchronously drain the task queue on the calling thread.
///
/// Returns the number of tasks processed. Work enqueued by the processed
/// tasks themselves (effects, cascading updates) is drained in the same
/// call. A flush requested from inside an in-flight pass (a render producing
/// descriptions, a commit running callbacks, the driver) is a no-op; that
/// pass holds root state the popped tasks would need, and the queued work
/// runs as soon as it completes. Flushing from an event-response scope is
/// fine.
pub fn flush_pending_work() -> Result<usize, ReconcileError> {
    if mode::is_active(ExecuteMode::RENDER | ExecuteMode::SYNC | ExecuteMode::ASYNC) {
        cov_mark::hit!(flush_deferred_mid_pass);
        log::debug!("flush requested mid-pass; leaving work queued");
        return Ok(0);
    }

    let _sync = ModeGuard::enter_exclusive(ExecuteMode::SYNC);
    let mut processed = 0;
    while let Some(task) = queue::with_task_queue(|queue| queue.pop_min()) {
        process_task(task)?;
        processed += 1;
    }
    Ok(processed)
}

/// Most recent error reported by a driver-processed task. The driver has no
/// caller to return to, so the error is parked here for the host to poll.
static LAST_DRIVER_ERROR: Mutex<Option<ReconcileError>> = Mutex::new(None);

/// Take the most recent error a driver-processed task reported, if any.
///
/// Synchronous entry points ([`mount`], [`flush_pending_work`]) return their
/// errors directly; tasks the background driver processes have no caller, so
/// their failures land here after being logged. Taking clears the slot.
pub fn take_last_driver_error() -> Option<ReconcileError> {
    LAST_DRIVER_ERROR.lock().take()
}

/// The driver body handed to the scheduler: process queued tasks until the
/// slice expires, reporting whether work remains.
fn drive_queue(slice: &TimeSlice) -> bool {
    let _driver = ModeGuard::enter(ExecuteMode::ASYNC);
    loop {
        let Some(task) = queue::with_task_queue(|queue| queue.pop_min()) else {
            return false;
        };
        // A failed task must not wedge the driver; later tasks and other
        // roots still run. The error stays observable through
        // take_last_driver_error.
        if let Err(error) = process_task(task) {
            log::error!("queued task failed: {error}");
            *LAST_DRIVER_ERROR.lock() = Some(error);
        }
        if slice.expired() {
            return !queue::with_task_queue(|queue| queue.is_empty());
        }
    }
}

fn process_task(task: Task) -> Result<(), ReconcileError> {
    match task.into_payload() {
        TaskPayload::Render { root, description } => render_root(root, &description),
        TaskPayload::Callback(f) => {
            f();
            Ok(())
        }
    }
}

/// One full render pass for a root: diff, commit, promote.
fn render_root(root: RootId, description: &Element) -> Result<(), ReconcileError> {
    let roots = ROOTS.pin();
    let Some(state) = roots.get(&root) else {
        // The root was unmounted after this task was queued.
        return Err(ReconcileError::StaleRoot(root));
    };
    let mut state = state.lock();

    let mut cx = DiffCx::new();
    let wip = match diff::reconcile_root(state.current, description, &mut cx) {
        Ok(wip) => wip,
        Err(error) => {
            // Abandon the work-in-progress tree; the committed tree is
            // untouched and stays live.
            cx.release_created();
            return Err(error);
        }
    };

    let container = state.container;
    let result = commit::commit_root(wip, container, state.backend.as_mut());
    // Host mutations are not rolled back on a late failure, so the
    // work-in-progress tree is the closest description of host state either
    // way. Promote, then surface the error.
    promote(&mut state, wip);
    result
}

/// Make `wip` the committed tree: release superseded and deleted entries,
/// clear diff bookkeeping.
fn promote(state: &mut RootState, wip: NodeId) {
    let mut stack = vec![wip];
    while let Some(node) = stack.pop() {
        let deletions = node
            .with_mut(|meta| std::mem::take(&mut meta.deletions))
            .unwrap_or_default();
        for deleted in deletions {
            crate::arena::release_subtree(deleted);
        }
        if let Some(alternate) = node.with_mut(|meta| meta.alternate.take()).flatten() {
            crate::arena::node_arena_remove(alternate);
        }
        node.clear_flags();
        stack.extend(node.children());
    }
    state.current = Some(wip);
}

/// The committed root node for `root`, if it is live. Test observability.
#[cfg(test)]
pub(crate) fn committed_root(root: RootId) -> Option<NodeId> {
    ROOTS.pin().get(&root).and_then(|state| state.lock().current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Component, Props};
    use crate::host::RecordingHost;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn container() -> HostHandle {
        HostHandle::from_raw(0)
    }

    #[test]
    fn mount_assigns_distinct_roots() {
        let _serial = queue::TEST_QUEUE_LOCK.lock();
        let a = mount(
            Element::host("app"),
            container(),
            Box::new(RecordingHost::new()),
        )
        .unwrap();
        let b = mount(
            Element::host("app"),
            container(),
            Box::new(RecordingHost::new()),
        )
        .unwrap();
        assert_ne!(a, b);
        unmount(a).unwrap();
        unmount(b).unwrap();
    }

    #[test]
    fn operations_on_unmounted_root_report_stale() {
        let _serial = queue::TEST_QUEUE_LOCK.lock();
        let root = mount(
            Element::host("app"),
            container(),
            Box::new(RecordingHost::new()),
        )
        .unwrap();
        unmount(root).unwrap();

        assert!(matches!(
            update(root, Element::host("app")),
            Err(ReconcileError::StaleRoot(r)) if r == root
        ));
        assert!(matches!(
            unmount(root),
            Err(ReconcileError::StaleRoot(r)) if r == root
        ));
    }

    #[test]
    fn empty_description_is_rejected_at_the_root() {
        let _serial = queue::TEST_QUEUE_LOCK.lock();
        let result = mount(Element::empty(), container(), Box::new(RecordingHost::new()));
        assert!(matches!(result, Err(ReconcileError::Construction(_))));
    }

    #[test]
    fn driver_resumes_across_expired_slices() {
        let _serial = queue::TEST_QUEUE_LOCK.lock();
        let _slot = scheduler::TEST_DRIVER_LOCK.lock();

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let _event = ModeGuard::enter(ExecuteMode::EVENT);
            for _ in 0..4 {
                let ran = ran.clone();
                schedule_callback(ORDER_DEFAULT, move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        assert_eq!(queue::pending_task_count(), 4);

        // A zero budget expires after every task, so each invocation hands
        // control back with work remaining and the driver is re-armed.
        let invocations = Arc::new(AtomicUsize::new(0));
        let counted = invocations.clone();
        scheduler::request_callback(move |slice| {
            counted.fetch_add(1, Ordering::Relaxed);
            drive_queue(slice)
        });
        scheduler::drive_to_completion(Duration::ZERO);

        assert_eq!(ran.load(Ordering::Relaxed), 4);
        assert_eq!(invocations.load(Ordering::Relaxed), 4);
        assert!(!scheduler::has_pending_driver());
        assert_eq!(queue::pending_task_count(), 0);
    }

    #[test]
    fn failed_queued_render_parks_its_error_for_polling() {
        let _serial = queue::TEST_QUEUE_LOCK.lock();
        let _slot = scheduler::TEST_DRIVER_LOCK.lock();
        let _ = take_last_driver_error();

        struct BadRender;
        impl Component for BadRender {
            fn render(&self, _props: &Props) -> Element {
                // Malformed output: text nodes cannot have children.
                Element::text("x").child(Element::text("y"))
            }
        }

        let root = mount(
            Element::host("app"),
            container(),
            Box::new(RecordingHost::new()),
        )
        .unwrap();
        update(
            root,
            Element::host("app").children([Element::component(Arc::new(BadRender))]),
        )
        .unwrap();

        // The update armed the driver; running it swallows the task failure
        // but parks the error.
        scheduler::drive_to_completion(scheduler::DEFAULT_BUDGET);
        assert!(matches!(
            take_last_driver_error(),
            Some(ReconcileError::Construction(_))
        ));
        assert!(take_last_driver_error().is_none());
        assert_eq!(queue::pending_task_count(), 0);
        unmount(root).unwrap();
    }

    #[test]
    fn malformed_description_is_rejected_before_queueing() {
        let _serial = queue::TEST_QUEUE_LOCK.lock();
        let root = mount(
            Element::host("app"),
            container(),
            Box::new(RecordingHost::new()),
        )
        .unwrap();

        // Text nodes cannot have children.
        let bad = Element::text("x").child(Element::text("y"));
        assert!(matches!(
            update(root, bad),
            Err(ReconcileError::Construction(_))
        ));
        assert_eq!(queue::pending_task_count(), 0);
        unmount(root).unwrap();
    }
}
