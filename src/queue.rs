//! Priority task queue for pending units of reconciliation work.
//!
//! Tasks carry a numeric `order` (lower runs first) and a monotonically
//! increasing `id` used as a stable tie-breaker, so two tasks of equal order
//! execute in creation order. The queue is a sorted `Vec` with binary-search
//! insertion; at the expected scale (tens of pending tasks) the O(n) splice
//! is cheaper than heap bookkeeping, and arbitrary removal stays simple.
//!
//! Operations on an empty queue return `None`, never panic.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::element::Element;
use crate::root::RootId;

/// Default order for renders requested outside any urgency scope.
pub const ORDER_DEFAULT: i32 = 100;

/// Order for work that must run ahead of normal renders (event responses,
/// synchronous flushes).
pub const ORDER_IMMEDIATE: i32 = 0;

/// Order for work that can wait behind everything else.
pub const ORDER_IDLE: i32 = 1_000;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic task identity; allocation order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw monotonic value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// What a popped task does.
pub enum TaskPayload {
    /// Reconcile `root` against a new description.
    Render {
        /// Target root.
        root: RootId,
        /// The new description to diff against the committed tree.
        description: Element,
    },
    /// Run an arbitrary closure (effects scheduled as follow-up work).
    Callback(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPayload::Render { root, .. } => f.debug_tuple("Render").field(root).finish(),
            TaskPayload::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A scheduled unit of work.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    order: i32,
    payload: TaskPayload,
}

impl Task {
    /// Create a render task for a root.
    pub fn render(order: i32, root: RootId, description: Element) -> Self {
        Self {
            id: TaskId::next(),
            order,
            payload: TaskPayload::Render { root, description },
        }
    }

    /// Create a closure task.
    pub fn callback(order: i32, f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: TaskId::next(),
            order,
            payload: TaskPayload::Callback(Box::new(f)),
        }
    }

    /// The task's identity.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's priority order (lower sorts first).
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Consume the task, yielding its payload.
    pub fn into_payload(self) -> TaskPayload {
        self.payload
    }

    fn sort_key(&self) -> (i32, u64) {
        (self.order, self.id.0)
    }

    fn targets_root(&self, root: RootId) -> bool {
        matches!(self.payload, TaskPayload::Render { root: r, .. } if r == root)
    }
}

/// Ordered collection of pending tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Vec<Task>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task at its sorted position.
    ///
    /// Binary search for the first element not less than the task by
    /// `(order, id)`, then splice. Ids are unique, so the search always
    /// lands between elements.
    pub fn insert(&mut self, task: Task) {
        let key = task.sort_key();
        let pos = self.tasks.partition_point(|t| t.sort_key() < key);
        self.tasks.insert(pos, task);
    }

    /// The minimum task without removing it.
    pub fn peek_min(&self) -> Option<&Task> {
        self.tasks.first()
    }

    /// Remove and return the minimum task.
    pub fn pop_min(&mut self) -> Option<Task> {
        if self.tasks.is_empty() {
            None
        } else {
            Some(self.tasks.remove(0))
        }
    }

    /// Remove a task by identity. Linear scan.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.id == id)?;
        Some(self.tasks.remove(pos))
    }

    /// Remove the queued (not-yet-started) render for `root`, if any.
    ///
    /// A newer request against a busy root supersedes the queued one; at
    /// most one render per root is ever queued, so a single removal
    /// suffices.
    pub fn remove_render_for(&mut self, root: RootId) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.targets_root(root))?;
        Some(self.tasks.remove(pos))
    }

    /// Drop every render targeting `root` (unmount cleanup).
    pub fn remove_all_for(&mut self, root: RootId) {
        self.tasks.retain(|t| !t.targets_root(root));
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Global queue instance shared by the public operations and the driver.
static TASK_QUEUE: LazyLock<Mutex<TaskQueue>> = LazyLock::new(|| Mutex::new(TaskQueue::new()));

/// Run a closure with exclusive access to the global queue.
pub(crate) fn with_task_queue<F, R>(f: F) -> R
where
    F: FnOnce(&mut TaskQueue) -> R,
{
    let mut queue = TASK_QUEUE.lock();
    f(&mut queue)
}

/// Number of tasks currently queued.
pub fn pending_task_count() -> usize {
    TASK_QUEUE.lock().len()
}

/// Serializes tests that observe or drain the global queue.
#[cfg(test)]
pub(crate) static TEST_QUEUE_LOCK: Mutex<()> = Mutex::new(());
