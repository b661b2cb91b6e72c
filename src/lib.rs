#![deny(missing_docs)]

//! Incremental tree reconciliation with a cooperative priority scheduler.
//!
//! You describe the tree you want as lightweight [`Element`] values; the
//! reconciler diffs that description against what is already committed,
//! computes a minimal edit (additions, prop updates, moves, deletions), and
//! applies it through a small host-mutation trait. Work runs as prioritized
//! tasks that a cooperative driver processes in time slices, so large
//! updates never monopolize the hosting thread.
//!
//! # Quick Start
//!
//! ```ignore
//! use abgleich::{Element, HostHandle, RecordingHost, mount, update, flush_pending_work};
//!
//! let backend = RecordingHost::new();
//! let journal = backend.journal();
//! let container = HostHandle::from_raw(0);
//!
//! // Initial mount renders synchronously.
//! let root = mount(
//!     Element::host("app").children([Element::text("hello")]),
//!     container,
//!     Box::new(backend),
//! )?;
//!
//! // Updates queue a render task...
//! update(root, Element::host("app").children([Element::text("world")]))?;
//! // ...drained by the driver loop, or synchronously:
//! flush_pending_work()?;
//!
//! assert!(!journal.ops().is_empty());
//! ```
//!
//! # Core Types
//!
//! - [`Element`] - Immutable tree description: host nodes, text, components,
//!   fragments, portals, providers/consumers.
//! - [`Component`] - Composite behavior: a render function plus fallible
//!   lifecycle hooks and optional error-boundary handling.
//! - [`HostBackend`] - The five host mutations the commit pipeline needs.
//! - [`RecordingHost`] / [`Journal`] - A backend that journals mutations,
//!   for harnesses and tests.
//!
//! # Scheduling
//!
//! Renders queue as tasks ordered by `(order, creation)`; lower order runs
//! first and ties run in creation order. A background [`DriverLoop`] invokes
//! the registered driver once per macrotask boundary with a [`TimeSlice`]
//! budget; hosts without a loop thread call [`flush_pending_work`] instead.
//! A newer `update` for a root supersedes that root's queued render; a
//! render already running completes, and the newer description queues
//! behind it.
//!
//! ```ignore
//! DriverLoop::new().budget(Duration::from_millis(8)).spawn();
//! ```
//!
//! # Errors
//!
//! Malformed descriptions fail synchronously at [`mount`]/[`update`].
//! Lifecycle callbacks return [`CallbackError`] and route to the nearest
//! ancestor component with [`Component::catches_errors`]; unhandled ones
//! fail the task. [`HostError`]s are always fatal to the in-flight commit.
//! Tasks the background driver processes have no caller; their failures are
//! logged and parked for [`take_last_driver_error`].

// Internal modules
pub(crate) mod arena;
mod commit;
mod diff;
mod element;
mod error;
mod hash;
mod host;
mod mode;
mod queue;
mod root;
mod scheduler;

// Descriptions and composite behavior
pub use element::{
    Component, ContextId, ConsumerRender, Element, ElementKind, LazyComponent, PropValue, Props,
};

// Host-mutation capability set
pub use host::{HostBackend, HostCreation, HostHandle, HostOp, Journal, PropChange, RecordingHost};

// Errors
pub use error::{CallbackError, HostError, ReconcileError};

// Public operations
pub use root::{
    RootId, flush_pending_work, mount, schedule_callback, take_last_driver_error, unmount, update,
};

// Task queue and priority constants
pub use queue::{
    ORDER_DEFAULT, ORDER_IDLE, ORDER_IMMEDIATE, Task, TaskId, TaskPayload, TaskQueue,
    pending_task_count,
};

// Execute-mode tracking
pub use mode::{ExecuteMode, ModeGuard, is_active, is_any_active, restore, scoped, snapshot};

// Cooperative scheduler (for custom event loops)
pub use scheduler::{
    DEFAULT_BUDGET, DriverLoop, TimeSlice, drive_to_completion, has_pending_driver,
    notify_driver_loop, request_callback, ticks_crossed,
};

#[cfg(test)]
mod tests;
