//! Error taxonomy for the reconciler.
//!
//! Four classes of failure, each with a distinct policy:
//!
//! - **Construction**: a malformed description. Fatal, surfaced synchronously
//!   at the `mount`/`update` call that produced it. Never queued.
//! - **Callback**: a lifecycle/effect callback failed. Routed to the nearest
//!   ancestor error boundary; fatal only when no boundary exists.
//! - **Host**: the host-mutation capability set itself failed. Always fatal;
//!   the reconciler cannot verify host-side invariants and must not mask them.
//! - **StaleRoot**: an operation against a root that was already unmounted.
//!
//! Diff invariant violations (duplicate sibling keys and the like) are *not*
//! errors: they go through the `log` diagnostic channel and reconciliation
//! proceeds with a positional fallback.

use thiserror::Error;

use crate::host::HostHandle;
use crate::root::RootId;

/// Error raised by a lifecycle or effect callback.
///
/// Callbacks are fallible rather than panicking: a `did_mount` hook that
/// cannot do its work returns one of these, and the commit pipeline routes it
/// to the nearest ancestor error boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    /// Create a callback error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message this error was created with.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error raised by the host-mutation layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    /// The backend was handed a handle it never issued (or already released).
    #[error("unknown host handle {0:?}")]
    UnknownHandle(HostHandle),
    /// Any other backend-reported failure.
    #[error("host backend error: {0}")]
    Backend(String),
}

/// Top-level error type returned by the public reconciler operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A malformed description (empty host tag, text node with children, ...).
    ///
    /// These are programmer errors and are reported synchronously from the
    /// call that supplied the description; nothing is enqueued.
    #[error("invalid description: {0}")]
    Construction(String),

    /// A lifecycle callback failed with no error boundary above it.
    ///
    /// Host mutations already applied before the failure are not rolled
    /// back; the displayed tree may be partially updated.
    #[error("lifecycle callback failed outside any error boundary: {0}")]
    Callback(#[from] CallbackError),

    /// The host-mutation layer failed.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The root handle does not refer to a live mount.
    #[error("stale root handle {0:?}")]
    StaleRoot(RootId),
}

impl ReconcileError {
    /// Shorthand for a construction error.
    pub(crate) fn construction(message: impl Into<String>) -> Self {
        Self::Construction(message.into())
    }
}
