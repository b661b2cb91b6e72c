//! The host-mutation capability set.
//!
//! The commit pipeline materializes committed changes through a small trait
//! of mutation operations. The reconciler is agnostic to what a
//! [`HostHandle`] represents (a retained-mode UI node, a terminal cell, a
//! native widget) as long as these operations are available and idempotent
//! when handed already-correct state.
//!
//! Text content updates travel through [`HostBackend::apply_prop_changes`]
//! as a change to the reserved `"text"` prop; there is deliberately no sixth
//! operation for them.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::element::{PropValue, Props};
use crate::error::HostError;

/// Opaque handle to a host-side instance.
///
/// Minted by the backend from [`HostBackend::create_instance`]; the
/// reconciler only stores and passes these back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandle(u64);

impl HostHandle {
    /// Wrap a raw backend-issued value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw backend-issued value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// One prop mutation: `value = None` means the prop was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct PropChange {
    /// Prop name (`"text"` is reserved for text-node content).
    pub name: String,
    /// New value, or `None` for removal.
    pub value: Option<PropValue>,
}

/// What [`HostBackend::create_instance`] is asked to build.
#[derive(Debug)]
pub enum HostCreation<'a> {
    /// A host element with a tag and initial props.
    Element {
        /// Host tag name.
        tag: &'a str,
        /// Initial props.
        props: &'a Props,
    },
    /// A host text leaf.
    Text {
        /// Initial content.
        value: &'a str,
    },
}

/// The capability set the commit pipeline invokes.
///
/// Every operation is fallible, and any failure is fatal to the in-flight
/// commit: the reconciler has no way to verify host-side invariants and must
/// not mask a broken backend.
pub trait HostBackend: Send {
    /// Create a host instance for a newly mounted node.
    fn create_instance(&mut self, creation: HostCreation<'_>) -> Result<HostHandle, HostError>;

    /// Append `child` as the last child of `parent`.
    fn append_child(&mut self, parent: HostHandle, child: HostHandle) -> Result<(), HostError>;

    /// Insert `child` into `parent` immediately before `reference`.
    ///
    /// A move is realized as a single call to this with an already-attached
    /// `child`, never as a remove-then-reinsert pair.
    fn insert_before(
        &mut self,
        parent: HostHandle,
        child: HostHandle,
        reference: HostHandle,
    ) -> Result<(), HostError>;

    /// Detach `child` from `parent`.
    fn remove_child(&mut self, parent: HostHandle, child: HostHandle) -> Result<(), HostError>;

    /// Apply a prop change set to an existing instance.
    fn apply_prop_changes(
        &mut self,
        handle: HostHandle,
        changes: &[PropChange],
    ) -> Result<(), HostError>;
}

/// One journaled host mutation, as recorded by [`RecordingHost`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    /// `create_instance` for an element.
    Create {
        /// Minted handle.
        handle: HostHandle,
        /// Element tag.
        tag: String,
    },
    /// `create_instance` for a text leaf.
    CreateText {
        /// Minted handle.
        handle: HostHandle,
        /// Text content.
        value: String,
    },
    /// `append_child`.
    Append {
        /// Parent handle.
        parent: HostHandle,
        /// Child handle.
        child: HostHandle,
    },
    /// `insert_before`.
    InsertBefore {
        /// Parent handle.
        parent: HostHandle,
        /// Child handle.
        child: HostHandle,
        /// Reference sibling.
        reference: HostHandle,
    },
    /// `remove_child`.
    Remove {
        /// Parent handle.
        parent: HostHandle,
        /// Child handle.
        child: HostHandle,
    },
    /// `apply_prop_changes`.
    SetProps {
        /// Target handle.
        handle: HostHandle,
        /// Applied change set.
        changes: Vec<PropChange>,
    },
}

/// Shared view into a [`RecordingHost`]'s mutation journal.
///
/// Clone freely; all clones observe the same journal. Test harnesses keep a
/// `Journal` and hand the backend itself to [`mount`](crate::mount).
#[derive(Clone, Default)]
pub struct Journal {
    ops: Arc<Mutex<Vec<HostOp>>>,
}

impl Journal {
    /// Take all recorded operations, leaving the journal empty.
    pub fn take(&self) -> Vec<HostOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Snapshot the recorded operations without clearing them.
    pub fn ops(&self) -> Vec<HostOp> {
        self.ops.lock().clone()
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Whether nothing has been recorded (or everything was taken).
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    fn push(&self, op: HostOp) {
        self.ops.lock().push(op);
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("ops", &self.ops.lock().len())
            .finish()
    }
}

/// A backend that journals every mutation instead of touching a real host.
///
/// Handles are minted sequentially starting at 1; handle 0 is never issued,
/// so harnesses can use `HostHandle::from_raw(0)` as a container handle that
/// is guaranteed not to collide with created instances.
pub struct RecordingHost {
    next_handle: u64,
    journal: Journal,
}

impl RecordingHost {
    /// Create a recording backend with an empty journal.
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            journal: Journal::default(),
        }
    }

    /// A shared view into this backend's journal.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn mint(&mut self) -> HostHandle {
        let handle = HostHandle::from_raw(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend for RecordingHost {
    fn create_instance(&mut self, creation: HostCreation<'_>) -> Result<HostHandle, HostError> {
        let handle = self.mint();
        match creation {
            HostCreation::Element { tag, .. } => self.journal.push(HostOp::Create {
                handle,
                tag: tag.to_owned(),
            }),
            HostCreation::Text { value } => self.journal.push(HostOp::CreateText {
                handle,
                value: value.to_owned(),
            }),
        }
        Ok(handle)
    }

    fn append_child(&mut self, parent: HostHandle, child: HostHandle) -> Result<(), HostError> {
        self.journal.push(HostOp::Append { parent, child });
        Ok(())
    }

    fn insert_before(
        &mut self,
        parent: HostHandle,
        child: HostHandle,
        reference: HostHandle,
    ) -> Result<(), HostError> {
        self.journal.push(HostOp::InsertBefore {
            parent,
            child,
            reference,
        });
        Ok(())
    }

    fn remove_child(&mut self, parent: HostHandle, child: HostHandle) -> Result<(), HostError> {
        self.journal.push(HostOp::Remove { parent, child });
        Ok(())
    }

    fn apply_prop_changes(
        &mut self,
        handle: HostHandle,
        changes: &[PropChange],
    ) -> Result<(), HostError> {
        self.journal.push(HostOp::SetProps {
            handle,
            changes: changes.to_vec(),
        });
        Ok(())
    }
}
