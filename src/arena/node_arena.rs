// Node arena - storage for node descriptors.
//
// This module defines NodeMeta (one reconciled tree position), NodeId, and
// helper functions for working with the global node arena.
//
// DUAL-TREE MODEL:
// - The committed tree is the set of nodes reachable from a root's current id
// - A work-in-progress tree is built per task, with each reused node keeping
//   an `alternate` back-reference to its committed counterpart
// - Promotion repoints the root at the work-in-progress id and releases the
//   superseded committed entries; the alternate link never outlives a commit,
//   so the current/previous pair is the longest alternate chain possible

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use slab::Slab;

use crate::element::{Component, ConsumerRender, ContextId, LazyComponent, PropValue, Props};
use crate::host::{HostHandle, PropChange};

/// Global node arena - stores every node descriptor, committed or in flight.
static NODE_ARENA: RwLock<Slab<NodeMeta>> = RwLock::new(Slab::new());

bitflags! {
    /// Structural-effect markers attached during diffing, consumed during
    /// commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Fresh mount: the node has no committed counterpart.
        const ADDITION = 1 << 0;
        /// In-place update: props or text content changed.
        const UPDATE = 1 << 1;
        /// Reused node landing at a different sibling position.
        const MOVE = 1 << 2;
        /// The committed node leaves the tree this commit.
        const DELETION = 1 << 3;
        /// A lifecycle callback is queued for the post-mutation flush.
        const CALLBACKS = 1 << 4;
    }
}

/// Per-node lifetime state machine.
///
/// `Unmounting` is terminal-bound: a node never returns to `Mounted` from
/// it. A logically recreated node at the same position is a new descriptor
/// with no shared identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet part of any committed tree.
    Unmounted,
    /// Addition flagged; mutations for it are being applied.
    Mounting,
    /// Part of the committed tree.
    Mounted,
    /// Update flagged; repeatable.
    Updating,
    /// Deletion flagged; teardown in progress.
    Unmounting,
}

impl LifecycleState {
    /// Whether `next` is a legal successor state.
    fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Unmounted, Mounting)
                | (Mounting, Mounted)
                | (Mounted, Updating)
                | (Updating, Mounted)
                | (Mounted, Unmounting)
                | (Updating, Unmounting)
                | (Mounting, Unmounting)
                | (Unmounting, Unmounted)
        )
    }
}

/// Discriminant of a node descriptor, mirroring the element kinds that
/// produce nodes. Matched exhaustively in every pass so adding a kind is a
/// compile error until each pass handles it.
#[derive(Clone)]
pub enum NodeKind {
    /// Host element with a tag.
    Host {
        /// Host tag name.
        tag: String,
    },
    /// Host text leaf.
    Text {
        /// Current content.
        value: String,
    },
    /// Composite component.
    Component {
        /// The implementation; identity is the `Arc` allocation.
        component: Arc<dyn Component>,
    },
    /// Lazily resolved composite. The placeholder stays diff-compatible with
    /// its resolved component.
    Lazy {
        /// The two-state loader.
        lazy: Arc<LazyComponent>,
    },
    /// Groups children without a host instance.
    Fragment,
    /// Commits children under an alternate container.
    Portal {
        /// Target container.
        container: HostHandle,
    },
    /// Provides a context value to the subtree.
    Provider {
        /// Context channel.
        context: ContextId,
        /// Provided value.
        value: PropValue,
    },
    /// Renders from the nearest provided value.
    Consumer {
        /// Context channel.
        context: ContextId,
        /// Subtree producer.
        render: ConsumerRender,
    },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Host { tag } => write!(f, "Host({tag})"),
            NodeKind::Text { value } => write!(f, "Text({value:?})"),
            NodeKind::Component { .. } => f.write_str("Component"),
            NodeKind::Lazy { lazy } => write!(f, "Lazy(resolved={})", lazy.resolved().is_some()),
            NodeKind::Fragment => f.write_str("Fragment"),
            NodeKind::Portal { container } => write!(f, "Portal({container:?})"),
            NodeKind::Provider { context, .. } => write!(f, "Provider({context:?})"),
            NodeKind::Consumer { context, .. } => write!(f, "Consumer({context:?})"),
        }
    }
}

/// One reconciled tree position.
pub struct NodeMeta {
    /// Tag discriminant plus kind-specific payload.
    pub kind: NodeKind,
    /// Explicit list key, if the description carried one.
    pub key: Option<String>,
    /// Committed props payload.
    pub props: Props,
    /// Parent node, `None` at a root.
    pub parent: Option<NodeId>,
    /// Ordered child ids.
    pub children: Vec<NodeId>,
    /// The previous-commit counterpart while a work-in-progress tree is in
    /// flight. Cleared at promotion.
    pub alternate: Option<NodeId>,
    /// Structural-effect markers for the pending commit.
    pub flags: NodeFlags,
    /// Host instance once mounted. Only host and text nodes carry one.
    pub host: Option<HostHandle>,
    /// Lifetime state.
    pub lifecycle: LifecycleState,
    /// Committed children leaving the tree under this parent. Recorded
    /// during diffing, applied during commit.
    pub deletions: Vec<NodeId>,
    /// Prop change set computed by the diff, consumed by the commit.
    pub pending_props: Vec<PropChange>,
}

impl NodeMeta {
    /// A fresh descriptor with no flags and no relationships.
    pub fn new(kind: NodeKind, key: Option<String>, props: Props) -> Self {
        Self {
            kind,
            key,
            props,
            parent: None,
            children: Vec::new(),
            alternate: None,
            flags: NodeFlags::empty(),
            host: None,
            lifecycle: LifecycleState::Unmounted,
            deletions: Vec::new(),
            pending_props: Vec::new(),
        }
    }
}

impl fmt::Debug for NodeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeMeta")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("children", &self.children)
            .field("flags", &self.flags)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

/// Unique identifier for a node descriptor in the arena.
///
/// A zero-cost wrapper around a slab index. Once a node is released the id
/// is stale; accessing a stale NodeId returns `None`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    /// Wrap a raw slab index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the node metadata read-only.
    ///
    /// Returns `None` if the node has been released (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&NodeMeta) -> R,
    {
        let arena = NODE_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Access the node metadata mutably.
    ///
    /// Returns `None` on stale access. The closure must not touch the arena
    /// through other NodeIds; the write lock is held for its duration.
    pub fn with_mut<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut NodeMeta) -> R,
    {
        let mut arena = NODE_ARENA.write();
        arena.get_mut(self.index()).map(f)
    }

    /// Clone of the node's kind.
    pub fn kind(self) -> Option<NodeKind> {
        self.with(|meta| meta.kind.clone())
    }

    /// Clone of the node's explicit key.
    pub fn key(self) -> Option<String> {
        self.with(|meta| meta.key.clone()).flatten()
    }

    /// Clone of the node's ordered child list.
    pub fn children(self) -> Vec<NodeId> {
        self.with(|meta| meta.children.clone())
            .unwrap_or_default()
    }

    /// The node's parent, `None` at a root (or on stale access).
    pub fn parent(self) -> Option<NodeId> {
        self.with(|meta| meta.parent).flatten()
    }

    /// Current structural flags; empty on stale access.
    pub fn flags(self) -> NodeFlags {
        self.with(|meta| meta.flags).unwrap_or(NodeFlags::empty())
    }

    /// Set additional flags.
    pub fn add_flags(self, flags: NodeFlags) {
        self.with_mut(|meta| meta.flags |= flags);
    }

    /// Clear all flags (commit consumed them).
    pub fn clear_flags(self) {
        self.with_mut(|meta| meta.flags = NodeFlags::empty());
    }

    /// The mounted host instance, if any.
    pub fn host(self) -> Option<HostHandle> {
        self.with(|meta| meta.host).flatten()
    }

    /// Record the mounted host instance.
    pub fn set_host(self, handle: HostHandle) {
        self.with_mut(|meta| meta.host = Some(handle));
    }

    /// The committed counterpart while in flight.
    pub fn alternate(self) -> Option<NodeId> {
        self.with(|meta| meta.alternate).flatten()
    }

    /// Advance the lifetime state machine.
    ///
    /// Illegal transitions (anything out of `Unmounting` except release) are
    /// a reconciler bug; debug builds assert on them.
    pub fn set_lifecycle(self, next: LifecycleState) {
        self.with_mut(|meta| {
            debug_assert!(
                meta.lifecycle.can_advance_to(next) || meta.lifecycle == next,
                "illegal lifecycle transition {:?} -> {:?}",
                meta.lifecycle,
                next
            );
            meta.lifecycle = next;
        });
    }

    /// Clone of the parent-carried deletion list.
    pub fn deletions(self) -> Vec<NodeId> {
        self.with(|meta| meta.deletions.clone())
            .unwrap_or_default()
    }

    /// Take the diff-computed prop change set, leaving it empty.
    pub fn take_pending_props(self) -> Vec<PropChange> {
        self.with_mut(|meta| std::mem::take(&mut meta.pending_props))
            .unwrap_or_default()
    }
}

/// Insert a node into the arena and return its id.
pub fn node_arena_insert(meta: NodeMeta) -> NodeId {
    let mut arena = NODE_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(meta);
    NodeId::new(key as u32)
}

/// Remove a node from the arena.
pub fn node_arena_remove(id: NodeId) -> Option<NodeMeta> {
    let mut arena = NODE_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

/// Release a node and its entire subtree, including any recorded deletions.
pub fn release_subtree(id: NodeId) {
    let (children, deletions) = match id.with(|meta| (meta.children.clone(), meta.deletions.clone()))
    {
        Some(lists) => lists,
        None => return,
    };
    for child in children {
        release_subtree(child);
    }
    for deleted in deletions {
        release_subtree(deleted);
    }
    node_arena_remove(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(value: &str) -> NodeMeta {
        NodeMeta::new(
            NodeKind::Text {
                value: value.to_owned(),
            },
            None,
            Props::new(),
        )
    }

    // Freed slab indices are recycled, so a released id may point at a later
    // test's node. Probing for a sentinel value instead of presence keeps
    // these assertions stable under concurrent tests.
    fn holds_text(id: NodeId, sentinel: &str) -> bool {
        id.with(|meta| matches!(&meta.kind, NodeKind::Text { value } if value == sentinel))
            .unwrap_or(false)
    }

    #[test]
    fn stale_access_returns_none() {
        let never_allocated = NodeId::new(u32::MAX - 1);
        assert!(never_allocated.with(|_| ()).is_none());
        assert_eq!(never_allocated.flags(), NodeFlags::empty());
        assert!(never_allocated.children().is_empty());

        let id = node_arena_insert(leaf("stale-probe"));
        assert!(holds_text(id, "stale-probe"));
        node_arena_remove(id);
        assert!(!holds_text(id, "stale-probe"));
    }

    #[test]
    fn release_subtree_removes_children_and_deletions() {
        let child = node_arena_insert(leaf("release-child"));
        let doomed = node_arena_insert(leaf("release-doomed"));
        let parent = node_arena_insert(NodeMeta::new(
            NodeKind::Host { tag: "row".into() },
            None,
            Props::new(),
        ));
        parent.with_mut(|meta| {
            meta.children.push(child);
            meta.deletions.push(doomed);
        });

        release_subtree(parent);
        assert!(!holds_text(child, "release-child"));
        assert!(!holds_text(doomed, "release-doomed"));
    }

    #[test]
    fn lifecycle_never_leaves_unmounting_for_mounted() {
        assert!(!LifecycleState::Unmounting.can_advance_to(LifecycleState::Mounted));
        assert!(LifecycleState::Unmounting.can_advance_to(LifecycleState::Unmounted));
        assert!(LifecycleState::Mounted.can_advance_to(LifecycleState::Updating));
    }

    #[test]
    fn flags_accumulate_and_clear() {
        let id = node_arena_insert(leaf("f"));
        id.add_flags(NodeFlags::UPDATE);
        id.add_flags(NodeFlags::MOVE);
        assert!(id.flags().contains(NodeFlags::UPDATE | NodeFlags::MOVE));

        id.clear_flags();
        assert_eq!(id.flags(), NodeFlags::empty());
        node_arena_remove(id);
    }
}
