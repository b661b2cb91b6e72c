//! Diff engine: turns a committed subtree plus a new description into a
//! flagged work-in-progress subtree.
//!
//! This is a pure data-structure transformation. No host mutation happens
//! here; the output is a tree of arena nodes whose flags (Addition, Update,
//! Move, Deletion) describe the minimal edit, consumed later by the commit
//! pipeline. An error aborts only the task that produced it: the committed
//! tree is untouched and the partially built work-in-progress nodes are
//! released.
//!
//! Children reconcile in a keyed single pass with one lookahead map:
//!
//! 1. Walk committed children and new descriptions in parallel by index
//!    while keys and types match.
//! 2. On first mismatch, map remaining committed children by `(key ?? index)`
//!    and look up each remaining description by the same identity rule.
//!    A reused child landing before an already-placed one is flagged `Move`.
//! 3. Committed children not consumed by step 2 are recorded as deletions on
//!    the parent.
//!
//! Explicit keys take precedence over position: differing keys defeat a
//! same-index type match, and a key present on exactly one side is likewise
//! a non-match; explicit identity demands explicit identity on both sides.

use std::collections::HashMap;

use crate::arena::{LifecycleState, NodeFlags, NodeId, NodeKind, NodeMeta, node_arena_insert};
use crate::element::{Element, ElementKind, PropValue, Props};
use crate::error::ReconcileError;
use crate::hash::KeyHashBuilder;
use crate::host::PropChange;
use crate::mode::{ExecuteMode, ModeGuard};

/// Reserved prop name carrying text-node content to the host layer.
pub(crate) const TEXT_PROP: &str = "text";

/// State threaded through one diff descent.
pub(crate) struct DiffCx {
    /// Provider stack: nearest value for a context is the last push.
    providers: Vec<(crate::element::ContextId, PropValue)>,
    /// Every arena node built for this task, for release on abort.
    created: Vec<NodeId>,
}

impl DiffCx {
    pub(crate) fn new() -> Self {
        Self {
            providers: Vec::new(),
            created: Vec::new(),
        }
    }

    fn lookup(&self, context: crate::element::ContextId) -> Option<PropValue> {
        self.providers
            .iter()
            .rev()
            .find(|(c, _)| *c == context)
            .map(|(_, v)| v.clone())
    }

    /// Release every node built so far. Called when a diff aborts, leaving
    /// the previously committed tree as the only live tree.
    pub(crate) fn release_created(&mut self) {
        for id in self.created.drain(..) {
            crate::arena::node_arena_remove(id);
        }
    }
}

/// Reconcile a root position: committed tree (if any) against a new
/// description. Returns the work-in-progress root.
pub(crate) fn reconcile_root(
    committed: Option<NodeId>,
    desc: &Element,
    cx: &mut DiffCx,
) -> Result<NodeId, ReconcileError> {
    match committed {
        None => create_node(desc, cx),
        Some(current) if same_type(current, desc) => reuse_node(current, desc, cx),
        Some(current) => {
            // Type changed at the root: fresh mount plus deletion of the
            // whole previous tree, carried on the new root.
            let wip = create_node(desc, cx)?;
            current.add_flags(NodeFlags::DELETION);
            wip.with_mut(|meta| meta.deletions.push(current));
            Ok(wip)
        }
    }
}

/// Diff-compatibility check: identical type keys, or a lazy-resolved
/// placeholder whose resolved component equals the new component.
pub(crate) fn same_type(committed: NodeId, desc: &Element) -> bool {
    let Some(kind) = committed.kind() else {
        return false;
    };
    match (&kind, desc.kind()) {
        (NodeKind::Host { tag }, ElementKind::Host { tag: new_tag }) => tag == new_tag,
        (NodeKind::Text { .. }, ElementKind::Text { .. }) => true,
        (NodeKind::Component { component }, ElementKind::Component { component: new }) => {
            std::sync::Arc::ptr_eq(component, new)
        }
        (NodeKind::Lazy { lazy }, ElementKind::Lazy { lazy: new }) => {
            std::sync::Arc::ptr_eq(lazy, new)
        }
        (NodeKind::Lazy { lazy }, ElementKind::Component { component: new }) => {
            // A resolved placeholder still compares equal to its concrete
            // type, so resolution does not force a remount.
            match lazy.resolved() {
                Some(resolved) if std::sync::Arc::ptr_eq(resolved, new) => {
                    cov_mark::hit!(lazy_placeholder_matches_resolved);
                    true
                }
                _ => false,
            }
        }
        (NodeKind::Fragment, ElementKind::Fragment) => true,
        (NodeKind::Portal { container }, ElementKind::Portal { container: new }) => {
            container == new
        }
        (NodeKind::Provider { context, .. }, ElementKind::Provider { context: new, .. }) => {
            context == new
        }
        (NodeKind::Consumer { context, .. }, ElementKind::Consumer { context: new, .. }) => {
            context == new
        }
        _ => false,
    }
}

/// The child descriptions a node's subtree reconciles against.
///
/// Composites produce exactly one child from their render function; host
/// shapes pass their declared children through.
fn child_descriptions(
    kind: &NodeKind,
    props: &Props,
    declared: &[Element],
    cx: &DiffCx,
) -> Result<Vec<Element>, ReconcileError> {
    let rendered = match kind {
        NodeKind::Component { component } => {
            let _render = ModeGuard::enter(ExecuteMode::RENDER);
            Some(component.render(props))
        }
        NodeKind::Lazy { lazy } => {
            let component = lazy.resolve().clone();
            let _render = ModeGuard::enter(ExecuteMode::RENDER);
            Some(component.render(props))
        }
        NodeKind::Consumer { context, render } => {
            let value = cx.lookup(*context);
            let _render = ModeGuard::enter(ExecuteMode::RENDER);
            Some(render(value.as_ref()))
        }
        NodeKind::Text { .. } => return Ok(Vec::new()),
        NodeKind::Host { .. }
        | NodeKind::Fragment
        | NodeKind::Portal { .. }
        | NodeKind::Provider { .. } => None,
    };

    match rendered {
        Some(child) => {
            // Render output bypasses the entry-point validation, so check
            // it here; a malformed render is fatal to this task only.
            child.validate()?;
            Ok(vec![child])
        }
        None => Ok(declared.to_vec()),
    }
}

fn node_kind_for(desc: &Element) -> NodeKind {
    match desc.kind() {
        ElementKind::Host { tag } => NodeKind::Host { tag: tag.clone() },
        ElementKind::Text { value } => NodeKind::Text {
            value: value.clone(),
        },
        ElementKind::Component { component } => NodeKind::Component {
            component: component.clone(),
        },
        ElementKind::Lazy { lazy } => NodeKind::Lazy { lazy: lazy.clone() },
        ElementKind::Fragment => NodeKind::Fragment,
        ElementKind::Portal { container } => NodeKind::Portal {
            container: *container,
        },
        ElementKind::Provider { context, value } => NodeKind::Provider {
            context: *context,
            value: value.clone(),
        },
        ElementKind::Consumer { context, render } => NodeKind::Consumer {
            context: *context,
            render: render.clone(),
        },
        ElementKind::Empty => unreachable!("empty slots never materialize as nodes"),
    }
}

/// Push a provider's value for the duration of its subtree, if `kind` is a
/// provider. Returns whether a pop is owed.
fn push_provider(kind: &NodeKind, cx: &mut DiffCx) -> bool {
    if let NodeKind::Provider { context, value } = kind {
        cx.providers.push((*context, value.clone()));
        true
    } else {
        false
    }
}

/// Build a fresh node (and subtree) for a description with no committed
/// counterpart. Flags the node `Addition`.
fn create_node(desc: &Element, cx: &mut DiffCx) -> Result<NodeId, ReconcileError> {
    let kind = node_kind_for(desc);
    let mut meta = NodeMeta::new(kind, desc.key().map(str::to_owned), desc.props().clone());
    meta.flags = NodeFlags::ADDITION;
    let id = node_arena_insert(meta);
    cx.created.push(id);

    let kind = match id.kind() {
        Some(kind) => kind,
        None => return Err(ReconcileError::construction("node released mid-diff")),
    };
    let popped = push_provider(&kind, cx);
    let child_descs = child_descriptions(&kind, desc.props(), &desc.children, cx);
    let result = child_descs.and_then(|descs| {
        for child_desc in &descs {
            if matches!(child_desc.kind(), ElementKind::Empty) {
                // Nothing previously occupied the slot; nothing to delete.
                continue;
            }
            let child = create_node(child_desc, cx)?;
            attach_child(id, child);
        }
        Ok(())
    });
    if popped {
        cx.providers.pop();
    }
    result?;
    Ok(id)
}

/// Build a work-in-progress node reusing a committed counterpart's identity
/// and host instance. Flags `Update` only when something actually changed.
fn reuse_node(committed: NodeId, desc: &Element, cx: &mut DiffCx) -> Result<NodeId, ReconcileError> {
    let old_props = committed
        .with(|meta| meta.props.clone())
        .unwrap_or_default();

    let kind = node_kind_for(desc);
    let mut pending = Vec::new();
    let mut changed = false;
    match (&kind, committed.kind()) {
        (NodeKind::Text { value }, Some(NodeKind::Text { value: old })) => {
            if *value != old {
                pending.push(PropChange {
                    name: TEXT_PROP.to_owned(),
                    value: Some(PropValue::Str(value.clone())),
                });
                changed = true;
            }
        }
        (NodeKind::Host { .. }, _) => {
            pending = old_props.diff(desc.props());
            changed = !pending.is_empty();
        }
        (NodeKind::Provider { value, .. }, Some(NodeKind::Provider { value: old, .. })) => {
            changed = *value != old;
        }
        _ => {
            // Composites and structural nodes update when their props do;
            // the subtree re-renders either way.
            changed = old_props != *desc.props();
        }
    }

    let mut meta = NodeMeta::new(kind, desc.key().map(str::to_owned), desc.props().clone());
    meta.alternate = Some(committed);
    meta.host = committed.host();
    meta.lifecycle = LifecycleState::Mounted;
    meta.pending_props = pending;
    if changed {
        meta.flags = NodeFlags::UPDATE;
    }
    let id = node_arena_insert(meta);
    cx.created.push(id);

    let kind = match id.kind() {
        Some(kind) => kind,
        None => return Err(ReconcileError::construction("node released mid-diff")),
    };
    let popped = push_provider(&kind, cx);
    let child_descs = child_descriptions(&kind, desc.props(), &desc.children, cx);
    let result =
        child_descs.and_then(|descs| reconcile_children(id, &committed.children(), &descs, cx));
    if popped {
        cx.providers.pop();
    }
    result?;
    Ok(id)
}

fn attach_child(parent: NodeId, child: NodeId) {
    child.with_mut(|meta| meta.parent = Some(parent));
    parent.with_mut(|meta| meta.children.push(child));
}

fn mark_deleted(wip_parent: NodeId, committed_child: NodeId) {
    committed_child.add_flags(NodeFlags::DELETION);
    wip_parent.with_mut(|meta| meta.deletions.push(committed_child));
}

/// Whether a committed child and a description may pair positionally.
fn keys_allow_positional_match(committed_key: Option<&str>, desc_key: Option<&str>) -> bool {
    match (committed_key, desc_key) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => {
            // Key on exactly one side: explicit identity demands explicit
            // identity. See DESIGN.md.
            cov_mark::hit!(key_on_one_side_breaks_match);
            false
        }
    }
}

/// Identity used by the lookahead map: explicit key, or position.
#[derive(PartialEq, Eq, Hash)]
enum MapKey {
    Key(String),
    Index(usize),
}

/// Reconcile an ordered child list against new descriptions.
pub(crate) fn reconcile_children(
    wip_parent: NodeId,
    committed: &[NodeId],
    descs: &[Element],
    cx: &mut DiffCx,
) -> Result<(), ReconcileError> {
    // Highest committed index already placed in order; a reused child whose
    // old index falls below it must move.
    let mut last_placed = 0usize;

    // Phase 1: parallel walk while identities line up.
    let mut i = 0;
    while i < committed.len() && i < descs.len() {
        let desc = &descs[i];
        if matches!(desc.kind(), ElementKind::Empty) {
            // An empty slot consumes the committed occupant.
            mark_deleted(wip_parent, committed[i]);
            i += 1;
            continue;
        }
        let current = committed[i];
        let committed_key = current.key();
        if !keys_allow_positional_match(committed_key.as_deref(), desc.key()) {
            break;
        }
        if !same_type(current, desc) {
            break;
        }
        let wip = reuse_node(current, desc, cx)?;
        attach_child(wip_parent, wip);
        last_placed = i;
        i += 1;
    }

    if i >= descs.len() {
        // Descriptions exhausted: everything left is deleted.
        for &current in &committed[i.min(committed.len())..] {
            mark_deleted(wip_parent, current);
        }
        return Ok(());
    }

    // Phase 2: lookahead map over the remaining committed children.
    let remaining: Vec<(usize, NodeId)> = committed
        .iter()
        .enumerate()
        .skip(i)
        .map(|(idx, &id)| (idx, id))
        .collect();
    let mut consumed = vec![false; remaining.len()];
    let mut by_identity: HashMap<MapKey, usize, KeyHashBuilder> = HashMap::default();
    for (pos, (old_index, current)) in remaining.iter().enumerate() {
        match current.key() {
            Some(key) => {
                if by_identity.contains_key(&MapKey::Key(key.clone())) {
                    // Duplicate explicit keys among siblings: diagnostic,
                    // then positional fallback for the offender.
                    log::warn!("duplicate list key {key:?} among siblings; falling back to position");
                    cov_mark::hit!(duplicate_key_positional_fallback);
                    by_identity.insert(MapKey::Index(*old_index), pos);
                } else {
                    by_identity.insert(MapKey::Key(key), pos);
                }
            }
            None => {
                by_identity.insert(MapKey::Index(*old_index), pos);
            }
        }
    }

    for (j, desc) in descs.iter().enumerate().skip(i) {
        if matches!(desc.kind(), ElementKind::Empty) {
            if let Some(pos) = by_identity.remove(&MapKey::Index(j)) {
                consumed[pos] = true;
                mark_deleted(wip_parent, remaining[pos].1);
            }
            continue;
        }
        let identity = match desc.key() {
            Some(key) => MapKey::Key(key.to_owned()),
            None => MapKey::Index(j),
        };
        let reusable = by_identity
            .get(&identity)
            .copied()
            .filter(|&pos| same_type(remaining[pos].1, desc));
        match reusable {
            Some(pos) => {
                by_identity.remove(&identity);
                consumed[pos] = true;
                let (old_index, current) = remaining[pos];
                let wip = reuse_node(current, desc, cx)?;
                if old_index < last_placed {
                    cov_mark::hit!(moved_child_reordered);
                    wip.add_flags(NodeFlags::MOVE);
                } else {
                    last_placed = old_index;
                }
                attach_child(wip_parent, wip);
            }
            None => {
                let wip = create_node(desc, cx)?;
                attach_child(wip_parent, wip);
            }
        }
    }

    // Phase 3: unconsumed committed children are deletions, in tree order.
    for (pos, (_, current)) in remaining.iter().enumerate() {
        if !consumed[pos] {
            mark_deleted(wip_parent, *current);
        }
    }
    Ok(())
}
