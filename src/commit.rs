//! Commit pipeline: materializes a flagged work-in-progress tree through a
//! [`HostBackend`].
//!
//! One recursive walk, two directions. On the way down (capture) host
//! instances are created for additions; on the way back up (bubble) children
//! are placed inside their container, prop change sets are applied, and
//! deletions recorded on the node are torn down. Deletions run after the
//! surviving siblings' mutations, so a move paired with a removal settles
//! the moved node first. A descendant's prop updates apply as the walk
//! returns through it and may therefore precede an ancestor container's
//! placement insertions; hosts must not depend on updates seeing final
//! sibling order, only on mutations preceding deletions.
//!
//! Placement works per container. Composites (fragments, components,
//! providers, consumers) contribute their descendant host instances to the
//! nearest container-owning ancestor; portals cut the flattening and place
//! their children into their own external container. Placement walks the
//! flattened child list in reverse so every insertion has its settled right
//! neighbor as the reference, turning each move into exactly one
//! `insert_before`.
//!
//! Lifecycle callbacks never run inside the mutation walk. They are queued
//! during the bubble phase (children before parents, so a child's
//! `did_mount` precedes its parent's) and flushed once the whole tree is
//! consistent. A callback error routes to the nearest ancestor component
//! with [`Component::catches_errors`]; an unhandled one abandons the
//! remaining callbacks and fails the task. Host errors are always fatal.

use std::sync::Arc;

use crate::arena::{LifecycleState, NodeFlags, NodeId, NodeKind};
use crate::element::Component;
use crate::error::{CallbackError, ReconcileError};
use crate::host::{HostBackend, HostCreation, HostHandle};

/// A lifecycle callback owed once the mutation walk completes.
enum Deferred {
    Mount,
    Update,
}

struct CommitCx<'a> {
    backend: &'a mut dyn HostBackend,
    deferred: Vec<(NodeId, Deferred)>,
}

/// Commit `wip` into `container`.
///
/// On a root replacement the superseded tree hangs off the new root's
/// deletion list; it is detached here after the new tree is placed. Arena
/// entries are not released, that belongs to promotion.
pub(crate) fn commit_root(
    wip: NodeId,
    container: HostHandle,
    backend: &mut dyn HostBackend,
) -> Result<(), ReconcileError> {
    let mut cx = CommitCx {
        backend,
        deferred: Vec::new(),
    };

    commit_node(wip, container, &mut cx)?;
    place_children(container, std::slice::from_ref(&wip), &mut cx)?;

    if wip.flags().contains(NodeFlags::ADDITION) {
        // A fresh root's deletion list holds the tree it replaced, which
        // lived directly in the root container.
        for old in wip.deletions() {
            teardown_subtree(old, container, &mut cx)?;
        }
    }

    flush_deferred(&mut cx)
}

/// Tear down a whole committed tree, as `unmount` does: unmount callbacks
/// bottom-up, then detach its top host instances from `container`.
pub(crate) fn teardown_root(
    node: NodeId,
    container: HostHandle,
    backend: &mut dyn HostBackend,
) -> Result<(), ReconcileError> {
    let mut cx = CommitCx {
        backend,
        deferred: Vec::new(),
    };
    teardown_subtree(node, container, &mut cx)
}

fn commit_node(node: NodeId, inherited: HostHandle, cx: &mut CommitCx<'_>) -> Result<(), ReconcileError> {
    let Some(kind) = node.kind() else {
        return Ok(());
    };
    let flags = node.flags();

    // Capture: mint host instances for additions. Reused nodes carried
    // their handle over from the committed counterpart.
    match &kind {
        NodeKind::Host { tag } => {
            if node.host().is_none() {
                let props = node.with(|meta| meta.props.clone()).unwrap_or_default();
                let handle = cx
                    .backend
                    .create_instance(HostCreation::Element { tag, props: &props })?;
                node.set_host(handle);
            }
        }
        NodeKind::Text { value } => {
            if node.host().is_none() {
                let handle = cx.backend.create_instance(HostCreation::Text { value })?;
                node.set_host(handle);
            }
        }
        _ => {}
    }

    let child_container = match &kind {
        NodeKind::Host { .. } | NodeKind::Text { .. } => match node.host() {
            Some(handle) => handle,
            None => return Ok(()),
        },
        NodeKind::Portal { container } => *container,
        _ => inherited,
    };

    let children = node.children();
    for &child in &children {
        commit_node(child, child_container, cx)?;
    }

    // Bubble: placement happens where a container begins; composites defer
    // to the nearest container-owning ancestor.
    let owns_container = matches!(kind, NodeKind::Host { .. } | NodeKind::Portal { .. });
    if owns_container {
        place_children(child_container, &children, cx)?;
    }

    if flags.contains(NodeFlags::UPDATE) {
        let changes = node.take_pending_props();
        if !changes.is_empty() {
            if let Some(handle) = node.host() {
                cx.backend.apply_prop_changes(handle, &changes)?;
            }
        }
    }

    // Deletions settle after the surviving siblings above. A fresh node's
    // deletion list is the root-replacement case, handled by commit_root.
    if !flags.contains(NodeFlags::ADDITION) {
        for deleted in node.deletions() {
            teardown_subtree(deleted, child_container, cx)?;
        }
    }

    if component_of(node).is_some() {
        if flags.contains(NodeFlags::ADDITION) {
            node.set_lifecycle(LifecycleState::Mounting);
            node.add_flags(NodeFlags::CALLBACKS);
            cx.deferred.push((node, Deferred::Mount));
        } else if flags.contains(NodeFlags::UPDATE) {
            node.set_lifecycle(LifecycleState::Updating);
            node.add_flags(NodeFlags::CALLBACKS);
            cx.deferred.push((node, Deferred::Update));
        }
    }
    Ok(())
}

/// Flattened placement over one container's immediate host children.
///
/// Walks in reverse so the reference sibling is always already settled; an
/// addition or move becomes `insert_before` when it has a right neighbor and
/// `append_child` at the end of the list.
fn place_children(
    container: HostHandle,
    children: &[NodeId],
    cx: &mut CommitCx<'_>,
) -> Result<(), ReconcileError> {
    let mut flattened = Vec::new();
    for &child in children {
        flatten_hosts(child, false, &mut flattened);
    }

    let mut reference: Option<HostHandle> = None;
    for &(handle, needs_placement) in flattened.iter().rev() {
        if needs_placement {
            match reference {
                Some(next) => cx.backend.insert_before(container, handle, next)?,
                None => cx.backend.append_child(container, handle)?,
            }
        }
        reference = Some(handle);
    }
    Ok(())
}

/// Collect the host instances a node contributes to its container, in tree
/// order. `forced` carries a composite ancestor's addition or move down to
/// the hosts that realize it.
fn flatten_hosts(node: NodeId, forced: bool, out: &mut Vec<(HostHandle, bool)>) {
    let Some(kind) = node.kind() else {
        return;
    };
    let needs = forced || node.flags().intersects(NodeFlags::ADDITION | NodeFlags::MOVE);
    match kind {
        NodeKind::Host { .. } | NodeKind::Text { .. } => {
            if let Some(handle) = node.host() {
                out.push((handle, needs));
            }
        }
        // Portal children live in the portal's own container.
        NodeKind::Portal { .. } => {}
        _ => {
            for child in node.children() {
                flatten_hosts(child, needs, out);
            }
        }
    }
}

fn component_of(node: NodeId) -> Option<Arc<dyn Component>> {
    match node.kind()? {
        NodeKind::Component { component } => Some(component),
        NodeKind::Lazy { lazy } => lazy.resolved().cloned(),
        _ => None,
    }
}

/// Tear down a deleted subtree: unmount callbacks bottom-up, then detach the
/// top host instances from `container`.
fn teardown_subtree(
    node: NodeId,
    container: HostHandle,
    cx: &mut CommitCx<'_>,
) -> Result<(), ReconcileError> {
    run_unmount_callbacks(node)?;
    detach_hosts(node, container, cx)
}

fn run_unmount_callbacks(node: NodeId) -> Result<(), ReconcileError> {
    for child in node.children() {
        run_unmount_callbacks(child)?;
    }
    if let Some(component) = component_of(node) {
        node.set_lifecycle(LifecycleState::Unmounting);
        if let Err(error) = component.will_unmount() {
            route_callback_error(node, error)?;
        }
    }
    Ok(())
}

/// Remove the topmost host instances of a deleted subtree. Removing a host
/// removes its native subtree wholesale, so recursion only continues through
/// composites and into nested portals' external containers.
fn detach_hosts(
    node: NodeId,
    container: HostHandle,
    cx: &mut CommitCx<'_>,
) -> Result<(), ReconcileError> {
    let Some(kind) = node.kind() else {
        return Ok(());
    };
    match kind {
        NodeKind::Host { .. } | NodeKind::Text { .. } => {
            if let Some(handle) = node.host() {
                cx.backend.remove_child(container, handle)?;
            }
            for child in node.children() {
                detach_nested_portals(child, cx)?;
            }
        }
        NodeKind::Portal {
            container: portal_container,
        } => {
            for child in node.children() {
                detach_hosts(child, portal_container, cx)?;
            }
        }
        _ => {
            for child in node.children() {
                detach_hosts(child, container, cx)?;
            }
        }
    }
    Ok(())
}

/// Portals buried under a removed host still own content in an external
/// container that the host removal did not touch.
fn detach_nested_portals(node: NodeId, cx: &mut CommitCx<'_>) -> Result<(), ReconcileError> {
    let Some(kind) = node.kind() else {
        return Ok(());
    };
    if let NodeKind::Portal {
        container: portal_container,
    } = kind
    {
        for child in node.children() {
            detach_hosts(child, portal_container, cx)?;
        }
        return Ok(());
    }
    for child in node.children() {
        detach_nested_portals(child, cx)?;
    }
    Ok(())
}

fn flush_deferred(cx: &mut CommitCx<'_>) -> Result<(), ReconcileError> {
    for (node, kind) in std::mem::take(&mut cx.deferred) {
        let Some(component) = component_of(node) else {
            continue;
        };
        let result = match kind {
            Deferred::Mount => component.did_mount(),
            Deferred::Update => component.did_update(),
        };
        node.set_lifecycle(LifecycleState::Mounted);
        if let Err(error) = result {
            route_callback_error(node, error)?;
        }
    }
    Ok(())
}

/// Deliver a callback error to the nearest ancestor component that catches,
/// or fail the task.
fn route_callback_error(origin: NodeId, error: CallbackError) -> Result<(), ReconcileError> {
    let mut cursor = origin.parent();
    while let Some(node) = cursor {
        if let Some(component) = component_of(node) {
            if component.catches_errors() {
                cov_mark::hit!(error_routed_to_boundary);
                component.did_catch(&error);
                return Ok(());
            }
        }
        cursor = node.parent();
    }
    log::error!("unhandled lifecycle callback error: {error}");
    Err(ReconcileError::Callback(error))
}
