// Arena-based storage for node descriptors.
//
// Both the committed tree and every in-flight work-in-progress tree live in
// one global slab arena. NodeId is a lightweight newtype indexing into it;
// "promote work-in-progress to committed" is an index swap at the root plus
// a release of the superseded entries, never a graph mutation.

pub mod node_arena;

pub use node_arena::{
    LifecycleState, NodeFlags, NodeId, NodeKind, NodeMeta, node_arena_insert, node_arena_remove,
    release_subtree,
};
