//! Zero-sized hash builder for the reconciler's internal hash maps.
//!
//! Provides `KeyHashBuilder`, a zero-sized `BuildHasher` backed by foldhash
//! with a fixed seed. The diff engine builds a short-lived lookahead map keyed
//! by child identity on every mismatching reconcile pass, so a zero-sized,
//! allocation-free hasher matters more than HashDoS resistance here.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` using foldhash with a fixed seed.
///
/// All instances hash identically, which keeps the diff engine's lookahead
/// maps deterministic across runs. Child keys come from the caller's own
/// descriptions, not from untrusted input, so a fixed seed is acceptable.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyHashBuilder;

impl BuildHasher for KeyHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e3779b97f4a7c15).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<KeyHashBuilder>(), 0);
    }

    #[test]
    fn identical_keys_hash_identically_across_instances() {
        let a = KeyHashBuilder;
        let b = KeyHashBuilder;

        assert_eq!(a.hash_one("child-key"), b.hash_one("child-key"));
        assert_ne!(a.hash_one("child-key"), a.hash_one("other-key"));
    }
}
