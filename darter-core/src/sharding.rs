//! Key-to-shard routing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use darter_common::ids::{ShardCount, ShardId};

/// Returns the owner shard for the given key bytes.
///
/// Pure hash-mod partitioning over a fixed shard count; the count never
/// changes after startup, so ownership of a key is stable for the process
/// lifetime.
#[must_use]
pub fn shard_of(key: &[u8], shard_count: ShardCount) -> ShardId {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let shard = hasher.finish() % u64::from(shard_count.get());
    match ShardId::try_from(shard) {
        Ok(shard_id) => shard_id,
        Err(_) => unreachable!("modulo shard_count ensures shard id fits into u16"),
    }
}

/// Resolves key ownership to a shard id.
///
/// The free function covers the fixed hash-mod policy; the trait is the seam
/// for alternative routing policies (lock tags, slot maps).
pub trait ShardResolver {
    /// Returns the owner shard for the given key bytes.
    fn shard_for_key(&self, key: &[u8]) -> ShardId;
}

/// Deterministic hash-based shard resolver.
#[derive(Debug, Clone)]
pub struct HashShardResolver {
    shard_count: ShardCount,
}

impl HashShardResolver {
    /// Builds a resolver for a specific shard count.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        Self { shard_count }
    }
}

impl ShardResolver for HashShardResolver {
    fn shard_for_key(&self, key: &[u8]) -> ShardId {
        shard_of(key, self.shard_count)
    }
}

#[cfg(test)]
mod tests {
    use super::{HashShardResolver, ShardResolver, shard_of};
    use darter_common::ids::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"hello".as_slice(), 4)]
    #[case(b"darter-key".as_slice(), 8)]
    #[case(b"another-key".as_slice(), 16)]
    fn shard_of_returns_valid_shard_range(#[case] key: &[u8], #[case] shard_count: u16) {
        let count = ShardCount::new(shard_count).expect("literal is valid");
        assert_that!(shard_of(key, count) < shard_count, eq(true));
    }

    #[rstest]
    #[case(b"darter-key".as_slice())]
    #[case(b"same-key".as_slice())]
    fn shard_of_is_deterministic_for_same_input(#[case] key: &[u8]) {
        let count = ShardCount::new(4).expect("literal is valid");
        assert_that!(shard_of(key, count), eq(shard_of(key, count)));
    }

    #[rstest]
    fn resolver_agrees_with_free_function() {
        let count = ShardCount::new(6).expect("literal is valid");
        let resolver = HashShardResolver::new(count);
        assert_that!(
            resolver.shard_for_key(b"watched"),
            eq(shard_of(b"watched", count))
        );
    }
}
