//! Hot-path container aliases used by core runtime/data structures.
//!
//! Shard-local state tables sit on the hottest paths of the runtime. Keeping
//! container choices centralized lets allocator/container upgrades happen in
//! one place without touching scheduling or lock logic.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hot-path hash map used by shard-local state tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hot-path hash set used by scratch key deduplication.
pub type HotSet<T> = HbSet<T>;
