//! Per-shard transaction queue ordered by transaction id.

use std::collections::BTreeMap;

use darter_common::ids::TxId;

/// Priority queue of pending transactions keyed by their monotonic id.
///
/// The head is the earliest scheduled, not-yet-concluded transaction on the
/// owning shard. Entries are removable by position (their id), which the
/// scheduling rollback path relies on.
#[derive(Debug, Default)]
pub struct TxQueue<T> {
    entries: BTreeMap<TxId, T>,
}

impl<T: Clone> TxQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Inserts an entry under `score` and returns its queue position.
    ///
    /// Scores are unique because every scheduled transaction draws a fresh id
    /// from the process-wide counter.
    pub fn insert(&mut self, score: TxId, value: T) -> TxId {
        let previous = self.entries.insert(score, value);
        debug_assert!(previous.is_none(), "txid {score} double-inserted");
        score
    }

    /// Removes the entry at `pos`.
    ///
    /// Returns `true` iff the removed entry was the queue head; a head change
    /// may unblock a successor, so callers follow up with an execution poll.
    pub fn remove(&mut self, pos: TxId) -> bool {
        let was_head = self.entries.keys().next() == Some(&pos);
        let removed = self.entries.remove(&pos);
        debug_assert!(removed.is_some(), "txid {pos} not queued");
        was_head
    }

    /// Returns the head entry, if any.
    #[must_use]
    pub fn head(&self) -> Option<T> {
        self.entries.values().next().cloned()
    }

    /// Returns the head score, if any.
    #[must_use]
    pub fn head_score(&self) -> Option<TxId> {
        self.entries.keys().next().copied()
    }

    /// Returns the tail score, if any.
    #[must_use]
    pub fn tail_score(&self) -> Option<TxId> {
        self.entries.keys().next_back().copied()
    }

    /// Returns the number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
