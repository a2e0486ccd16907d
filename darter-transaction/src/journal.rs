//! Shard journal hooks.
//!
//! The coordinator records write effects per shard so a replication layer
//! can replay them in txid order. The write protocol itself lives behind
//! [`ShardJournal`]; a shard without an installed journal treats every hook
//! as a no-op.

use std::sync::Mutex;

use darter_common::ids::{DbIndex, TxId};

/// Journal operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    /// Standalone command payload.
    Command,
    /// One sub-command of an atomic multi transaction.
    MultiCommand,
    /// Multi conclusion marker, written per shard that recorded a write.
    Exec,
    /// Keepalive marker.
    Ping,
}

/// One append-only journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Transaction id associated with this record; zero for quickie runs.
    pub txid: TxId,
    /// Operation kind.
    pub op: JournalOp,
    /// Database the record applies to.
    pub db: DbIndex,
    /// Number of shards participating in the recorded operation.
    pub shard_cnt: u32,
    /// Serialized command arguments; empty for markers.
    pub payload: Vec<Vec<u8>>,
}

/// Journal sink installed per shard.
pub trait ShardJournal: Send + Sync {
    /// Appends one record.
    ///
    /// `allow_await` marks records whose durability the caller may wait on;
    /// in-memory sinks ignore it.
    fn record_entry(
        &self,
        txid: TxId,
        op: JournalOp,
        db: DbIndex,
        shard_cnt: u32,
        payload: &[Vec<u8>],
        allow_await: bool,
    );
}

/// In-memory journal with monotonic LSN assignment, used by tests and as the
/// default sink shape for replication backlog experiments.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    records: Mutex<Vec<(u64, JournalEntry)>>,
}

impl InMemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all recorded entries in LSN order.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records.iter().map(|(_, entry)| entry.clone()).collect()
    }
}

impl ShardJournal for InMemoryJournal {
    fn record_entry(
        &self,
        txid: TxId,
        op: JournalOp,
        db: DbIndex,
        shard_cnt: u32,
        payload: &[Vec<u8>],
        _allow_await: bool,
    ) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let lsn = records.last().map_or(1, |(lsn, _)| lsn + 1);
        records.push((
            lsn,
            JournalEntry {
                txid,
                op,
                db,
                shard_cnt,
                payload: payload.to_vec(),
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryJournal, JournalOp, ShardJournal};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn records_are_returned_in_append_order() {
        let journal = InMemoryJournal::new();
        journal.record_entry(7, JournalOp::Command, 0, 1, &[b"SET".to_vec()], true);
        journal.record_entry(7, JournalOp::Exec, 0, 1, &[], false);

        let entries = journal.entries();
        assert_that!(entries.len(), eq(2_usize));
        assert_that!(entries[0].op, eq(JournalOp::Command));
        assert_that!(entries[1].op, eq(JournalOp::Exec));
        assert_that!(entries[1].payload.is_empty(), eq(true));
    }
}
