//! Shard-local intent locks and the per-key lock table.
//!
//! Both lock kinds are counters, never blocking primitives: acquisition
//! always succeeds as a counter bump and reports whether the lock was
//! uncontested before the bump. Ordering between contenders comes from the
//! transaction queue, not from the locks themselves.

use darter_common::ids::DbIndex;
use darter_core::containers::HotMap;

/// Lock acquisition mode, derived from a command's read/write intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple readers may hold the lock together.
    Shared,
    /// A single writer excludes every other holder.
    Exclusive,
}

impl LockMode {
    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Shared => 0,
            Self::Exclusive => 1,
        }
    }
}

/// Shared/exclusive holder counters guarding one shard or one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentLock {
    counts: [u32; 2],
}

impl IntentLock {
    /// Bumps the holder count for `mode`.
    ///
    /// Returns `true` iff the lock was uncontested for `mode` before the
    /// bump; a `false` return still counts as a held reference that must be
    /// released.
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        let was_free = self.check(mode);
        self.counts[mode.slot()] += 1;
        was_free
    }

    /// Drops one holder reference for `mode`.
    pub fn release(&mut self, mode: LockMode) {
        self.release_count(mode, 1);
    }

    /// Drops `count` holder references for `mode`.
    pub fn release_count(&mut self, mode: LockMode, count: u32) {
        debug_assert!(self.counts[mode.slot()] >= count, "lock count underflow");
        self.counts[mode.slot()] -= count;
    }

    /// Returns whether a new holder in `mode` would be uncontested.
    #[must_use]
    pub fn check(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.counts[LockMode::Exclusive.slot()] == 0,
            LockMode::Exclusive => self.is_free(),
        }
    }

    /// Returns whether no holder of any mode exists.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.counts == [0, 0]
    }
}

/// Key set a transaction locks on one shard.
///
/// `args` is the shard-grouped argument slice; keys sit at every `key_step`
/// position, so key/value commands like `MSET` pass step two.
#[derive(Debug)]
pub struct LockArgs<'a> {
    /// Logical database the keys belong to.
    pub db_index: DbIndex,
    /// Stride between keys inside `args`.
    pub key_step: u32,
    /// Shard-grouped arguments holding the keys.
    pub args: &'a [Vec<u8>],
}

impl LockArgs<'_> {
    fn keys(&self) -> impl Iterator<Item = &[u8]> {
        let step = usize::try_from(self.key_step.max(1)).unwrap_or(1);
        self.args.iter().step_by(step).map(Vec::as_slice)
    }
}

/// Per-shard, per-db table of key lock counters.
///
/// Owned and mutated only by the shard thread; the coordinator never touches
/// it directly.
#[derive(Debug, Default)]
pub struct KeyLockTable {
    tables: HotMap<DbIndex, HotMap<Vec<u8>, IntentLock>>,
}

impl KeyLockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires all keys of `args` in `mode`.
    ///
    /// Returns `true` iff every key was uncontested before its bump. Partial
    /// contention still leaves every key held; callers release the full set.
    pub fn acquire(&mut self, mode: LockMode, args: &LockArgs<'_>) -> bool {
        let table = self.tables.entry(args.db_index).or_default();
        let mut all_uncontested = true;
        for key in args.keys() {
            let lock = table.entry_ref(key).or_default();
            all_uncontested &= lock.acquire(mode);
        }
        all_uncontested
    }

    /// Releases all keys of `args` in `mode`.
    pub fn release(&mut self, mode: LockMode, args: &LockArgs<'_>) {
        for key in args.keys() {
            self.release_counted(mode, args.db_index, key, 1);
        }
    }

    /// Releases `count` holder references for one key.
    ///
    /// The MULTI unlock path accumulates per-key counts across sub-commands
    /// and drains them in one call per key.
    pub fn release_counted(&mut self, mode: LockMode, db_index: DbIndex, key: &[u8], count: u32) {
        let Some(table) = self.tables.get_mut(&db_index) else {
            debug_assert!(false, "releasing a key in an unlocked db");
            return;
        };
        let Some(lock) = table.get_mut(key) else {
            debug_assert!(false, "releasing an unlocked key");
            return;
        };
        lock.release_count(mode, count);
        if lock.is_free() {
            let _ = table.remove(key);
        }
        if table.is_empty() {
            let _ = self.tables.remove(&db_index);
        }
    }

    /// Returns whether every key of `args` is uncontested for `mode`, without
    /// acquiring anything.
    #[must_use]
    pub fn check(&self, mode: LockMode, args: &LockArgs<'_>) -> bool {
        let Some(table) = self.tables.get(&args.db_index) else {
            return true;
        };
        args.keys()
            .all(|key| table.get(key).is_none_or(|lock| lock.check(mode)))
    }

    /// Returns whether one key carries no holders at all.
    #[must_use]
    pub fn is_key_free(&self, db_index: DbIndex, key: &[u8]) -> bool {
        self.tables
            .get(&db_index)
            .is_none_or(|table| !table.contains_key(key))
    }

    /// Returns the number of currently held keys in one db.
    #[must_use]
    pub fn locked_key_count(&self, db_index: DbIndex) -> usize {
        self.tables.get(&db_index).map_or(0, HotMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::{IntentLock, KeyLockTable, LockArgs, LockMode};
    use googletest::prelude::*;
    use rstest::rstest;

    fn args(step: u32, args: &[Vec<u8>]) -> LockArgs<'_> {
        LockArgs {
            db_index: 0,
            key_step: step,
            args,
        }
    }

    #[rstest]
    fn intent_lock_shared_holders_coexist() {
        let mut lock = IntentLock::default();
        assert_that!(lock.acquire(LockMode::Shared), eq(true));
        assert_that!(lock.acquire(LockMode::Shared), eq(true));
        assert_that!(IntentLock::check(&lock, LockMode::Exclusive), eq(false));

        lock.release(LockMode::Shared);
        lock.release(LockMode::Shared);
        assert_that!(lock.is_free(), eq(true));
    }

    #[rstest]
    fn intent_lock_exclusive_blocks_everyone() {
        let mut lock = IntentLock::default();
        assert_that!(lock.acquire(LockMode::Exclusive), eq(true));
        assert_that!(lock.acquire(LockMode::Shared), eq(false));
        assert_that!(lock.acquire(LockMode::Exclusive), eq(false));

        lock.release_count(LockMode::Exclusive, 2);
        lock.release(LockMode::Shared);
        assert_that!(lock.is_free(), eq(true));
    }

    #[rstest]
    fn key_table_acquire_reports_contention_per_key_set() {
        let mut table = KeyLockTable::new();
        let first = [b"a".to_vec()];
        let second = [b"a".to_vec(), b"b".to_vec()];

        assert_that!(
            table.acquire(LockMode::Exclusive, &args(1, &first)),
            eq(true)
        );
        // "a" is contended, so the whole set reports contention.
        assert_that!(
            table.acquire(LockMode::Exclusive, &args(1, &second)),
            eq(false)
        );

        table.release(LockMode::Exclusive, &args(1, &second));
        table.release(LockMode::Exclusive, &args(1, &first));
        assert_that!(table.locked_key_count(0), eq(0_usize));
    }

    #[rstest]
    fn key_table_step_two_skips_values() {
        let mut table = KeyLockTable::new();
        let kv = [b"k1".to_vec(), b"v1".to_vec(), b"k2".to_vec(), b"v2".to_vec()];

        assert_that!(table.acquire(LockMode::Exclusive, &args(2, &kv)), eq(true));
        assert_that!(table.is_key_free(0, b"k1"), eq(false));
        assert_that!(table.is_key_free(0, b"v1"), eq(true));
        assert_that!(table.locked_key_count(0), eq(2_usize));

        table.release(LockMode::Exclusive, &args(2, &kv));
        assert_that!(table.locked_key_count(0), eq(0_usize));
    }

    #[rstest]
    fn key_table_counted_release_drains_accumulated_holds() {
        let mut table = KeyLockTable::new();
        let key = [b"k".to_vec()];

        assert_that!(table.acquire(LockMode::Shared, &args(1, &key)), eq(true));
        assert_that!(table.acquire(LockMode::Shared, &args(1, &key)), eq(true));
        table.release_counted(LockMode::Shared, 0, b"k", 2);
        assert_that!(table.is_key_free(0, b"k"), eq(true));
    }

    #[rstest]
    fn key_table_check_does_not_acquire() {
        let table = KeyLockTable::new();
        let key = [b"untouched".to_vec()];
        assert_that!(
            KeyLockTable::check(&table, LockMode::Exclusive, &args(1, &key)),
            eq(true)
        );
        assert_that!(table.is_key_free(0, b"untouched"), eq(true));
    }
}
