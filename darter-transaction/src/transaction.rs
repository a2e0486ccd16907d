//! The multi-shard transaction state machine.
//!
//! A transaction carries one command (or one MULTI/script batch) across the
//! engine shards it touches. Shards never share locks: isolation comes from
//! per-shard transaction queues ordered by a process-wide monotonic id, plus
//! counter locks that report contention instead of blocking. The coordinator
//! fiber arms a hop on every active shard, publishes it with one release
//! store on the run counter, and parks until the shards drain it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use darter_common::ids::{DbIndex, INVALID_SID, ShardCount, ShardId, TxId};
use darter_core::command::{CommandId, opt};
use darter_core::containers::{HotMap, HotSet};
use darter_core::sharding::shard_of;
use darter_core::status::OpStatus;
use tracing::{debug, trace};

use crate::journal::JournalOp;
use crate::key_index::{KeyIndex, determine_keys};
use crate::locks::{LockArgs, LockMode};
use crate::shard::{EngineShard, ShardSet};
use crate::sync::EventCount;

/// Callback run by each active shard during one hop.
pub type RunnableType = Arc<dyn Fn(&Transaction, &mut EngineShard) -> OpStatus + Send + Sync>;

/// Resolves the watched key set of a blocking transaction on one shard.
pub type WaitKeysProvider = Arc<dyn Fn(&Transaction, &EngineShard) -> Vec<Vec<u8>> + Send + Sync>;

/// Process-wide transaction id source. Ids only grow, which is what makes
/// the schedule retry loop converge and the design deadlock-free.
static OP_SEQ: AtomicU64 = AtomicU64::new(1);

/// Coordinator-visible state bits.
mod coord {
    pub const SCHED: u8 = 1;
    pub const OOO: u8 = 1 << 1;
    pub const EXEC: u8 = 1 << 2;
    pub const EXEC_CONCLUDING: u8 = 1 << 3;
    pub const BLOCKED: u8 = 1 << 4;
    pub const CANCELLED: u8 = 1 << 5;
}

/// Per-shard state bits.
mod mask {
    /// The shard participates in the current hop.
    pub const ACTIVE: u16 = 1;
    /// Keys for this transaction are held in the shard's key-lock table.
    pub const KEYLOCK_ACQUIRED: u16 = 1 << 1;
    /// Registered with the shard's blocking controller.
    pub const SUSPENDED_Q: u16 = 1 << 2;
    /// Woken by a writer; mutually exclusive with `SUSPENDED_Q`.
    pub const AWAKED_Q: u16 = 1 << 3;
    /// Timed out or cancelled; wakeups become no-ops.
    pub const EXPIRED_Q: u16 = 1 << 4;
    /// The shard granted every lock uncontested; may run ahead of the queue.
    pub const OUT_OF_ORDER: u16 = 1 << 5;
}

/// Where a shard's arguments live inside the flat `args` vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgsView {
    /// The whole vector belongs to this shard (single-shard compression).
    Whole,
    /// A contiguous sub-range.
    Slice { start: usize, count: usize },
}

impl Default for ArgsView {
    fn default() -> Self {
        Self::Slice { start: 0, count: 0 }
    }
}

/// Per-transaction scratch owned by one shard.
#[derive(Debug, Default)]
struct PerShardData {
    local_mask: u16,
    is_armed: bool,
    pq_pos: Option<TxId>,
    args: ArgsView,
}

/// Locking discipline of a multi-command transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiMode {
    /// Shard intent locks on every shard up front; no per-key locks.
    Global,
    /// All keys known at `EXEC`/`EVAL` time, locked by one schedule round.
    LockAhead,
    /// Keys accumulate across sub-commands and lock inside each hop.
    LockIncremental,
    /// No cross-command isolation; sub-commands run as if standalone.
    NonAtomic,
}

#[derive(Debug, Default)]
struct MultiData {
    mode: Option<MultiMode>,
    /// Keys staged by the current sub-command, pending `add_locks`.
    keys: Vec<Vec<u8>>,
    /// Outstanding hold count per key per lock mode.
    lock_counts: HotMap<Vec<u8>, [u32; 2]>,
    locks_recorded: bool,
    /// Which shards recorded a journal write during this multi.
    shard_journal_write: Vec<bool>,
}

impl MultiData {
    fn is_incr_locks(&self) -> bool {
        self.mode == Some(MultiMode::LockIncremental)
    }

    fn add_locks(&mut self, mode: LockMode) {
        debug_assert!(self.is_incr_locks());
        for key in self.keys.drain(..) {
            self.lock_counts.entry(key).or_default()[mode.slot()] += 1;
        }
    }
}

#[derive(Default)]
struct ShardBucket {
    args: Vec<Vec<u8>>,
    original_index: Vec<u32>,
    requested_active: bool,
}

impl ShardBucket {
    fn clear(&mut self) {
        self.args.clear();
        self.original_index.clear();
        self.requested_active = false;
    }
}

/// Reusable per-coordinator-thread buckets for argument distribution.
///
/// Borrowed only inside `init_by_keys`, which has no suspension points.
#[derive(Default)]
struct ScratchSpace {
    shard_buckets: Vec<ShardBucket>,
    uniq_keys: HotSet<Vec<u8>>,
}

impl ScratchSpace {
    fn shard_index(&mut self, size: usize) -> &mut [ShardBucket] {
        self.shard_buckets.resize_with(size, ShardBucket::default);
        for bucket in &mut self.shard_buckets {
            bucket.clear();
        }
        &mut self.shard_buckets
    }
}

thread_local! {
    static TMP_SPACE: RefCell<ScratchSpace> = RefCell::default();
}

/// Coordinator-owned state, mutated only between hops.
///
/// Shard threads take the lock briefly inside their callbacks; the run-count
/// barrier guarantees the coordinator and the shards never contend for it
/// mid-hop.
struct TxState {
    cid: CommandId,
    shard_count: ShardCount,
    db_index: DbIndex,
    /// Original argument vector, command name at position zero.
    full_args: Vec<Vec<u8>>,
    /// Shard-grouped arguments; each shard sees one contiguous sub-range.
    args: Vec<Vec<u8>>,
    /// Maps `args` positions back to caller positions (name excluded).
    reverse_index: Vec<u32>,
    shard_data: Vec<PerShardData>,
    unique_shard_cnt: u32,
    unique_shard_id: ShardId,
    global: bool,
    multi: Option<MultiData>,
    local_result: OpStatus,
    cb: Option<RunnableType>,
}

impl TxState {
    fn init_base(&mut self, db_index: DbIndex, full_args: Vec<Vec<u8>>) {
        self.global = false;
        self.db_index = db_index;
        self.full_args = full_args;
        self.args.clear();
        self.reverse_index.clear();
        self.local_result = OpStatus::Ok;
    }

    fn init_global(&mut self) {
        debug_assert!(
            self.multi.as_ref().is_none_or(|multi| matches!(
                multi.mode,
                Some(MultiMode::Global | MultiMode::NonAtomic)
            ))
        );
        self.global = true;
        self.unique_shard_cnt = u32::from(self.shard_count.get());
        self.shard_data = (0..self.shard_count.as_usize())
            .map(|_| PerShardData {
                local_mask: mask::ACTIVE,
                ..PerShardData::default()
            })
            .collect();
    }

    fn is_multi(&self) -> bool {
        self.multi.is_some()
    }

    fn is_atomic_multi(&self) -> bool {
        self.multi
            .as_ref()
            .is_some_and(|multi| matches!(multi.mode, Some(mode) if mode != MultiMode::NonAtomic))
    }

    fn lock_mode(&self) -> LockMode {
        if self.cid.has_flag(opt::READONLY) {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    /// Maps a shard id into `shard_data`; single-slot layouts compress to 0.
    fn sid_to_id(&self, sid: ShardId) -> usize {
        if self.shard_data.len() == 1 {
            0
        } else {
            usize::from(sid)
        }
    }

    fn active_shard_ids(&self) -> Vec<ShardId> {
        if self.unique_shard_cnt == 1 {
            return vec![self.unique_shard_id];
        }
        self.shard_data
            .iter()
            .enumerate()
            .filter(|(_, sd)| sd.local_mask & mask::ACTIVE != 0)
            .map(|(i, _)| ShardId::try_from(i).unwrap_or(INVALID_SID))
            .collect()
    }

    fn shard_args_slice(&self, sid: ShardId) -> &[Vec<u8>] {
        if self.unique_shard_cnt == 1 {
            return &self.args;
        }
        match self.shard_data[self.sid_to_id(sid)].args {
            ArgsView::Whole => &self.args,
            ArgsView::Slice { start, count } => &self.args[start..start + count],
        }
    }

    fn lock_args(&self, sid: ShardId) -> LockArgs<'_> {
        LockArgs {
            db_index: self.db_index,
            key_step: self.cid.key_arg_step(),
            args: self.shard_args_slice(sid),
        }
    }

    fn store_keys_in_args(&mut self, key_index: KeyIndex, rev_mapping: bool) {
        debug_assert!(key_index.bonus.is_none());
        // Even a single key may span several arguments (MSET pairs).
        for j in key_index.start..key_index.start + key_index.step {
            self.args.push(self.full_args[j].clone());
        }
        if rev_mapping {
            self.reverse_index = (0..self.args.len())
                .map(|j| u32::try_from(j + key_index.start - 1).unwrap_or(u32::MAX))
                .collect();
        }
    }

    fn build_shard_index(
        &self,
        key_index: KeyIndex,
        rev_mapping: bool,
        shard_index: &mut [ShardBucket],
    ) {
        if let Some(bonus) = key_index.bonus {
            debug_assert_eq!(key_index.step, 1);
            let sid = usize::from(shard_of(&self.full_args[bonus], self.shard_count));
            shard_index[sid].args.push(self.full_args[bonus].clone());
            if rev_mapping {
                shard_index[sid]
                    .original_index
                    .push(u32::try_from(bonus - 1).unwrap_or(u32::MAX));
            }
        }

        let mut i = key_index.start;
        while i < key_index.end {
            let sid = usize::from(shard_of(&self.full_args[i], self.shard_count));
            shard_index[sid].args.push(self.full_args[i].clone());
            if rev_mapping {
                shard_index[sid]
                    .original_index
                    .push(u32::try_from(i - 1).unwrap_or(u32::MAX));
            }
            if key_index.step == 2 {
                // Value travels with its preceding key.
                i += 1;
                shard_index[sid].args.push(self.full_args[i].clone());
                if rev_mapping {
                    shard_index[sid]
                        .original_index
                        .push(u32::try_from(i - 1).unwrap_or(u32::MAX));
                }
            }
            i += 1;
        }
    }

    /// Copies bucketed arguments into the flat vector and points every shard
    /// at its own sub-range.
    fn init_shard_data(&mut self, shard_index: &[ShardBucket], num_args: usize, rev_mapping: bool) {
        self.args.reserve(num_args);
        for i in 0..self.shard_data.len() {
            let bucket = &shard_index[i];
            {
                let sd = &mut self.shard_data[i];
                sd.args = ArgsView::Slice {
                    start: self.args.len(),
                    count: bucket.args.len(),
                };
                if let Some(multi) = &self.multi {
                    // Multi transactions re-initialize on different shards
                    // between sub-commands.
                    sd.local_mask &= !mask::ACTIVE;
                    if multi.is_incr_locks() {
                        sd.local_mask &= !mask::KEYLOCK_ACQUIRED;
                    }
                }
                if bucket.args.is_empty() && !bucket.requested_active {
                    continue;
                }
                sd.local_mask |= mask::ACTIVE;
            }

            self.unique_shard_cnt += 1;
            self.unique_shard_id = ShardId::try_from(i).unwrap_or(INVALID_SID);

            for (j, arg) in bucket.args.iter().enumerate() {
                self.args.push(arg.clone());
                if rev_mapping {
                    self.reverse_index.push(bucket.original_index[j]);
                }
            }
        }
        debug_assert_eq!(self.args.len(), num_args);
    }

    fn init_multi_data(&mut self, key_index: KeyIndex, uniq_keys: &mut HotSet<Vec<u8>>) {
        let mode = self.lock_mode();
        let TxState {
            ref mut multi,
            ref full_args,
            ..
        } = *self;
        let Some(multi) = multi.as_mut() else { return };
        if multi.mode == Some(MultiMode::NonAtomic) {
            return;
        }

        multi.keys.clear();
        uniq_keys.clear();

        // Scripts record their locks once at the outer call; incremental
        // multis restage keys for every sub-command.
        if multi.is_incr_locks() || !multi.locks_recorded {
            let mut record = |key: &Vec<u8>| {
                if !uniq_keys.insert(key.clone()) {
                    return;
                }
                if multi.is_incr_locks() {
                    multi.keys.push(key.clone());
                } else {
                    multi.lock_counts.entry(key.clone()).or_default()[mode.slot()] += 1;
                }
            };

            let mut i = key_index.start;
            while i < key_index.end {
                record(&full_args[i]);
                i += key_index.step;
            }
            if let Some(bonus) = key_index.bonus {
                record(&full_args[bonus]);
            }
        }
        multi.locks_recorded = true;
    }

    fn init_by_keys(&mut self, key_index: KeyIndex) {
        if key_index.start == self.full_args.len() {
            // Script call with zero keys.
            debug_assert!(self.cid.name().starts_with("EVAL"));
            return;
        }
        debug_assert!(key_index.start < self.full_args.len());

        let rev_mapping = self.cid.has_flag(opt::REVERSE_MAPPING);

        if key_index.has_single_key() && !self.is_atomic_multi() {
            debug_assert!(key_index.step > 0);
            // No distribution needed; the keys are copied verbatim.
            self.store_keys_in_args(key_index, rev_mapping);
            let slots = if self.is_multi() {
                self.shard_count.as_usize()
            } else {
                1
            };
            self.shard_data = (0..slots).map(|_| PerShardData::default()).collect();
            self.shard_data[0].local_mask |= mask::ACTIVE;
            self.shard_data[0].args = ArgsView::Whole;
            self.unique_shard_cnt = 1;
            self.unique_shard_id = shard_of(&self.args[0], self.shard_count);
            return;
        }

        debug_assert!(key_index.step == 1 || key_index.step == 2);
        self.shard_data
            .resize_with(self.shard_count.as_usize(), PerShardData::default);

        TMP_SPACE.with(|tmp| {
            let mut tmp = tmp.borrow_mut();
            let ScratchSpace {
                shard_buckets,
                uniq_keys,
            } = &mut *tmp;

            shard_buckets.resize_with(self.shard_count.as_usize(), ShardBucket::default);
            for bucket in shard_buckets.iter_mut() {
                bucket.clear();
            }

            self.build_shard_index(key_index, rev_mapping, shard_buckets);
            self.init_shard_data(shard_buckets, key_index.num_args(), rev_mapping);
            if self.is_multi() {
                self.init_multi_data(key_index, uniq_keys);
            }
        });

        // Compress the layout when only one shard ended up populated.
        if self.unique_shard_cnt == 1 {
            if self.is_multi() {
                let idx = usize::from(self.unique_shard_id);
                self.shard_data[idx].local_mask |= mask::ACTIVE;
                self.shard_data[idx].args = ArgsView::Whole;
            } else {
                self.shard_data.truncate(1);
                self.shard_data[0].local_mask |= mask::ACTIVE;
                self.shard_data[0].args = ArgsView::Whole;
            }
        }

        #[cfg(debug_assertions)]
        {
            if rev_mapping {
                for (i, arg) in self.args.iter().enumerate() {
                    // Offset one for the command name.
                    let original = usize::try_from(self.reverse_index[i]).unwrap_or(usize::MAX);
                    debug_assert_eq!(arg, &self.full_args[original + 1]);
                }
            }
            for sd in &self.shard_data {
                debug_assert!(!sd.is_armed);
                if self.multi.is_none() {
                    debug_assert!(sd.pq_pos.is_none());
                }
            }
        }
    }
}

/// One user command (or multi-command batch) in flight across shards.
///
/// Shared as `Arc<Transaction>`: the coordinator holds one handle and every
/// armed shard callback holds another, which re-expresses the intrusive
/// reference count of the hop protocol. A transaction is destroyed when the
/// last handle drops.
pub struct Transaction {
    state: Mutex<TxState>,
    shards: Arc<ShardSet>,
    shard_count: ShardCount,
    /// Monotonic id; zero until scheduled.
    txid: AtomicU64,
    coordinator_state: AtomicU8,
    /// Hop rendezvous between the coordinator and the active shards.
    run_count: AtomicU32,
    /// Hop generation; disambiguates stale shard callbacks.
    seqlock: AtomicU32,
    /// Lowest writer txid that woke this blocking transaction.
    notify_txid: AtomicU64,
    run_ec: EventCount,
    blocking_ec: EventCount,
    weak_self: Weak<Transaction>,
}

impl Transaction {
    /// Creates a transaction for one command.
    ///
    /// `EXEC`/`EVAL`-family commands get a multi shell whose mode is fixed
    /// later by one of the `start_multi_*` calls.
    #[must_use]
    pub fn new(cid: CommandId, shards: Arc<ShardSet>) -> Arc<Self> {
        let shard_count = shards.shard_count();
        let multi = cid.is_multi_shell().then(|| MultiData {
            shard_journal_write: vec![false; shard_count.as_usize()],
            ..MultiData::default()
        });
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(TxState {
                cid,
                shard_count,
                db_index: 0,
                full_args: Vec::new(),
                args: Vec::new(),
                reverse_index: Vec::new(),
                shard_data: Vec::new(),
                unique_shard_cnt: 0,
                unique_shard_id: INVALID_SID,
                global: false,
                multi,
                local_result: OpStatus::Ok,
                cb: None,
            }),
            shards,
            shard_count,
            txid: AtomicU64::new(0),
            coordinator_state: AtomicU8::new(0),
            run_count: AtomicU32::new(0),
            seqlock: AtomicU32::new(0),
            notify_txid: AtomicU64::new(TxId::MAX),
            run_ec: EventCount::new(),
            blocking_ec: EventCount::new(),
            weak_self: weak.clone(),
        })
    }

    fn state_lock(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> Arc<Transaction> {
        self.weak_self
            .upgrade()
            .expect("live transaction must be reachable through its own weak handle")
    }

    /// Distributes arguments and resolves the shard footprint.
    ///
    /// `argv` is the full vector with the command name at position zero.
    /// Global commands skip key derivation and mark every shard active.
    /// Returns a non-`Ok` status without scheduling anything on failure.
    pub fn init_by_args(&self, db_index: DbIndex, argv: &[Vec<u8>]) -> OpStatus {
        let mut st = self.state_lock();
        st.init_base(db_index, argv.to_vec());

        if st.cid.has_flag(opt::GLOBAL_TRANS) {
            st.init_global();
            return OpStatus::Ok;
        }

        if argv.len() <= 1 {
            return OpStatus::SyntaxErr;
        }
        debug_assert_eq!(st.unique_shard_cnt, 0);

        let key_index = match determine_keys(&st.cid, &st.full_args) {
            Ok(key_index) => key_index,
            Err(status) => return status,
        };
        st.init_by_keys(key_index);
        OpStatus::Ok
    }

    /// Schedules the transaction on every active shard.
    ///
    /// Atomic multi transactions scheduled in advance only stage their
    /// incremental locks here.
    pub fn schedule(&self) {
        self.add_incremental_locks();
        if !self.is_atomic_multi() {
            self.schedule_internal();
        }
    }

    /// Schedules and runs a single concluding hop.
    ///
    /// Single-shard non-multi transactions try the uncontended fast path: if
    /// neither the shard intent lock nor the key locks are contended, the
    /// callback runs inline without ever drawing a txid or touching the
    /// queue.
    pub fn schedule_single_hop(&self, cb: RunnableType) -> OpStatus {
        let schedule_fast = {
            let mut st = self.state_lock();
            debug_assert!(st.cb.is_none());
            st.cb = Some(cb);
            st.unique_shard_cnt == 1 && !st.global && !st.is_atomic_multi()
        };
        self.coordinator_state
            .fetch_or(coord::EXEC | coord::EXEC_CONCLUDING, Ordering::Relaxed);

        if schedule_fast {
            let unique_shard_id = {
                let mut st = self.state_lock();
                let unique_shard_id = st.unique_shard_id;
                let idx = st.sid_to_id(unique_shard_id);
                st.shard_data[idx].is_armed = true;
                unique_shard_id
            };
            self.run_count.store(1, Ordering::Release);

            let this = self.handle();
            self.shards.add(unique_shard_id, move |shard| {
                let ran_eagerly = this.schedule_unique_shard(shard);
                if ran_eagerly {
                    this.coordinator_state.fetch_or(coord::OOO, Ordering::Relaxed);
                    let _ = this.decrease_run_cnt();
                }
            });
        } else {
            if !self.is_atomic_multi() {
                self.schedule_internal();
            }
            self.add_incremental_locks();
            self.execute_async();
        }

        self.wait_for_shard_callbacks();

        let mut st = self.state_lock();
        st.cb = None;
        st.local_result
    }

    /// Runs one hop of an already-scheduled transaction.
    ///
    /// `conclude` marks the final hop: locks release and the journal entry
    /// is written when it finishes (multi transactions defer both to
    /// [`Transaction::unlock_multi`]).
    pub fn execute(&self, cb: RunnableType, conclude: bool) -> OpStatus {
        debug_assert!(self.coordinator_state.load(Ordering::Relaxed) & coord::SCHED != 0);
        {
            let mut st = self.state_lock();
            debug_assert!(st.cb.is_none());
            st.cb = Some(cb);
        }
        self.coordinator_state.fetch_or(coord::EXEC, Ordering::Relaxed);
        if conclude {
            self.coordinator_state
                .fetch_or(coord::EXEC_CONCLUDING, Ordering::Relaxed);
        } else {
            self.coordinator_state
                .fetch_and(!coord::EXEC_CONCLUDING, Ordering::Relaxed);
        }

        self.execute_async();

        trace!(id = %self.debug_id(), "waiting on hop barrier");
        self.wait_for_shard_callbacks();

        let mut st = self.state_lock();
        st.cb = None;
        st.local_result
    }

    /// Fixes the multi mode to global and schedules on every shard.
    pub fn start_multi_global(&self, db_index: DbIndex) {
        {
            let mut st = self.state_lock();
            debug_assert!(st.shard_data.is_empty());
            let multi = st.multi.as_mut().expect("global multi requires a multi shell");
            multi.mode = Some(MultiMode::Global);
            multi.locks_recorded = true;
            st.init_base(db_index, Vec::new());
            st.init_global();
        }
        self.schedule_internal();
    }

    /// Fixes the multi mode to lock-ahead over `keys` and schedules once.
    pub fn start_multi_locked_ahead(&self, db_index: DbIndex, keys: &[Vec<u8>]) {
        {
            let mut st = self.state_lock();
            debug_assert!(st.shard_data.is_empty());
            st.multi
                .as_mut()
                .expect("lock-ahead multi requires a multi shell")
                .mode = Some(MultiMode::LockAhead);
            st.init_base(db_index, keys.to_vec());
            st.init_by_keys(KeyIndex::range(0, keys.len()));
        }
        self.schedule_internal();
    }

    /// Fixes the multi mode to incremental locking over the given shard set.
    pub fn start_multi_locked_incr(&self, db_index: DbIndex, shards: &[bool]) {
        {
            let mut st = self.state_lock();
            debug_assert!(st.shard_data.is_empty());
            debug_assert!(shards.iter().any(|requested| *requested));
            st.multi
                .as_mut()
                .expect("incremental multi requires a multi shell")
                .mode = Some(MultiMode::LockIncremental);
            st.init_base(db_index, Vec::new());

            TMP_SPACE.with(|tmp| {
                let mut tmp = tmp.borrow_mut();
                let shard_index = tmp.shard_index(self.shard_count.as_usize());
                for (i, requested) in shards.iter().enumerate() {
                    shard_index[i].requested_active = *requested;
                }
                st.shard_data
                    .resize_with(self.shard_count.as_usize(), PerShardData::default);
                st.init_shard_data(shard_index, 0, false);
            });
        }
        self.schedule_internal();
    }

    /// Fixes the multi mode to non-atomic; sub-commands schedule themselves.
    pub fn start_multi_non_atomic(&self) {
        self.state_lock()
            .multi
            .as_mut()
            .expect("non-atomic multi requires a multi shell")
            .mode = Some(MultiMode::NonAtomic);
    }

    /// Rebinds the transaction to the next sub-command of a multi batch.
    pub fn multi_switch_cmd(&self, cid: CommandId) {
        let mut st = self.state_lock();
        debug_assert!(st.is_multi());
        debug_assert!(st.cb.is_none());

        st.unique_shard_id = 0;
        st.unique_shard_cnt = 0;
        st.args.clear();
        st.reverse_index.clear();
        st.full_args.clear();
        st.cid = cid;

        if st.multi.as_ref().is_some_and(|m| m.mode == Some(MultiMode::NonAtomic)) {
            // Non-atomic sub-commands schedule independently, so the shard
            // scratch and the id reset completely between them.
            for sd in &mut st.shard_data {
                debug_assert!(!sd.is_armed);
                *sd = PerShardData::default();
            }
            self.txid.store(0, Ordering::Relaxed);
            self.coordinator_state.store(0, Ordering::Relaxed);
        }
    }

    /// Releases every lock accumulated by an atomic multi transaction.
    ///
    /// Arms every shard, not only previously active ones: a multi may have
    /// touched any shard across its sub-commands. Shards that recorded a
    /// journal write during the multi also write the `EXEC` marker.
    pub fn unlock_multi(&self) {
        debug!(id = %self.debug_id(), "unlock multi");
        let (sharded_keys, db_index, shard_journals_cnt, slots) = {
            let mut st = self.state_lock();
            let shard_count = st.shard_count;
            let multi = st
                .multi
                .as_mut()
                .expect("unlock_multi requires a multi shell");
            if multi.mode == Some(MultiMode::NonAtomic) {
                return;
            }
            let mut sharded: Vec<Vec<(Vec<u8>, [u32; 2])>> =
                vec![Vec::new(); shard_count.as_usize()];
            for (key, counts) in multi.lock_counts.drain() {
                let sid = usize::from(shard_of(&key, shard_count));
                sharded[sid].push((key, counts));
            }
            let shard_journals_cnt =
                u32::try_from(multi.shard_journal_write.iter().filter(|w| **w).count())
                    .unwrap_or(u32::MAX);
            (
                Arc::new(sharded),
                st.db_index,
                shard_journals_cnt,
                st.shard_data.len(),
            )
        };

        let count = u32::try_from(slots).unwrap_or(u32::MAX);
        let prev = self.run_count.fetch_add(count, Ordering::Release);
        debug_assert_eq!(prev, 0);

        for sid in 0..slots {
            let this = self.handle();
            let sharded_keys = Arc::clone(&sharded_keys);
            let sid = ShardId::try_from(sid).unwrap_or(INVALID_SID);
            self.shards.add(sid, move |shard| {
                this.unlock_multi_shard_cb(&sharded_keys, shard_journals_cnt, db_index, shard);
            });
        }

        self.wait_for_shard_callbacks();
    }

    /// Suspends the transaction until a writer touches one of its watched
    /// keys, the deadline elapses, or shutdown cancels the wait.
    ///
    /// The transaction must already be scheduled. Returns `true` iff a
    /// wakeup arrived in time; the caller then runs its follow-up hop, which
    /// also releases the kept key locks.
    pub fn wait_on_watch(
        &self,
        deadline: Option<Instant>,
        keys_provider: WaitKeysProvider,
    ) -> bool {
        trace!(id = %self.debug_id(), "wait on watch");
        let provider = Arc::clone(&keys_provider);
        let cb: RunnableType = Arc::new(move |t: &Transaction, shard: &mut EngineShard| {
            let keys = (*provider)(t, shard);
            t.watch_in_shard(&keys, shard)
        });
        let _ = self.execute(cb, true);

        self.coordinator_state
            .fetch_or(coord::BLOCKED, Ordering::Relaxed);
        let keep_waiting = || {
            self.coordinator_state.load(Ordering::Relaxed) & coord::CANCELLED == 0
                && self.notify_txid.load(Ordering::Relaxed) == TxId::MAX
        };
        let timed_out = match deadline {
            None => {
                self.blocking_ec.await_while(keep_waiting);
                false
            }
            Some(deadline) => self.blocking_ec.await_while_until(keep_waiting, deadline),
        };

        let is_expired =
            timed_out || self.coordinator_state.load(Ordering::Relaxed) & coord::CANCELLED != 0;
        self.unwatch_blocking(is_expired, &keys_provider);
        self.coordinator_state
            .fetch_and(!coord::BLOCKED, Ordering::Relaxed);
        if timed_out {
            self.state_lock().local_result = OpStatus::TimedOut;
        } else if is_expired {
            self.state_lock().local_result = OpStatus::Cancelled;
        }
        !is_expired
    }

    /// Registers this transaction with the shard's blocking controller.
    ///
    /// Runs inside the watch hop's callback on the shard thread.
    pub fn watch_in_shard(&self, keys: &[Vec<u8>], shard: &mut EngineShard) -> OpStatus {
        let db_index = {
            let mut st = self.state_lock();
            let idx = st.sid_to_id(shard.shard_id());
            debug_assert_eq!(st.shard_data[idx].local_mask & mask::SUSPENDED_Q, 0);
            st.shard_data[idx].local_mask |= mask::SUSPENDED_Q;
            st.db_index
        };
        shard.blocking_controller().add_watched(db_index, keys, &self.handle());
        debug!(id = %self.debug_id(), sid = shard.shard_id(), "watch in shard");
        OpStatus::Ok
    }

    /// Transitions this transaction from suspended to awakened, at most once
    /// per shard. Called by a writer's shard when a watched key changes.
    ///
    /// Lowers `notify_txid` so the earliest wakeup wins, then notifies the
    /// blocked coordinator. Returns `true` iff the transition happened.
    pub fn notify_suspended(&self, committed_txid: TxId, sid: ShardId) -> bool {
        let transitioned = {
            let mut st = self.state_lock();
            let idx = st.sid_to_id(sid);
            let local_mask = st.shard_data[idx].local_mask;

            if local_mask & mask::EXPIRED_Q != 0 {
                return false;
            }
            if local_mask & mask::SUSPENDED_Q != 0 {
                debug_assert_eq!(local_mask & mask::AWAKED_Q, 0);
                st.shard_data[idx].local_mask = (local_mask & !mask::SUSPENDED_Q) | mask::AWAKED_Q;
                true
            } else {
                // Already awakened by another key or an earlier writer.
                debug_assert!(local_mask & mask::AWAKED_Q != 0);
                false
            }
        };
        if !transitioned {
            return false;
        }

        let mut current = self.notify_txid.load(Ordering::Relaxed);
        while committed_txid < current {
            match self.notify_txid.compare_exchange_weak(
                current,
                committed_txid,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.blocking_ec.notify();
        true
    }

    /// Cancels a blocked transaction during shutdown.
    pub fn break_on_shutdown(&self) {
        if self.coordinator_state.load(Ordering::Relaxed) & coord::BLOCKED != 0 {
            self.coordinator_state
                .fetch_or(coord::CANCELLED, Ordering::Relaxed);
            self.blocking_ec.notify();
        }
    }

    /// Arguments grouped for one shard.
    #[must_use]
    pub fn shard_args(&self, sid: ShardId) -> Vec<Vec<u8>> {
        self.state_lock().shard_args_slice(sid).to_vec()
    }

    /// Maps a shard-local argument position back to the caller's original
    /// position, command name excluded.
    #[must_use]
    pub fn reverse_arg_index(&self, sid: ShardId, arg_index: usize) -> usize {
        let st = self.state_lock();
        let index = if st.unique_shard_cnt == 1 {
            st.reverse_index[arg_index]
        } else {
            match st.shard_data[st.sid_to_id(sid)].args {
                ArgsView::Whole => st.reverse_index[arg_index],
                ArgsView::Slice { start, .. } => st.reverse_index[start + arg_index],
            }
        };
        usize::try_from(index).unwrap_or(usize::MAX)
    }

    /// Monotonic transaction id; zero while unscheduled.
    #[must_use]
    pub fn txid(&self) -> TxId {
        self.txid.load(Ordering::Relaxed)
    }

    /// Status captured from the last hop's callbacks.
    #[must_use]
    pub fn local_result(&self) -> OpStatus {
        self.state_lock().local_result
    }

    /// Number of shards this transaction touches.
    #[must_use]
    pub fn unique_shard_cnt(&self) -> u32 {
        self.state_lock().unique_shard_cnt
    }

    /// Target shard of a single-shard transaction.
    #[must_use]
    pub fn unique_shard_id(&self) -> ShardId {
        self.state_lock().unique_shard_id
    }

    /// Whether this transaction owns the whole keyspace.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.state_lock().global
    }

    /// Whether the transaction ran (or may run) ahead of its queue position.
    #[must_use]
    pub fn is_ooo(&self) -> bool {
        self.coordinator_state.load(Ordering::Relaxed) & coord::OOO != 0
    }

    /// Whether a shutdown cancellation hit a blocking wait.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.coordinator_state.load(Ordering::Relaxed) & coord::CANCELLED != 0
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.coordinator_state.load(Ordering::Relaxed) & coord::BLOCKED != 0
    }

    /// Command name this transaction currently carries.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.state_lock().cid.name()
    }

    /// Human-readable identity for logs.
    #[must_use]
    pub fn debug_id(&self) -> String {
        let st = self.state_lock();
        format!(
            "{}@{}/{}",
            st.cid.name(),
            self.txid.load(Ordering::Relaxed),
            st.unique_shard_cnt
        )
    }

    fn is_atomic_multi(&self) -> bool {
        self.state_lock().is_atomic_multi()
    }

    fn add_incremental_locks(&self) {
        let mut st = self.state_lock();
        let mode = st.lock_mode();
        if let Some(multi) = st.multi.as_mut()
            && multi.is_incr_locks()
        {
            multi.add_locks(mode);
        }
    }

    /// Schedules on all active shards, retrying with a fresh id until every
    /// shard accepts.
    ///
    /// Each retry draws a strictly larger txid, so eventually the id beats
    /// every committed head and the round succeeds; that monotonicity is the
    /// livelock guard.
    fn schedule_internal(&self) {
        let (span_all, num_shards, lock_mode, active) = {
            let st = self.state_lock();
            debug_assert!(!st.shard_data.is_empty());
            debug_assert_eq!(self.txid.load(Ordering::Relaxed), 0);
            let num_shards = if st.global {
                u32::from(st.shard_count.get())
            } else {
                st.unique_shard_cnt
            };
            debug_assert!(num_shards > 0);
            (st.global, num_shards, st.lock_mode(), st.active_shard_ids())
        };

        if span_all {
            // Global transactions take every shard's intent lock before the
            // queue round, which also disables out-of-order execution.
            self.shards.run_brief_in_parallel(
                move |shard| {
                    let _ = shard.shard_lock.acquire(lock_mode);
                },
                |_| true,
            );
        }

        let active = Arc::new(active);

        loop {
            let txid = OP_SEQ.fetch_add(1, Ordering::Relaxed);
            self.txid.store(txid, Ordering::Relaxed);

            let success = Arc::new(AtomicU32::new(0));
            let lock_granted_cnt = Arc::new(AtomicU32::new(0));
            {
                let this = self.handle();
                let success = Arc::clone(&success);
                let lock_granted_cnt = Arc::clone(&lock_granted_cnt);
                let active = Arc::clone(&active);
                self.shards.run_brief_in_parallel(
                    move |shard| {
                        let (ok, lock_granted) = this.schedule_in_shard(shard);
                        if ok {
                            let _ = success.fetch_add(1, Ordering::Relaxed);
                        }
                        if lock_granted {
                            let _ = lock_granted_cnt.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    move |sid| active.contains(&sid),
                );
            }

            if success.load(Ordering::Acquire) == num_shards {
                self.coordinator_state.fetch_or(coord::SCHED, Ordering::Relaxed);
                let ooo_disabled = span_all || {
                    let st = self.state_lock();
                    st.is_atomic_multi()
                        && st.multi.as_ref().is_some_and(|m| m.mode != Some(MultiMode::LockAhead))
                };
                if !ooo_disabled && lock_granted_cnt.load(Ordering::Relaxed) == num_shards {
                    self.coordinator_state.fetch_or(coord::OOO, Ordering::Relaxed);
                }
                debug!(
                    id = %self.debug_id(),
                    ooo = self.is_ooo(),
                    num_shards,
                    "scheduled"
                );
                break;
            }

            debug!(id = %self.debug_id(), "cancelling schedule round");
            let should_poll = Arc::new(AtomicBool::new(false));
            {
                let this = self.handle();
                let should_poll = Arc::clone(&should_poll);
                let active = Arc::clone(&active);
                self.shards.run_brief_in_parallel(
                    move |shard| {
                        if this.cancel_shard_cb(shard) {
                            should_poll.store(true, Ordering::Relaxed);
                        }
                    },
                    move |sid| active.contains(&sid),
                );
            }

            // A removed queue head may leave a ready successor stalled, so
            // follow up with a poll on every active shard.
            if should_poll.load(Ordering::Relaxed) {
                for sid in active.iter().copied() {
                    self.shards
                        .add(sid, |shard| shard.poll_execution("cancel_cleanup", None));
                }
            }
        }

        if self.is_ooo() {
            let mut st = self.state_lock();
            for sd in &mut st.shard_data {
                sd.local_mask |= mask::OUT_OF_ORDER;
            }
        }
    }

    /// One shard's non-blocking part of a scheduling round.
    ///
    /// Returns `(success, lock_granted)`.
    fn schedule_in_shard(&self, shard: &mut EngineShard) -> (bool, bool) {
        let txid = self.txid.load(Ordering::Relaxed);
        if shard.committed_txid() >= txid {
            // A later generation already committed here; the round retries
            // with a fresh id.
            return (false, false);
        }

        let mut st = self.state_lock();
        let sid = shard.shard_id();
        let idx = st.sid_to_id(sid);
        debug_assert!(st.shard_data[idx].local_mask & mask::ACTIVE != 0);

        let spans_all = st.global;
        let mode = st.lock_mode();
        let mut lock_granted = false;

        if !spans_all {
            let shard_unlocked = shard.shard_lock.check(mode);
            // The key lock is taken regardless of contention: everything in
            // the queue must hold its keys.
            let acquired = shard.key_locks.acquire(mode, &st.lock_args(sid));
            lock_granted = acquired && shard_unlocked;
            st.shard_data[idx].local_mask |= mask::KEYLOCK_ACQUIRED;
            trace!(id = %self.debug_id(), sid, lock_granted, "lock acquired");
        }

        if !shard.txq.is_empty() {
            // Inserting before the tail is only safe when our locks are
            // uncontested; otherwise a later transaction may already have
            // deduced it can run out of order.
            let to_proceed =
                lock_granted || shard.txq.tail_score().is_some_and(|tail| tail < txid);
            if !to_proceed {
                if st.shard_data[idx].local_mask & mask::KEYLOCK_ACQUIRED != 0 {
                    shard.key_locks.release(mode, &st.lock_args(sid));
                    st.shard_data[idx].local_mask &= !mask::KEYLOCK_ACQUIRED;
                }
                return (false, false);
            }
        }

        let pos = shard.txq.insert(txid, self.handle());
        debug_assert!(st.shard_data[idx].pq_pos.is_none());
        st.shard_data[idx].pq_pos = Some(pos);
        (true, lock_granted)
    }

    /// Rolls back one shard after a failed scheduling round.
    ///
    /// Returns `true` iff the removed entry was the queue head with a
    /// successor behind it, which warrants a poll nudge.
    fn cancel_shard_cb(&self, shard: &mut EngineShard) -> bool {
        let mut st = self.state_lock();
        let sid = shard.shard_id();
        let idx = st.sid_to_id(sid);

        let Some(pos) = st.shard_data[idx].pq_pos.take() else {
            return false;
        };
        let was_head = shard.txq.remove(pos);

        if st.shard_data[idx].local_mask & mask::KEYLOCK_ACQUIRED != 0 {
            let mode = st.lock_mode();
            shard.key_locks.release(mode, &st.lock_args(sid));
            st.shard_data[idx].local_mask &= !mask::KEYLOCK_ACQUIRED;
        }

        was_head && !shard.txq.is_empty()
    }

    /// Arms every active shard and dispatches the hop callback.
    fn execute_async(&self) {
        let seq = self.seqlock.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let active = {
            let mut st = self.state_lock();
            debug_assert!(st.unique_shard_cnt > 0);
            let active = st.active_shard_ids();
            for sid in &active {
                let idx = st.sid_to_id(*sid);
                st.shard_data[idx].is_armed = true;
            }
            active
        };

        // The release store publishes every preceding write (argument views,
        // armed flags) to any shard that observes the armed state.
        let count = u32::try_from(active.len()).unwrap_or(u32::MAX);
        self.run_count.store(count, Ordering::Release);

        for sid in active {
            let this = self.handle();
            self.shards.add(sid, move |shard| {
                let sid = shard.shard_id();
                // Armed first: it proves the coordinator crossed the release
                // barrier, making the seqlock read below meaningful.
                if this.is_armed_in_shard(sid) {
                    if this.seqlock.load(Ordering::Relaxed) == seq {
                        shard.poll_execution("exec_cb", Some(&this));
                    } else {
                        trace!(id = %this.debug_id(), sid, "skipping stale hop callback");
                    }
                }
            });
        }
    }

    /// Runs on the target shard thread for the single-shard fast path.
    ///
    /// Returns `true` if the callback ran eagerly (quickie), `false` if the
    /// transaction fell back into the queue.
    fn schedule_unique_shard(&self, shard: &mut EngineShard) -> bool {
        let uncontended = {
            let st = self.state_lock();
            debug_assert!(!st.is_atomic_multi());
            debug_assert_eq!(self.txid.load(Ordering::Relaxed), 0);
            debug_assert_ne!(st.unique_shard_id, INVALID_SID);
            let mode = st.lock_mode();
            shard.key_locks.check(mode, &st.lock_args(shard.shard_id()))
                && shard.shard_lock.check(mode)
        };

        if uncontended {
            self.run_quickie(shard);
            return true;
        }

        {
            let mut st = self.state_lock();
            let sid = shard.shard_id();
            let idx = st.sid_to_id(sid);
            let mode = st.lock_mode();

            // Only this shard thread writes the txid on this path.
            let txid = OP_SEQ.fetch_add(1, Ordering::Relaxed);
            self.txid.store(txid, Ordering::Relaxed);

            let pos = shard.txq.insert(txid, self.handle());
            st.shard_data[idx].pq_pos = Some(pos);

            debug_assert_eq!(st.shard_data[idx].local_mask & mask::KEYLOCK_ACQUIRED, 0);
            let _ = shard.key_locks.acquire(mode, &st.lock_args(sid));
            st.shard_data[idx].local_mask |= mask::KEYLOCK_ACQUIRED;
            debug!(id = %self.debug_id(), sid, "rescheduling into queue");
        }

        shard.poll_execution("schedule_unique", None);
        false
    }

    /// Uncontended single-shard execution bypassing the queue entirely.
    fn run_quickie(&self, shard: &mut EngineShard) {
        shard.inc_quick_run();
        let cb = {
            let st = self.state_lock();
            let idx = st.sid_to_id(shard.shard_id());
            debug_assert_eq!(
                st.shard_data[idx].local_mask & (mask::KEYLOCK_ACQUIRED | mask::OUT_OF_ORDER),
                0
            );
            st.cb.clone().expect("quickie must carry a callback")
        };
        trace!(id = %self.debug_id(), sid = shard.shard_id(), "quickie run");

        let status = (*cb)(self, shard);

        let mut st = self.state_lock();
        st.local_result = status;
        self.log_auto_journal_on_shard(&mut st, shard, shard.shard_id());
        let idx = st.sid_to_id(shard.shard_id());
        st.shard_data[idx].is_armed = false;
        st.cb = None;
    }

    /// Runs one armed hop on this shard.
    ///
    /// Returns `true` iff the transaction must be kept by the shard for a
    /// later hop (it becomes the shard's continuation).
    pub(crate) fn run_in_shard(&self, shard: &mut EngineShard) -> bool {
        debug_assert!(self.run_count.load(Ordering::Relaxed) > 0);
        debug_assert!(self.txid.load(Ordering::Relaxed) > 0);
        let sid = shard.shard_id();

        let is_concluding =
            self.coordinator_state.load(Ordering::Relaxed) & coord::EXEC_CONCLUDING != 0;

        let (cb, mode, global, was_suspended, awaked_prerun, should_release) = {
            let mut st = self.state_lock();
            let idx = st.sid_to_id(sid);
            debug_assert!(st.shard_data[idx].is_armed);
            st.shard_data[idx].is_armed = false;

            let local_mask = st.shard_data[idx].local_mask;
            let was_suspended = local_mask & mask::SUSPENDED_Q != 0;
            let awaked_prerun = local_mask & mask::AWAKED_Q != 0;
            let incremental_lock = st.multi.as_ref().is_some_and(MultiData::is_incr_locks);
            // Multi transactions release in unlock_multi, so concluding and
            // releasing are separate notions.
            let should_release = is_concluding && !st.is_atomic_multi();
            let mode = st.lock_mode();

            // Incremental-lock transactions acquire exactly once per shard,
            // at execution time rather than at scheduling time.
            if !st.global && incremental_lock && local_mask & mask::KEYLOCK_ACQUIRED == 0 {
                debug_assert!(!awaked_prerun);
                st.shard_data[idx].local_mask |= mask::KEYLOCK_ACQUIRED;
                let _ = shard.key_locks.acquire(mode, &st.lock_args(sid));
            }

            let cb = st.cb.clone().expect("armed hop must carry a callback");
            (cb, mode, st.global, was_suspended, awaked_prerun, should_release)
        };

        trace!(id = %self.debug_id(), sid, "run in shard");
        // A suspended transaction still runs: the brpoplpush family pushes
        // on its own suspended shard.
        let status = (*cb)(self, shard);

        let mut finalize: Option<(DbIndex, Vec<Vec<u8>>)> = None;
        {
            let mut st = self.state_lock();
            if st.unique_shard_cnt == 1 {
                st.cb = None;
                st.local_result = status;
            } else {
                match status {
                    OpStatus::Ok => {}
                    OpStatus::OutOfMemory => st.local_result = OpStatus::OutOfMemory,
                    other => panic!("unexpected status {other:?} from a multi-shard callback"),
                }
            }

            if is_concluding {
                self.log_auto_journal_on_shard(&mut st, shard, sid);
            }

            // The transaction leaves the queue on its first run; later hops
            // go through the shard's continuation slot.
            let idx = st.sid_to_id(sid);
            if let Some(pos) = st.shard_data[idx].pq_pos.take() {
                let _ = shard.txq.remove(pos);
            }

            if should_release {
                let became_suspended = st.shard_data[idx].local_mask & mask::SUSPENDED_Q != 0;
                if global {
                    debug_assert!(!awaked_prerun && !became_suspended);
                    shard.shard_lock.release(mode);
                } else {
                    debug_assert!(st.shard_data[idx].local_mask & mask::KEYLOCK_ACQUIRED != 0);
                    // A freshly suspended transaction keeps its keys locked
                    // so future writers stay ordered through the queue.
                    if was_suspended || !became_suspended {
                        shard.key_locks.release(mode, &st.lock_args(sid));
                        st.shard_data[idx].local_mask &= !mask::KEYLOCK_ACQUIRED;
                    }
                    st.shard_data[idx].local_mask &= !mask::OUT_OF_ORDER;
                }

                if awaked_prerun || was_suspended {
                    st.shard_data[idx].local_mask &= !(mask::SUSPENDED_Q | mask::AWAKED_Q);
                    finalize = Some((st.db_index, st.shard_args_slice(sid).to_vec()));
                }
            }
        }

        if should_release {
            if let Some((db_index, keys)) = finalize {
                shard.blocking.finalize_watched(db_index, &keys, &self.handle());
            }
            // Writers notify with their own id so the earliest wakeup wins
            // across racing shards.
            let writer_txid = self.txid.load(Ordering::Relaxed);
            shard.blocking.notify_pending(writer_txid, sid);
        }

        let _ = self.decrease_run_cnt();
        // Past this point the shard may only touch the transaction through a
        // fresh handle.
        !should_release
    }

    /// Releases accumulated multi locks on one shard.
    fn unlock_multi_shard_cb(
        &self,
        sharded_keys: &[Vec<(Vec<u8>, [u32; 2])>],
        shard_journals_cnt: u32,
        db_index: DbIndex,
        shard: &mut EngineShard,
    ) {
        let sid = shard.shard_id();
        {
            let mut st = self.state_lock();
            let multi_mode = st.multi.as_ref().and_then(|multi| multi.mode);

            if let Some(journal) = shard.journal.clone()
                && st
                    .multi
                    .as_ref()
                    .is_some_and(|multi| multi.shard_journal_write[usize::from(sid)])
            {
                journal.record_entry(
                    self.txid.load(Ordering::Relaxed),
                    JournalOp::Exec,
                    db_index,
                    shard_journals_cnt,
                    &[],
                    true,
                );
            }

            if multi_mode == Some(MultiMode::Global) {
                shard.shard_lock.release(LockMode::Exclusive);
            } else {
                for (key, counts) in &sharded_keys[usize::from(sid)] {
                    for mode in [LockMode::Shared, LockMode::Exclusive] {
                        let count = counts[mode.slot()];
                        if count > 0 {
                            shard.key_locks.release_counted(mode, db_index, key, count);
                        }
                    }
                }
            }

            // Not every shard of a multi ran a hop; stragglers may still sit
            // in the queue and need the same cleanup.
            let idx = st.sid_to_id(sid);
            if let Some(pos) = st.shard_data[idx].pq_pos.take() {
                let _ = shard.txq.remove(pos);
            }
            st.shard_data[idx].local_mask &= !mask::KEYLOCK_ACQUIRED;
        }

        shard.shutdown_multi(&self.handle());
        shard.blocking.notify_pending(shard.committed_txid(), sid);
        shard.poll_execution("unlockmulti", None);

        let _ = self.decrease_run_cnt();
    }

    /// Marks the transaction as expired/finished on every watch shard.
    fn unwatch_blocking(&self, should_expire: bool, keys_provider: &WaitKeysProvider) {
        debug!(id = %self.debug_id(), should_expire, "unwatch blocking");
        let active = {
            let st = self.state_lock();
            debug_assert!(!st.global);
            st.active_shard_ids()
        };

        let count = u32::try_from(active.len()).unwrap_or(u32::MAX);
        self.run_count.store(count, Ordering::Release);

        for sid in active {
            let this = self.handle();
            let provider = Arc::clone(keys_provider);
            self.shards.add(sid, move |shard| {
                let keys = (*provider)(&this, shard);
                this.unwatch_shard_cb(&keys, should_expire, shard);
            });
        }

        self.wait_for_shard_callbacks();
    }

    fn unwatch_shard_cb(&self, keys: &[Vec<u8>], should_expire: bool, shard: &mut EngineShard) {
        if should_expire {
            let db_index = {
                let mut st = self.state_lock();
                let sid = shard.shard_id();
                let idx = st.sid_to_id(sid);
                debug_assert!(st.shard_data[idx].local_mask & mask::KEYLOCK_ACQUIRED != 0);
                let mode = st.lock_mode();
                shard.key_locks.release(mode, &st.lock_args(sid));
                st.shard_data[idx].local_mask |= mask::EXPIRED_Q;
                st.shard_data[idx].local_mask &= !mask::KEYLOCK_ACQUIRED;
                st.db_index
            };
            let handle = self.handle();
            shard.blocking.finalize_watched(db_index, keys, &handle);
            debug_assert!(!shard.blocking.awakened_contains(&handle));
            shard.blocking.notify_pending(shard.committed_txid(), shard.shard_id());
        }

        // A queue-head successor may have stalled behind this waiter.
        shard.poll_execution("unwatchcb", None);
        let _ = self.decrease_run_cnt();
    }

    fn log_auto_journal_on_shard(&self, st: &mut TxState, shard: &EngineShard, sid: ShardId) {
        if !st.cid.has_flag(opt::WRITE) || st.cid.has_flag(opt::NO_AUTOJOURNAL) {
            return;
        }
        let Some(journal) = shard.journal.clone() else {
            return;
        };

        if let Some(multi) = st.multi.as_mut() {
            multi.shard_journal_write[usize::from(sid)] = true;
        }

        let payload: Vec<Vec<u8>> = if st.unique_shard_cnt == 1 || st.args.is_empty() {
            st.full_args.clone()
        } else {
            let shard_args = st.shard_args_slice(sid);
            let mut payload = Vec::with_capacity(shard_args.len() + 1);
            payload.push(st.full_args[0].clone());
            payload.extend(shard_args.iter().cloned());
            payload
        };
        let op = if st.is_atomic_multi() {
            JournalOp::MultiCommand
        } else {
            JournalOp::Command
        };
        journal.record_entry(
            self.txid.load(Ordering::Relaxed),
            op,
            st.db_index,
            st.unique_shard_cnt,
            &payload,
            true,
        );
    }

    fn wait_for_shard_callbacks(&self) {
        self.run_ec
            .await_while(|| self.run_count.load(Ordering::Acquire) > 0);
    }

    fn decrease_run_cnt(&self) -> u32 {
        // Release so no preceding store is reordered past the barrier exit.
        let prev = self.run_count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev >= 1);
        if prev == 1 {
            self.run_ec.notify();
        }
        prev
    }

    pub(crate) fn is_armed_in_shard(&self, sid: ShardId) -> bool {
        // The run-count read must come first: a non-zero value proves the
        // coordinator crossed the arming release barrier.
        if self.run_count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let st = self.state_lock();
        if st.shard_data.is_empty() {
            return false;
        }
        st.shard_data[st.sid_to_id(sid)].is_armed
    }

    pub(crate) fn is_ooo_in_shard(&self, sid: ShardId) -> bool {
        let st = self.state_lock();
        st.shard_data[st.sid_to_id(sid)].local_mask & mask::OUT_OF_ORDER != 0
    }

    pub(crate) fn is_queued_in_shard(&self, sid: ShardId) -> bool {
        let st = self.state_lock();
        st.shard_data[st.sid_to_id(sid)].pq_pos.is_some()
    }

    pub(crate) fn is_watcher_in_shard(&self, sid: ShardId) -> bool {
        let st = self.state_lock();
        st.shard_data[st.sid_to_id(sid)].local_mask & (mask::SUSPENDED_Q | mask::AWAKED_Q) != 0
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.debug_id())
            .field("run_count", &self.run_count.load(Ordering::Relaxed))
            .finish()
    }
}
