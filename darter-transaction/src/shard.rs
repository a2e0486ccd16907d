//! Engine shards and the shard runloop set.
//!
//! Each shard is one OS thread hosting a current-thread tokio runtime that
//! drains a queue of shard closures. All shard-local state (transaction
//! queue, lock tables, blocking controller) is touched only from that
//! thread; the coordinator communicates exclusively through the task queue
//! and the transaction atomics.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use darter_common::ids::{ShardCount, ShardId, TxId};
use tokio::runtime::Builder as TokioBuilder;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::blocking::BlockingController;
use crate::journal::ShardJournal;
use crate::locks::{IntentLock, KeyLockTable};
use crate::sync::EventCount;
use crate::transaction::Transaction;
use crate::tx_queue::TxQueue;

type ShardTask = Box<dyn FnOnce(&mut EngineShard) + Send + 'static>;

/// Shard-local execution state owned by exactly one worker thread.
pub struct EngineShard {
    sid: ShardId,
    pub(crate) txq: TxQueue<Arc<Transaction>>,
    pub(crate) shard_lock: IntentLock,
    pub(crate) key_locks: KeyLockTable,
    pub(crate) blocking: BlockingController,
    pub(crate) journal: Option<Arc<dyn ShardJournal>>,
    pub(crate) committed_txid: TxId,
    continuation_tx: Option<Arc<Transaction>>,
    quick_runs: u64,
}

impl EngineShard {
    fn new(sid: ShardId) -> Self {
        Self {
            sid,
            txq: TxQueue::new(),
            shard_lock: IntentLock::default(),
            key_locks: KeyLockTable::new(),
            blocking: BlockingController::new(),
            journal: None,
            committed_txid: 0,
            continuation_tx: None,
            quick_runs: 0,
        }
    }

    /// Id of this shard.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.sid
    }

    /// Latest transaction id that ran in queue order on this shard.
    #[must_use]
    pub fn committed_txid(&self) -> TxId {
        self.committed_txid
    }

    /// Blocking controller for writer wakeup hooks.
    pub fn blocking_controller(&mut self) -> &mut BlockingController {
        &mut self.blocking
    }

    /// Key-lock table, exposed for introspection.
    #[must_use]
    pub fn key_lock_table(&self) -> &KeyLockTable {
        &self.key_locks
    }

    /// Number of transactions that ran through the uncontended fast path.
    #[must_use]
    pub fn quick_run_count(&self) -> u64 {
        self.quick_runs
    }

    pub(crate) fn inc_quick_run(&mut self) {
        self.quick_runs += 1;
    }

    /// Installs a journal sink for this shard.
    pub fn install_journal(&mut self, journal: Arc<dyn ShardJournal>) {
        self.journal = Some(journal);
    }

    pub(crate) fn shutdown_multi(&mut self, tx: &Arc<Transaction>) {
        if self
            .continuation_tx
            .as_ref()
            .is_some_and(|cont| Arc::ptr_eq(cont, tx))
        {
            self.continuation_tx = None;
        }
    }

    /// Drains ready transactions.
    ///
    /// Runs, in order: a parked multi-hop continuation, then armed queue
    /// heads in txid order, then the `hint` transaction when it is armed and
    /// either allowed to run out of order or awakened from a blocking wait.
    pub fn poll_execution(&mut self, tag: &str, hint: Option<&Arc<Transaction>>) {
        trace!(sid = self.sid, tag, "poll execution");

        if let Some(cont) = self.continuation_tx.clone()
            && cont.is_armed_in_shard(self.sid)
        {
            let keep = cont.run_in_shard(self);
            if !keep {
                self.continuation_tx = None;
            }
        }

        while self.continuation_tx.is_none() {
            let Some(head) = self.txq.head() else { break };
            if !head.is_armed_in_shard(self.sid) {
                break;
            }
            self.committed_txid = head.txid();
            let keep = head.run_in_shard(self);
            if keep {
                self.continuation_tx = Some(head);
            }
        }

        let Some(tx) = hint else { return };
        if self
            .continuation_tx
            .as_ref()
            .is_some_and(|cont| Arc::ptr_eq(cont, tx))
        {
            return;
        }
        if !tx.is_armed_in_shard(self.sid) {
            return;
        }
        let run_ooo = tx.is_ooo_in_shard(self.sid) && tx.is_queued_in_shard(self.sid);
        // A watcher left the queue at its watch hop but kept its key locks,
        // so its follow-up hop runs ahead of the queue.
        let run_watcher =
            tx.is_watcher_in_shard(self.sid) || self.blocking.awakened_contains(tx);
        if run_ooo || run_watcher {
            trace!(sid = self.sid, txid = tx.txid(), run_ooo, "hint run");
            let keep = tx.run_in_shard(self);
            if keep {
                self.continuation_tx = Some(Arc::clone(tx));
            }
        }
    }
}

impl std::fmt::Debug for EngineShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShard")
            .field("sid", &self.sid)
            .field("queue_len", &self.txq.len())
            .field("committed_txid", &self.committed_txid)
            .field("has_continuation", &self.continuation_tx.is_some())
            .finish()
    }
}

/// Thread-per-shard runloop pool.
///
/// The only cross-shard communication channel in the system: coordinators
/// enqueue closures onto a shard's task queue, and the worker runs them
/// against its `EngineShard` one at a time.
pub struct ShardSet {
    shard_count: ShardCount,
    senders: Vec<mpsc::UnboundedSender<ShardTask>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ShardSet {
    /// Spawns one worker thread per shard.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Arc<Self> {
        let shard_len = shard_count.as_usize();
        let mut senders = Vec::with_capacity(shard_len);
        let mut workers = Vec::with_capacity(shard_len);

        for sid in 0..shard_len {
            let (sender, receiver) = mpsc::unbounded_channel::<ShardTask>();
            senders.push(sender);
            let sid = ShardId::try_from(sid).unwrap_or(ShardId::MAX);
            let handle = thread::spawn(move || shard_worker_thread_main(sid, receiver));
            workers.push(handle);
        }

        Arc::new(Self {
            shard_count,
            senders,
            workers,
        })
    }

    /// Number of shard workers served by this set.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.shard_count
    }

    /// Enqueues one closure on the target shard's runloop.
    ///
    /// # Panics
    ///
    /// Panics when the target shard is out of range or its runloop has shut
    /// down; both indicate a lifecycle bug in the caller.
    pub fn add(&self, sid: ShardId, task: impl FnOnce(&mut EngineShard) + Send + 'static) {
        let sender = self
            .senders
            .get(usize::from(sid))
            .expect("target shard is out of range");
        sender
            .send(Box::new(task))
            .expect("shard runloop has shut down");
    }

    /// Fans `task` out to every shard selected by `is_active` and joins.
    ///
    /// The closure must not suspend: shard workers process tasks one at a
    /// time and the caller blocks until every selected shard ran it.
    pub fn run_brief_in_parallel<F>(&self, task: F, is_active: impl Fn(ShardId) -> bool)
    where
        F: Fn(&mut EngineShard) + Send + Sync + 'static,
    {
        let selected: Vec<ShardId> = (0..self.shard_count.get())
            .filter(|sid| is_active(*sid))
            .collect();
        if selected.is_empty() {
            return;
        }

        let task = Arc::new(task);
        let pending = Arc::new(AtomicUsize::new(selected.len()));
        let done = Arc::new(EventCount::new());

        for sid in selected {
            let task = Arc::clone(&task);
            let pending = Arc::clone(&pending);
            let done = Arc::clone(&done);
            self.add(sid, move |shard| {
                (*task)(shard);
                if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    done.notify();
                }
            });
        }

        done.await_while(|| pending.load(Ordering::Acquire) > 0);
    }

    /// Installs the same journal sink on every shard, synchronously.
    pub fn install_journal(&self, journal: Arc<dyn ShardJournal>) {
        self.run_brief_in_parallel(
            move |shard| shard.install_journal(Arc::clone(&journal)),
            |_| true,
        );
    }
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("shard_count", &self.shard_count)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("shard worker exited abnormally");
            }
        }
    }
}

fn shard_worker_thread_main(sid: ShardId, mut receiver: mpsc::UnboundedReceiver<ShardTask>) {
    let Ok(runtime) = TokioBuilder::new_current_thread().build() else {
        return;
    };

    let mut shard = EngineShard::new(sid);
    runtime.block_on(async move {
        while let Some(task) = receiver.recv().await {
            task(&mut shard);
        }
    });
}
