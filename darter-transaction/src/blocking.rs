//! Per-shard registry of blocking transactions watching keys.

use std::collections::VecDeque;
use std::sync::Arc;

use darter_common::ids::{DbIndex, ShardId, TxId};
use darter_core::containers::{HotMap, HotSet};
use tracing::debug;

use crate::transaction::Transaction;

type WatchKey = (DbIndex, Vec<u8>);

fn tx_key(tx: &Arc<Transaction>) -> usize {
    Arc::as_ptr(tx) as usize
}

/// Watch queues and wakeup bookkeeping for one shard.
///
/// A suspended transaction registers here for every key it waits on and
/// keeps its key locks so later writers are ordered through the transaction
/// queue. Writers flag touched keys via [`BlockingController::awake_watched`];
/// the flags are verified and turned into wakeups when the writing hop
/// concludes.
#[derive(Default)]
pub struct BlockingController {
    watched: HotMap<WatchKey, VecDeque<Arc<Transaction>>>,
    awakened_keys: HotSet<WatchKey>,
    awakened: HotMap<usize, Arc<Transaction>>,
}

impl BlockingController {
    /// Creates an empty controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tx` as a watcher of every key in `keys`.
    pub fn add_watched(&mut self, db: DbIndex, keys: &[Vec<u8>], tx: &Arc<Transaction>) {
        for key in keys {
            self.watched
                .entry((db, key.clone()))
                .or_default()
                .push_back(Arc::clone(tx));
        }
    }

    /// Writer hook: marks `key` for wakeup verification if anyone watches it.
    pub fn awake_watched(&mut self, db: DbIndex, key: &[u8]) {
        let watch_key = (db, key.to_vec());
        if self.watched.contains_key(&watch_key) {
            let _ = self.awakened_keys.insert(watch_key);
        }
    }

    /// Turns flagged keys into wakeups.
    ///
    /// For every awakened key the earliest still-suspended watcher is
    /// notified with `committed_txid`; expired watchers are skipped. Called
    /// by the shard after a concluding hop, so notification order follows
    /// execution order.
    pub fn notify_pending(&mut self, committed_txid: TxId, sid: ShardId) {
        let keys: Vec<WatchKey> = self.awakened_keys.drain().collect();
        for watch_key in keys {
            let Some(queue) = self.watched.get(&watch_key) else {
                continue;
            };
            for tx in queue {
                if tx.notify_suspended(committed_txid, sid) {
                    debug!(txid = tx.txid(), sid, "awakened watcher");
                    let _ = self.awakened.insert(tx_key(tx), Arc::clone(tx));
                    break;
                }
            }
        }
    }

    /// Drops `tx` from the watch queues of `keys` and from the awakened set.
    pub fn finalize_watched(&mut self, db: DbIndex, keys: &[Vec<u8>], tx: &Arc<Transaction>) {
        for key in keys {
            let watch_key = (db, key.clone());
            if let Some(queue) = self.watched.get_mut(&watch_key) {
                queue.retain(|watcher| !Arc::ptr_eq(watcher, tx));
                if queue.is_empty() {
                    let _ = self.watched.remove(&watch_key);
                    let _ = self.awakened_keys.remove(&watch_key);
                }
            }
        }
        let _ = self.awakened.remove(&tx_key(tx));
    }

    /// Returns whether `tx` is currently in the awakened set.
    #[must_use]
    pub fn awakened_contains(&self, tx: &Arc<Transaction>) -> bool {
        self.awakened.contains_key(&tx_key(tx))
    }

    /// Returns the number of keys with at least one watcher.
    #[must_use]
    pub fn watched_key_count(&self) -> usize {
        self.watched.len()
    }
}

impl std::fmt::Debug for BlockingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingController")
            .field("watched", &self.watched.len())
            .field("awakened_keys", &self.awakened_keys.len())
            .field("awakened", &self.awakened.len())
            .finish()
    }
}
