//! Transaction coordination core for a shared-nothing in-memory store.
//!
//! The keyspace is partitioned across a fixed set of single-threaded engine
//! shards. A [`Transaction`] carries one command (or a MULTI batch) across
//! the shards it touches, enforcing isolation and atomicity through
//! per-shard queues and counter locks instead of a cross-shard lock manager.

pub mod blocking;
pub mod journal;
pub mod key_index;
pub mod locks;
pub mod session;
pub mod shard;
pub mod sync;
pub mod transaction;
pub mod tx_queue;

use std::sync::Arc;

use darter_common::config::RuntimeConfig;
use darter_common::error::DarterResult;
use darter_core::registry::CommandRegistry;

pub use shard::{EngineShard, ShardSet};
pub use transaction::{MultiMode, RunnableType, Transaction, WaitKeysProvider};

/// Transaction subsystem bootstrap module.
#[derive(Debug)]
pub struct TransactionModule {
    /// Shard runloop pool shared by every coordinator.
    pub shards: Arc<ShardSet>,
    /// Command metadata used to build transactions.
    pub registry: CommandRegistry,
}

impl TransactionModule {
    /// Creates the transaction module with running shard workers.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            shards: ShardSet::new(config.shard_count),
            registry: CommandRegistry::with_builtin_commands(),
        }
    }

    /// Builds a transaction for a registered command name.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Protocol` for unknown commands.
    pub fn new_transaction(&self, name: &str) -> DarterResult<Arc<Transaction>> {
        let cid = self.registry.require(name)?;
        Ok(Transaction::new(cid, Arc::clone(&self.shards)))
    }
}
