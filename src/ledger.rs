use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::LedgerConfig;
use crate::conflict::lock_table::LockTable;
use crate::data_store::ledger_store::LedgerStore;
use crate::data_store::value::Value;
use crate::data_store::version::Version;
use crate::dependency_tracking::DependencyTracker;
use crate::isolation::IsolationLevel;
use crate::storage::Storage;
use crate::transaction::Transaction;
use crate::{CommitSeq, TxnId};

/// Ledger Prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::conflict::lock_table::LockWait;
    pub use crate::data_store::key_range::*;
    pub use crate::data_store::value::*;
    pub use crate::data_store::version::*;
    pub use crate::errors::*;
    pub use crate::harness::*;
    pub use crate::isolation::{IsolationLevel, PhantomPolicy};
    pub use crate::ledger::{GcStats, Ledger};
    pub use crate::storage::*;
    pub use crate::transaction::*;
    pub use crate::{CommitSeq, TxnId};
}

/// State shared by a ledger and all of its transactions.
pub(crate) struct LedgerCore {
    pub(crate) store: LedgerStore,
    /// Sequence of the last published commit. Starts at 0.
    pub(crate) commit_counter: AtomicU64,
    next_txn_id: AtomicU64,
    /// Serializes validation and stamping of commits.
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) lock_table: LockTable,
    pub(crate) dependency_tracker: DependencyTracker,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) config: LedgerConfig,
    commits_since_gc: AtomicU64,
}

impl LedgerCore {
    fn new(config: LedgerConfig, storage: Option<Arc<dyn Storage>>) -> Self {
        Self {
            store: LedgerStore::new(),
            commit_counter: AtomicU64::new(0),
            next_txn_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
            lock_table: LockTable::new(),
            dependency_tracker: DependencyTracker::new(),
            storage,
            config,
            commits_since_gc: AtomicU64::new(0),
        }
    }

    pub(crate) fn current_seq(&self) -> CommitSeq {
        self.commit_counter.load(Ordering::SeqCst)
    }

    fn next_txn_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn maybe_collect_garbage(&self) {
        let interval = self.config.gc_interval;
        if interval == 0 {
            return;
        }
        let commits = self.commits_since_gc.fetch_add(1, Ordering::Relaxed) + 1;
        if commits >= interval {
            self.commits_since_gc.store(0, Ordering::Relaxed);
            self.collect_garbage();
        }
    }

    fn collect_garbage(&self) -> GcStats {
        // Hold the commit lock so the horizon cannot move under the prune.
        let _guard = self.commit_lock.lock();
        let horizon = self.dependency_tracker.active_horizon();
        let versions_removed = self.store.prune(horizon);
        let transactions_forgotten = self.dependency_tracker.cleanup_old_txns();
        debug!(
            "GC at horizon {}: {} versions removed, {} transactions forgotten",
            horizon, versions_removed, transactions_forgotten
        );
        GcStats {
            horizon,
            versions_removed,
            transactions_forgotten,
        }
    }
}

/// Result of a garbage collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    /// Versions deleted at or before this sequence were dropped.
    pub horizon: CommitSeq,
    pub versions_removed: usize,
    /// Committed transactions dropped from the dependency tracker.
    pub transactions_forgotten: usize,
}

/// The main entry point: an in-memory, multi-version key/value ledger.
///
/// A `Ledger` is cheap to clone; clones share the same data, so a ledger can
/// be handed to several threads that each run their own transactions.
///
/// ```no_run
/// use isoledger::prelude::*;
///
/// let ledger = Ledger::new(LedgerConfig::default());
///
/// let mut setup = ledger.begin(IsolationLevel::ReadCommitted);
/// setup.write("balance", 1000).unwrap();
/// setup.commit().unwrap();
///
/// let mut reader = ledger.begin(IsolationLevel::RepeatableRead);
/// assert_eq!(reader.read("balance").unwrap(), Some(Value::Int(1000)));
/// ```
#[derive(Clone)]
pub struct Ledger {
    core: Arc<LedgerCore>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl Ledger {
    /// Creates a new, empty ledger.
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            core: Arc::new(LedgerCore::new(config, None)),
        }
    }

    /// Creates a new ledger that hands every committed write set to
    /// `storage`.
    pub fn with_storage(config: LedgerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            core: Arc::new(LedgerCore::new(config, Some(storage))),
        }
    }

    /// Starts a new transaction at `isolation_level`.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Transaction {
        let id = self.core.next_txn_id();
        Transaction::new(id, isolation_level, Arc::clone(&self.core))
    }

    /// Starts a new transaction at the configured default isolation level.
    pub fn begin_default(&self) -> Transaction {
        self.begin(self.core.config.default_isolation)
    }

    /// Sequence number of the last commit; 0 before the first one.
    pub fn current_commit_seq(&self) -> CommitSeq {
        self.core.current_seq()
    }

    /// Latest committed value of `key`.
    pub fn committed_value(&self, key: &str) -> Option<Value> {
        self.core
            .store
            .committed_value(key, self.core.current_seq())
    }

    /// Latest committed value of every key.
    pub fn committed_state(&self) -> BTreeMap<String, Value> {
        self.core.store.committed_state(self.core.current_seq())
    }

    /// Every version chain, including uncommitted and deleted versions.
    pub fn dump_versions(&self) -> BTreeMap<String, Vec<Version>> {
        self.core.store.dump()
    }

    /// Drops versions no active transaction can see any more, and forgets
    /// committed transactions that can no longer take part in a
    /// serialization cycle.
    pub fn collect_garbage(&self) -> GcStats {
        self.core.collect_garbage()
    }

    /// Number of transactions that have begun and not yet ended.
    pub fn active_transactions(&self) -> usize {
        self.core.dependency_tracker.active_count()
    }

    pub fn version_count(&self) -> usize {
        self.core.store.version_count()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.core.config
    }
}
