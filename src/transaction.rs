use ahash::AHashSet as HashSet;
use log::{debug, trace};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::conflict::detection::detect_write_conflict;
use crate::conflict::lock_table::LockOwner;
use crate::data_store::key_range::KeyRange;
use crate::data_store::value::Value;
use crate::dependency_tracking::DataItem;
use crate::errors::{LedgerError, Result};
use crate::isolation::{IsolationLevel, PhantomPolicy, ReadView};
use crate::ledger::LedgerCore;
use crate::storage::StorageMutation;
use crate::{CommitSeq, TxnId};

/// Lifecycle of a transaction.
///
/// `Active -> Committing -> Committed` on success and
/// `Active -> Aborting -> Aborted` on rollback or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnStatus::Active => "active",
            TxnStatus::Committing => "committing",
            TxnStatus::Committed => "committed",
            TxnStatus::Aborting => "aborting",
            TxnStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Represents a single transaction.
///
/// A transaction provides a mechanism for performing a series of read, write,
/// and delete operations on the ledger atomically and in isolation. Writes go
/// straight into the shared version chains as uncommitted versions tagged with
/// the transaction id; commit stamps them with the next commit sequence and
/// rollback removes them again.
///
/// Transactions are created by [`Ledger::begin`](crate::ledger::Ledger::begin).
/// Dropping a transaction that is still active rolls it back.
///
/// # Examples
///
/// ```no_run
/// use isoledger::prelude::*;
///
/// let ledger = Ledger::new(LedgerConfig::default());
/// let mut txn = ledger.begin(IsolationLevel::RepeatableRead);
/// txn.write("balance", 1000).unwrap();
/// let seq = txn.commit().unwrap();
/// assert_eq!(ledger.current_commit_seq(), seq);
/// ```
pub struct Transaction {
    /// Unique identifier for the transaction.
    id: TxnId,
    /// The isolation level for this transaction.
    isolation_level: IsolationLevel,
    /// Commit counter value at `begin`.
    start_seq: CommitSeq,
    /// Snapshot used by `RepeatableRead` and `Serializable`, fixed by the
    /// first statement.
    snapshot_seq: Option<CommitSeq>,
    status: TxnStatus,
    /// Keys read by this transaction.
    read_set: HashSet<String>,
    /// Keys this transaction created or deleted versions of.
    write_set: HashSet<String>,
    core: Arc<LedgerCore>,
}

impl Transaction {
    /// Creates a new transaction and registers it with the dependency tracker.
    pub(crate) fn new(id: TxnId, isolation_level: IsolationLevel, core: Arc<LedgerCore>) -> Self {
        let start_seq = core.current_seq();
        core.dependency_tracker
            .register_txn(id, start_seq, isolation_level);
        debug!(
            "Tx {} began at {} (start seq {})",
            id, isolation_level, start_seq
        );
        Self {
            id,
            isolation_level,
            start_seq,
            snapshot_seq: None,
            status: TxnStatus::Active,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
            core,
        }
    }

    /// Returns the unique identifier of the transaction.
    ///
    /// Identifiers are assigned in `begin` order, starting at 1.
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// The commit counter value when the transaction began.
    pub fn start_seq(&self) -> CommitSeq {
        self.start_seq
    }

    /// The snapshot this transaction reads from, once its first statement ran.
    /// Always `None` below `RepeatableRead`.
    pub fn snapshot_seq(&self) -> Option<CommitSeq> {
        self.snapshot_seq
    }

    pub fn read_keys(&self) -> impl Iterator<Item = &str> {
        self.read_set.iter().map(String::as_str)
    }

    pub fn write_keys(&self) -> impl Iterator<Item = &str> {
        self.write_set.iter().map(String::as_str)
    }

    /// Reads the value of `key` visible to this transaction.
    ///
    /// What is visible depends on the isolation level:
    ///
    /// - `ReadUncommitted` returns the newest version, committed or not.
    /// - `ReadCommitted` returns the newest version committed at the moment of
    ///   the call.
    /// - `RepeatableRead` and `Serializable` return the newest version committed
    ///   at or before the transaction snapshot.
    ///
    /// The transaction's own uncommitted writes are always visible.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` if the key has a visible version.
    /// - `Ok(None)` if it does not.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidState` if the transaction is no longer
    /// active.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use isoledger::prelude::*;
    ///
    /// let ledger = Ledger::new(LedgerConfig::default());
    /// let mut txn = ledger.begin(IsolationLevel::ReadCommitted);
    /// match txn.read("balance") {
    ///     Ok(Some(value)) => println!("balance = {}", value),
    ///     Ok(None) => println!("no balance yet"),
    ///     Err(e) => eprintln!("read failed: {}", e),
    /// }
    /// ```
    pub fn read(&mut self, key: &str) -> Result<Option<Value>> {
        self.ensure_active()?;
        let view = self.statement_view();
        let value = self.core.store.get(key, &view);
        trace!("Tx {} read '{}' at seq {}: {:?}", self.id, key, view.seq, value);
        self.record_key_read(key);
        Ok(value)
    }

    /// Like [`read`](Self::read), but an absent key is an error.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::NotFound` when no version of `key` is visible.
    pub fn read_existing(&mut self, key: &str) -> Result<Value> {
        self.read(key)?
            .ok_or_else(|| LedgerError::NotFound(key.to_string()))
    }

    /// Locks `key` and reads its latest committed value (`SELECT ... FOR
    /// UPDATE`).
    ///
    /// The row lock is held until the transaction ends, so the value cannot
    /// change underneath a following write. Depending on the ledger's
    /// [`LockWait`](crate::conflict::lock_table::LockWait) setting the call
    /// fails immediately or blocks when another transaction holds the lock.
    ///
    /// # Errors
    ///
    /// - `LedgerError::LockNotAvailable` / `LedgerError::LockTimeout` when the
    ///   lock cannot be taken; the transaction stays active.
    /// - `LedgerError::DeadlockAbort` when this transaction is chosen as a
    ///   deadlock victim.
    /// - `LedgerError::Conflict` under `RepeatableRead` and `Serializable` when
    ///   the row changed after the snapshot.
    ///
    /// The last two roll the transaction back.
    pub fn read_for_update(&mut self, key: &str) -> Result<Option<Value>> {
        self.ensure_active()?;
        let snapshot = self.fix_snapshot();
        self.lock_row(key)?;
        self.check_write_conflict(snapshot, key)?;

        let view = self.current_view();
        let value = self.core.store.get(key, &view);
        trace!("Tx {} read '{}' for update: {:?}", self.id, key, value);
        self.record_key_read(key);
        Ok(value)
    }

    /// Returns every visible row in `range`, in key order.
    ///
    /// Under `RepeatableRead` with [`PhantomPolicy::PostgreSql`] the scan sees
    /// the latest committed state instead of the snapshot, so rows committed by
    /// other transactions since the snapshot show up (phantom reads).
    pub fn scan(&mut self, range: &KeyRange) -> Result<Vec<(String, Value)>> {
        self.ensure_active()?;
        let view = if self.isolation_level == IsolationLevel::RepeatableRead
            && self.core.config.phantom_policy == PhantomPolicy::PostgreSql
        {
            self.fix_snapshot();
            self.current_view()
        } else {
            self.statement_view()
        };

        let rows = self.core.store.scan(range, &view);
        trace!(
            "Tx {} scanned {} at seq {}: {} rows",
            self.id,
            range,
            view.seq,
            rows.len()
        );
        self.record_range_read(range, rows.iter().map(|(key, _)| key));
        Ok(rows)
    }

    /// Locks and returns every row in `range` (`SELECT ... WHERE ... FOR
    /// UPDATE`).
    ///
    /// Under `Serializable`, and under `RepeatableRead` with
    /// [`PhantomPolicy::MySql`], the whole range is locked first so no other
    /// transaction can insert into it until this one ends. Otherwise only the
    /// rows found are locked.
    ///
    /// # Errors
    ///
    /// As for [`read_for_update`](Self::read_for_update).
    pub fn scan_for_update(&mut self, range: &KeyRange) -> Result<Vec<(String, Value)>> {
        self.ensure_active()?;
        let snapshot = self.fix_snapshot();
        let gap_lock = match self.isolation_level {
            IsolationLevel::Serializable => true,
            IsolationLevel::RepeatableRead => {
                self.core.config.phantom_policy == PhantomPolicy::MySql
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => false,
        };
        if gap_lock {
            self.lock_range(range)?;
        }

        let found: Vec<String> = self
            .core
            .store
            .scan(range, &self.current_view())
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let mut rows = Vec::with_capacity(found.len());
        for key in found {
            self.lock_row(&key)?;
            self.check_write_conflict(snapshot, &key)?;
            // Re-read under the lock: the row may have changed since the scan.
            if let Some(value) = self.core.store.get(&key, &self.current_view()) {
                rows.push((key, value));
            }
        }
        self.record_range_read(range, rows.iter().map(|(key, _)| key));
        Ok(rows)
    }

    /// Writes `value` under `key`.
    ///
    /// The new version is visible to this transaction immediately, to
    /// `ReadUncommitted` readers right away and to everyone else once the
    /// transaction commits. The row stays locked until the transaction ends.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Conflict` with `ConflictReason::ConcurrentUpdate` under
    ///   `RepeatableRead` and `Serializable` when another transaction committed
    ///   a change to `key` after this transaction's snapshot
    ///   (first-updater-wins). The transaction is rolled back.
    /// - Lock errors as for [`read_for_update`](Self::read_for_update).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use isoledger::prelude::*;
    ///
    /// let ledger = Ledger::new(LedgerConfig::default());
    /// let mut txn = ledger.begin(IsolationLevel::Serializable);
    /// txn.write("greeting", "hello").unwrap();
    /// txn.write("answer", 42).unwrap();
    /// txn.commit().unwrap();
    /// ```
    pub fn write(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.ensure_active()?;
        let key = key.into();
        let snapshot = self.fix_snapshot();
        self.lock_row(&key)?;
        self.check_write_conflict(snapshot, &key)?;

        self.core.store.put(&key, value.into(), self.id);
        self.core.dependency_tracker.record_write(self.id, &key);
        trace!("Tx {} wrote '{}'", self.id, key);
        self.write_set.insert(key);
        Ok(())
    }

    /// Deletes `key`. Deleting a key with no live version is a no-op.
    ///
    /// # Errors
    ///
    /// As for [`write`](Self::write).
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.ensure_active()?;
        let snapshot = self.fix_snapshot();
        self.lock_row(key)?;
        self.check_write_conflict(snapshot, key)?;

        if self.core.store.delete(key, self.id) {
            self.core.dependency_tracker.record_write(self.id, key);
            self.write_set.insert(key.to_string());
            trace!("Tx {} deleted '{}'", self.id, key);
        }
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// Under the ledger's commit mutex the transaction is validated
    /// (`Serializable` only), its changes are handed to the storage sink if
    /// one is configured, and every version it created or deleted is stamped
    /// with the next commit sequence. The sequence is published last, so
    /// readers see either all of the transaction's writes or none of them.
    /// Locks are released afterwards.
    ///
    /// # Returns
    ///
    /// The commit sequence assigned to this transaction. Read-only
    /// transactions consume a sequence number too.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Conflict` with `ConflictReason::SerializationFailure`
    ///   when committing would close a cycle in the serialization graph.
    /// - `LedgerError::Storage` when the storage sink rejects the changes.
    /// - `LedgerError::InvalidState` when the transaction is not active.
    ///
    /// In the first two cases the transaction is rolled back before returning.
    pub fn commit(&mut self) -> Result<CommitSeq> {
        self.ensure_active()?;
        self.status = TxnStatus::Committing;
        let core = Arc::clone(&self.core);

        let guard = core.commit_lock.lock();
        let seq = core.commit_counter.load(Ordering::SeqCst) + 1;

        if self.isolation_level == IsolationLevel::Serializable {
            if let Err(e) = core.dependency_tracker.validate_serializability(self.id, seq) {
                drop(guard);
                debug!("Tx {} failed validation: {}", self.id, e);
                self.abort_internal();
                return Err(e);
            }
        }

        if let Some(storage) = &core.storage {
            let mutations = self.pending_mutations();
            if !mutations.is_empty() {
                if let Err(e) = storage.apply_mutations(seq, mutations) {
                    drop(guard);
                    debug!("Tx {} storage sink failed: {}", self.id, e);
                    self.abort_internal();
                    return Err(e);
                }
            }
        }

        core.store.commit_txn(self.id, self.write_set.iter(), seq);
        core.dependency_tracker.mark_committed(self.id, seq);
        core.commit_counter.store(seq, Ordering::SeqCst);
        drop(guard);

        core.lock_table.release_all(self.id);
        self.status = TxnStatus::Committed;
        debug!(
            "Tx {} committed at seq {} ({} keys written)",
            self.id,
            seq,
            self.write_set.len()
        );
        core.maybe_collect_garbage();
        Ok(seq)
    }

    /// Rolls the transaction back, discarding every version it created and
    /// releasing its locks.
    ///
    /// Rolling back an already aborted transaction is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidState` for a committed transaction.
    pub fn rollback(&mut self) -> Result<()> {
        match self.status {
            TxnStatus::Aborted => Ok(()),
            TxnStatus::Active => {
                self.abort_internal();
                Ok(())
            }
            status => Err(LedgerError::InvalidState {
                txn: self.id,
                status,
            }),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(LedgerError::InvalidState {
                txn: self.id,
                status: self.status,
            })
        }
    }

    /// Fixes the snapshot on first use for snapshot levels and returns it.
    /// Lower levels get the current commit sequence.
    fn fix_snapshot(&mut self) -> CommitSeq {
        if !self.isolation_level.uses_snapshot() {
            return self.core.current_seq();
        }
        if let Some(seq) = self.snapshot_seq {
            return seq;
        }
        let seq = self.core.current_seq();
        self.snapshot_seq = Some(seq);
        self.core.dependency_tracker.set_snapshot(self.id, seq);
        trace!("Tx {} fixed snapshot at seq {}", self.id, seq);
        seq
    }

    /// The view a plain read statement runs against.
    fn statement_view(&mut self) -> ReadView {
        let seq = self.fix_snapshot();
        ReadView::new(self.id, seq, self.isolation_level)
    }

    fn current_view(&self) -> ReadView {
        ReadView::new(self.id, self.core.current_seq(), self.isolation_level)
    }

    fn owner(&self) -> LockOwner {
        LockOwner {
            txn: self.id,
            start_seq: self.start_seq,
        }
    }

    fn lock_row(&mut self, key: &str) -> Result<()> {
        let result = self
            .core
            .lock_table
            .lock_row(self.owner(), key, self.core.config.lock_wait);
        self.abort_on_fatal(result)
    }

    fn lock_range(&mut self, range: &KeyRange) -> Result<()> {
        let result = self
            .core
            .lock_table
            .lock_range(self.owner(), range, self.core.config.lock_wait);
        self.abort_on_fatal(result)
    }

    fn check_write_conflict(&mut self, snapshot: CommitSeq, key: &str) -> Result<()> {
        let result = detect_write_conflict(
            self.id,
            self.isolation_level,
            snapshot,
            key,
            &self.core.store,
        );
        self.abort_on_fatal(result)
    }

    /// Rolls the transaction back when `result` carries an error that ends it.
    fn abort_on_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_retryable() {
                debug!("Tx {} aborted: {}", self.id, e);
                self.abort_internal();
            }
        }
        result
    }

    fn record_key_read(&mut self, key: &str) {
        self.core
            .dependency_tracker
            .record_read(self.id, DataItem::Key(key.to_string()));
        self.read_set.insert(key.to_string());
    }

    fn record_range_read<'a>(&mut self, range: &KeyRange, keys: impl Iterator<Item = &'a String>) {
        self.core
            .dependency_tracker
            .record_read(self.id, DataItem::Range(range.clone()));
        self.read_set.extend(keys.cloned());
    }

    /// Final state of every written key, sorted by key.
    fn pending_mutations(&self) -> Vec<StorageMutation> {
        let view = ReadView::new(
            self.id,
            self.core.current_seq(),
            IsolationLevel::ReadCommitted,
        );
        let mut keys: Vec<&String> = self.write_set.iter().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| match self.core.store.get(key, &view) {
                Some(value) => StorageMutation::Put(key.clone(), value),
                None => StorageMutation::Delete(key.clone()),
            })
            .collect()
    }

    fn abort_internal(&mut self) {
        self.status = TxnStatus::Aborting;
        self.core.store.rollback_txn(self.id, self.write_set.iter());
        self.core.lock_table.release_all(self.id);
        self.core.dependency_tracker.mark_aborted(self.id);
        self.status = TxnStatus::Aborted;
        debug!(
            "Tx {} rolled back ({} keys discarded)",
            self.id,
            self.write_set.len()
        );
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.status, TxnStatus::Active | TxnStatus::Committing) {
            self.abort_internal();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("start_seq", &self.start_seq)
            .field("snapshot_seq", &self.snapshot_seq)
            .field("status", &self.status)
            .finish()
    }
}
