use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::data_store::key_range::KeyRange;
use crate::errors::*;
use crate::isolation::IsolationLevel;
use crate::{CommitSeq, TxnId};

/// Lifecycle stage of a transaction as seen by the `DependencyTracker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnState {
    /// The transaction is currently active and has not yet attempted to commit or abort.
    Active,
    /// The transaction has successfully committed.
    Committed,
}

/// Holds information about a transaction relevant for serialization graph
/// validation.
#[derive(Debug, Clone)]
pub(crate) struct TransactionInfo {
    pub(crate) state: TxnState,
    pub(crate) isolation: IsolationLevel,
    /// Counter value at `begin`.
    pub(crate) start_seq: CommitSeq,
    /// Snapshot the transaction reads from, once fixed.
    pub(crate) snapshot_seq: Option<CommitSeq>,
    pub(crate) commit_seq: Option<CommitSeq>,
    /// Keys read (Serializable transactions only).
    pub(crate) reads: HashSet<String>,
    /// Ranges scanned (Serializable transactions only).
    pub(crate) predicates: Vec<KeyRange>,
    /// Keys written, for every isolation level.
    pub(crate) writes: HashSet<String>,
}

impl TransactionInfo {
    fn read_covers(&self, key: &str) -> bool {
        self.reads.contains(key) || self.predicates.iter().any(|r| r.contains(key))
    }

    /// Whether a commit at `seq` is part of this transaction's snapshot.
    fn sees_commit(&self, seq: CommitSeq) -> bool {
        self.snapshot_seq.is_some_and(|snap| seq <= snap)
    }

    /// True when this transaction has to precede `other` in any equivalent
    /// serial order.
    fn precedes(&self, other: &TransactionInfo) -> bool {
        let (Some(own_commit), Some(other_commit)) = (self.commit_seq, other.commit_seq) else {
            return false;
        };

        // rw: we read something `other` overwrote without seeing its commit.
        let rw = !self.sees_commit(other_commit)
            && other.writes.iter().any(|key| self.read_covers(key));
        if rw {
            return true;
        }

        // wr: `other` read something we wrote, and saw our commit.
        let wr = other.sees_commit(own_commit)
            && self.writes.iter().any(|key| other.read_covers(key));
        if wr {
            return true;
        }

        // ww: both wrote a key and we committed first.
        own_commit < other_commit && self.writes.iter().any(|key| other.writes.contains(key))
    }
}

/// Something a transaction read: a single key or a whole range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataItem {
    Key(String),
    Range(KeyRange),
}

/// Tracks read and write sets of transactions to validate serializability.
///
/// Every transaction is registered at `begin`. Write sets are kept for all
/// isolation levels, read sets only for `Serializable` ones. Committed
/// transactions stay in the tracker while they can still take part in a
/// cycle with a transaction that is active.
pub struct DependencyTracker {
    transactions: RwLock<HashMap<TxnId, TransactionInfo>>,
    /// Highest commit sequence seen, used as horizon when nothing is active.
    last_commit: AtomicU64,
    // Counter for triggering cleanup periodically
    cleanup_counter: AtomicU64,
    cleanup_threshold: u64,
}

impl Default for DependencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyTracker {
    /// Creates a new `DependencyTracker`.
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            last_commit: AtomicU64::new(0),
            cleanup_counter: AtomicU64::new(0),
            cleanup_threshold: 256,
        }
    }

    /// Registers a new transaction as Active.
    pub fn register_txn(&self, txn_id: TxnId, start_seq: CommitSeq, isolation: IsolationLevel) {
        let info = TransactionInfo {
            state: TxnState::Active,
            isolation,
            start_seq,
            snapshot_seq: None,
            commit_seq: None,
            reads: HashSet::new(),
            predicates: Vec::new(),
            writes: HashSet::new(),
        };
        self.transactions.write().insert(txn_id, info);
        debug!("Registered Tx {} as Active ({}, start {})", txn_id, isolation, start_seq);
    }

    /// Records the snapshot an active transaction reads from.
    pub fn set_snapshot(&self, txn_id: TxnId, snapshot_seq: CommitSeq) {
        if let Some(info) = self.transactions.write().get_mut(&txn_id) {
            info.snapshot_seq = Some(snapshot_seq);
        }
    }

    /// Records that an *active* `Serializable` transaction read a key or
    /// scanned a range. Reads of other levels are not tracked.
    pub fn record_read(&self, reader_id: TxnId, data_item: DataItem) {
        let mut transactions = self.transactions.write();
        let Some(info) = transactions.get_mut(&reader_id).filter(|info| {
            info.state == TxnState::Active && info.isolation == IsolationLevel::Serializable
        }) else {
            return;
        };
        debug!("Recorded read: Tx {} read {:?}", reader_id, data_item);
        match data_item {
            DataItem::Key(key) => {
                info.reads.insert(key);
            }
            DataItem::Range(range) => {
                if !info.predicates.contains(&range) {
                    info.predicates.push(range);
                }
            }
        }
    }

    /// Records that an *active* transaction wrote `key`.
    pub fn record_write(&self, writer_id: TxnId, key: &str) {
        if let Some(info) = self
            .transactions
            .write()
            .get_mut(&writer_id)
            .filter(|info| info.state == TxnState::Active)
        {
            info.writes.insert(key.to_string());
        }
    }

    /// Validates that committing `committing_tx_id` at `commit_seq` keeps the
    /// history serializable.
    ///
    /// Builds the serialization graph between the committing transaction and
    /// every retained committed transaction and searches for a cycle through
    /// the committing one. Edges come from rw anti-dependencies (a read that
    /// did not see a concurrent write), wr dependencies and ww ordering.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Conflict` with `ConflictReason::SerializationFailure`
    /// when a cycle exists. An untracked transaction validates trivially.
    pub fn validate_serializability(&self, committing_tx_id: TxnId, commit_seq: CommitSeq) -> Result<()> {
        let transactions = self.transactions.read();
        let Some(committing) = transactions.get(&committing_tx_id) else {
            debug!("Tx {} not tracked; nothing to validate", committing_tx_id);
            return Ok(());
        };
        let mut committing = committing.clone();
        committing.commit_seq = Some(commit_seq);

        let mut nodes: Vec<(TxnId, &TransactionInfo)> = vec![(committing_tx_id, &committing)];
        nodes.extend(
            transactions
                .iter()
                .filter(|(id, info)| **id != committing_tx_id && info.state == TxnState::Committed)
                .map(|(id, info)| (*id, info)),
        );

        let cycle = find_cycle(&nodes);
        drop(transactions);

        match cycle {
            Some(cycle) => {
                debug!(
                    "Serializable validation failed for Tx {}: cycle {:?}",
                    committing_tx_id, cycle
                );
                Err(LedgerError::Conflict {
                    txn: committing_tx_id,
                    reason: ConflictReason::SerializationFailure { cycle },
                })
            }
            None => {
                debug!("Serializable validation successful for Tx {}", committing_tx_id);
                Ok(())
            }
        }
    }

    /// Marks a transaction as Committed at `commit_seq`.
    pub fn mark_committed(&self, txn_id: TxnId, commit_seq: CommitSeq) {
        {
            let mut transactions = self.transactions.write();
            if let Some(info) = transactions.get_mut(&txn_id) {
                info.state = TxnState::Committed;
                info.commit_seq = Some(commit_seq);
                debug!("Marked Tx {} as Committed (seq {})", txn_id, commit_seq);
            } else {
                debug!("Warning: Tx {} not found in tracker to mark as Committed.", txn_id);
            }
        }
        self.last_commit.fetch_max(commit_seq, Ordering::SeqCst);
        self.maybe_trigger_cleanup();
    }

    /// Forgets an aborted transaction; its reads and writes never happened.
    pub fn mark_aborted(&self, txn_id: TxnId) {
        if self.transactions.write().remove(&txn_id).is_some() {
            debug!("Marked Tx {} as Aborted", txn_id);
        }
        self.maybe_trigger_cleanup();
    }

    /// Smallest start sequence among active transactions, or the last commit
    /// sequence if nothing is active. No active transaction reads below it.
    pub fn active_horizon(&self) -> CommitSeq {
        self.transactions
            .read()
            .values()
            .filter(|info| info.state == TxnState::Active)
            .map(|info| info.start_seq)
            .min()
            .unwrap_or_else(|| self.last_commit.load(Ordering::SeqCst))
    }

    pub fn active_count(&self) -> usize {
        self.transactions
            .read()
            .values()
            .filter(|info| info.state == TxnState::Active)
            .count()
    }

    pub fn tracked_count(&self) -> usize {
        self.transactions.read().len()
    }

    fn maybe_trigger_cleanup(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count >= self.cleanup_threshold {
            self.cleanup_counter.store(0, Ordering::Relaxed);
            self.cleanup_old_txns();
        }
    }

    /// Drops committed transactions that can no longer be part of a cycle.
    ///
    /// A committed transaction is kept while its commit is newer than the
    /// start of some active transaction, or newer than the snapshot of some
    /// other retained committed transaction. Returns how many were removed.
    pub fn cleanup_old_txns(&self) -> usize {
        let mut transactions = self.transactions.write();
        let mut horizon = transactions
            .values()
            .filter(|info| info.state == TxnState::Active)
            .map(|info| info.start_seq)
            .min()
            .unwrap_or_else(|| self.last_commit.load(Ordering::SeqCst));

        loop {
            let lowered = transactions
                .values()
                .filter(|info| info.commit_seq.is_some_and(|c| c > horizon))
                .filter_map(|info| info.snapshot_seq)
                .min();
            match lowered {
                Some(snap) if snap < horizon => horizon = snap,
                _ => break,
            }
        }

        let initial_count = transactions.len();
        transactions.retain(|_, info| {
            info.state == TxnState::Active || info.commit_seq.is_some_and(|c| c > horizon)
        });
        let removed_count = initial_count - transactions.len();
        if removed_count > 0 {
            debug!("Cleaned up info for {} old transactions.", removed_count);
        }
        removed_count
    }
}

/// Depth-first search for a path from the first node back to itself.
fn find_cycle(nodes: &[(TxnId, &TransactionInfo)]) -> Option<Vec<TxnId>> {
    let successors: Vec<Vec<usize>> = nodes
        .iter()
        .enumerate()
        .map(|(i, (_, from))| {
            nodes
                .iter()
                .enumerate()
                .filter(|(j, (_, to))| *j != i && from.precedes(to))
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    let mut visited = vec![false; nodes.len()];
    let mut path = vec![0usize];
    let mut stack: Vec<std::slice::Iter<'_, usize>> = vec![successors[0].iter()];

    while let Some(frontier) = stack.last_mut() {
        match frontier.next() {
            Some(&0) => return Some(path.iter().map(|&idx| nodes[idx].0).collect()),
            Some(&next) if !visited[next] => {
                visited[next] = true;
                path.push(next);
                stack.push(successors[next].iter());
            }
            Some(_) => {}
            None => {
                stack.pop();
                path.pop();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_write_skew_forms_cycle() {
        let tracker = DependencyTracker::new();
        for id in [1, 2] {
            tracker.register_txn(id, 0, IsolationLevel::Serializable);
            tracker.set_snapshot(id, 0);
            tracker.record_read(id, DataItem::Key("x".into()));
            tracker.record_read(id, DataItem::Key("y".into()));
        }
        tracker.record_write(1, "x");
        tracker.record_write(2, "y");

        tracker.validate_serializability(1, 1).unwrap();
        tracker.mark_committed(1, 1);

        let err = tracker.validate_serializability(2, 2).unwrap_err();
        match err {
            LedgerError::Conflict {
                txn: 2,
                reason: ConflictReason::SerializationFailure { cycle },
            } => assert_eq!(cycle, vec![2, 1]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_read_only_transaction_serializes_before_writer() {
        let tracker = DependencyTracker::new();
        tracker.register_txn(1, 0, IsolationLevel::Serializable);
        tracker.set_snapshot(1, 0);
        tracker.record_read(1, DataItem::Key("x".into()));

        tracker.register_txn(2, 0, IsolationLevel::Serializable);
        tracker.set_snapshot(2, 0);
        tracker.record_write(2, "x");
        tracker.validate_serializability(2, 1).unwrap();
        tracker.mark_committed(2, 1);

        assert!(tracker.validate_serializability(1, 2).is_ok());
    }

    #[test]
    fn test_precedes_edges() {
        let base = TransactionInfo {
            state: TxnState::Committed,
            isolation: IsolationLevel::Serializable,
            start_seq: 0,
            snapshot_seq: Some(0),
            commit_seq: Some(1),
            reads: HashSet::new(),
            predicates: Vec::new(),
            writes: HashSet::new(),
        };
        let writer = TransactionInfo {
            writes: keys(&["acct:3"]),
            ..base.clone()
        };
        let scanner = TransactionInfo {
            predicates: vec![KeyRange::prefix("acct:")],
            commit_seq: Some(2),
            ..base.clone()
        };
        // scanner did not see writer's commit at seq 1: rw edge scanner -> writer.
        assert!(scanner.precedes(&writer));
        // writer committed first and wrote nothing the scanner saw.
        assert!(!writer.precedes(&scanner));
    }

    #[test]
    fn test_cleanup_keeps_overlapping_commits() {
        let tracker = DependencyTracker::new();
        tracker.register_txn(1, 0, IsolationLevel::Serializable);
        tracker.register_txn(2, 0, IsolationLevel::ReadCommitted);
        tracker.record_write(2, "a");
        tracker.mark_committed(2, 1);

        assert_eq!(tracker.cleanup_old_txns(), 0);
        tracker.mark_aborted(1);
        assert_eq!(tracker.cleanup_old_txns(), 1);
        assert_eq!(tracker.tracked_count(), 0);
    }
}
