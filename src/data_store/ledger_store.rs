use crossbeam_skiplist::SkipMap;
use log::trace;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::data_store::key_range::KeyRange;
use crate::data_store::value::Value;
use crate::data_store::version::Version;
use crate::isolation::{IsolationLevel, ReadView, is_visible};
use crate::{CommitSeq, TxnId};

/// The key type for rows in the store.
type DataKey = String;

/// Reader id used for views that do not belong to any transaction.
const SYSTEM_READER: TxnId = TxnId::MAX;

/// The Ledger Store: an ordered, lock-free skip map from key to version chain.
///
/// Chains only grow by appending; the single writer allowed per key at any
/// time is decided by the lock table before the store is touched, so a chain
/// carries uncommitted state of at most one transaction.
pub struct LedgerStore {
    rows: SkipMap<DataKey, RwLock<Vec<Version>>>,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore {
    /// Creates a new, empty `LedgerStore`.
    pub fn new() -> Self {
        Self {
            rows: SkipMap::new(),
        }
    }

    /// Appends a new version of `key` written by `txn`.
    ///
    /// The current live head, if any, is marked deleted by `txn`, so it stops
    /// being visible once `txn` commits.
    pub fn put(&self, key: &str, value: Value, txn: TxnId) {
        loop {
            let entry = self
                .rows
                .get_or_insert_with(key.to_string(), || RwLock::new(Vec::new()));
            let mut chain = entry.value().write();
            // `prune` dropped the empty row after we looked it up.
            if entry.is_removed() {
                continue;
            }
            if let Some(head) = chain.last_mut() {
                if head.is_live() {
                    head.mark_deleted(txn);
                }
            }
            chain.push(Version::new(value, txn));
            trace!("Tx {} appended version {} of '{}'", txn, chain.len(), key);
            return;
        }
    }

    /// Marks the live head of `key` deleted by `txn`.
    ///
    /// Returns `false` when there was nothing live to delete.
    pub fn delete(&self, key: &str, txn: TxnId) -> bool {
        let Some(entry) = self.rows.get(key) else {
            return false;
        };
        let mut chain = entry.value().write();
        match chain.last_mut() {
            Some(head) if head.is_live() => {
                head.mark_deleted(txn);
                trace!("Tx {} marked '{}' deleted", txn, key);
                true
            }
            _ => false,
        }
    }

    /// Returns the newest version of `key` visible under `view`.
    pub fn get(&self, key: &str, view: &ReadView) -> Option<Value> {
        let entry = self.rows.get(key)?;
        let chain = entry.value().read();
        chain
            .iter()
            .rev()
            .find(|v| is_visible(v, view))
            .map(|v| v.value().clone())
    }

    /// Returns every key in `range` that has a version visible under `view`,
    /// in key order.
    pub fn scan(&self, range: &KeyRange, view: &ReadView) -> Vec<(String, Value)> {
        self.rows
            .range(range.bounds())
            .filter_map(|entry| {
                let chain = entry.value().read();
                chain
                    .iter()
                    .rev()
                    .find(|v| is_visible(v, view))
                    .map(|v| (entry.key().clone(), v.value().clone()))
            })
            .collect()
    }

    /// The latest commit sequence that created or deleted any version of `key`.
    pub fn last_commit_seq(&self, key: &str) -> Option<CommitSeq> {
        let entry = self.rows.get(key)?;
        let chain = entry.value().read();
        chain.iter().filter_map(Version::last_commit_seq).max()
    }

    /// Stamps every version `txn` created or deleted under `keys` with `seq`.
    ///
    /// Versions that `txn` both created and deleted were never visible to
    /// anyone else and are dropped.
    pub fn commit_txn<'a>(&self, txn: TxnId, keys: impl IntoIterator<Item = &'a String>, seq: CommitSeq) {
        for key in keys {
            let Some(entry) = self.rows.get(key.as_str()) else {
                continue;
            };
            let mut chain = entry.value().write();
            for version in chain.iter_mut() {
                version.stamp(txn, seq);
            }
            chain.retain(|v| !(v.created_by() == txn && v.deleted_by() == Some(txn)));
        }
    }

    /// Removes every trace of `txn` under `keys`: its versions are dropped and
    /// its deletion marks cleared.
    pub fn rollback_txn<'a>(&self, txn: TxnId, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            let Some(entry) = self.rows.get(key.as_str()) else {
                continue;
            };
            let mut chain = entry.value().write();
            chain.retain(|v| v.created_by() != txn || v.created_seq().is_some());
            for version in chain.iter_mut() {
                if version.deleted_by() == Some(txn) && version.deleted_seq().is_none() {
                    version.clear_deletion();
                }
            }
        }
    }

    /// Drops versions whose deletion committed at or before `horizon`, and
    /// rows left with no versions at all (fully pruned chains, rolled-back
    /// inserts). Returns how many versions were removed.
    pub fn prune(&self, horizon: CommitSeq) -> usize {
        let mut removed = 0;
        for entry in self.rows.iter() {
            let mut chain = entry.value().write();
            let before = chain.len();
            chain.retain(|v| v.deleted_seq().is_none_or(|d| d > horizon));
            removed += before - chain.len();
            if chain.is_empty() {
                // Removed while the chain is locked, so a concurrent `put`
                // sees `is_removed` and starts over on a fresh row.
                entry.remove();
            }
        }
        removed
    }

    /// Latest committed value of `key` as of `seq`.
    pub fn committed_value(&self, key: &str, seq: CommitSeq) -> Option<Value> {
        self.get(key, &ReadView::new(SYSTEM_READER, seq, IsolationLevel::ReadCommitted))
    }

    /// Latest committed value of every key as of `seq`.
    pub fn committed_state(&self, seq: CommitSeq) -> BTreeMap<String, Value> {
        let view = ReadView::new(SYSTEM_READER, seq, IsolationLevel::ReadCommitted);
        self.scan(&KeyRange::all(), &view).into_iter().collect()
    }

    /// Every non-empty version chain, keyed by row.
    pub fn dump(&self) -> BTreeMap<String, Vec<Version>> {
        self.rows
            .iter()
            .filter_map(|entry| {
                let chain = entry.value().read();
                (!chain.is_empty()).then(|| (entry.key().clone(), chain.to_vec()))
            })
            .collect()
    }

    /// Number of rows in the skip map, including rows whose chains are empty.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn version_count(&self) -> usize {
        self.rows.iter().map(|entry| entry.value().read().len()).sum()
    }
}
