//! Common utilities for isoledger integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use isoledger::{
    CommitSeq, IsolationLevel, Ledger, LedgerConfig, LedgerError, LockWait, Value,
    errors::Result,
    storage::{Storage, StorageMutation},
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// --- MockStorage ---

/// A mock implementation of the `Storage` trait for testing purposes.
/// Keeps the mirrored rows in an in-memory HashMap and remembers the commit
/// sequence of every batch it received.
#[derive(Debug, Default)]
pub struct MockStorage {
    data: Mutex<HashMap<String, Value>>,
    commits: Mutex<Vec<(CommitSeq, Vec<StorageMutation>)>>,
    fail_next: AtomicBool,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieves a mirrored row.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every batch received so far, in arrival order.
    pub fn commits(&self) -> Vec<(CommitSeq, Vec<StorageMutation>)> {
        self.commits.lock().clone()
    }

    /// Makes the next `apply_mutations` call fail.
    pub fn fail_next_commit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Storage for MockStorage {
    fn apply_mutations(&self, commit_seq: CommitSeq, mutations: Vec<StorageMutation>) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Storage("injected failure".to_string()));
        }
        let mut data = self.data.lock();
        for mutation in &mutations {
            match mutation {
                StorageMutation::Put(key, value) => {
                    data.insert(key.clone(), value.clone());
                }
                StorageMutation::Delete(key) => {
                    data.remove(key);
                }
            }
        }
        self.commits.lock().push((commit_seq, mutations));
        Ok(())
    }
}

// --- Helper Functions ---

/// A ledger mirrored into a fresh `MockStorage`, failing lock conflicts
/// immediately.
pub fn setup_ledger() -> (Ledger, Arc<MockStorage>) {
    setup_ledger_with(LedgerConfig::default().with_lock_wait(LockWait::NoWait))
}

pub fn setup_ledger_with(config: LedgerConfig) -> (Ledger, Arc<MockStorage>) {
    let storage = Arc::new(MockStorage::new());
    let ledger = Ledger::with_storage(config, storage.clone());
    (ledger, storage)
}

/// Commits `pairs` in a single transaction.
pub fn seed(ledger: &Ledger, pairs: &[(&str, i64)]) -> CommitSeq {
    let mut txn = ledger.begin(IsolationLevel::ReadCommitted);
    for (key, value) in pairs {
        txn.write(*key, *value).unwrap();
    }
    txn.commit().unwrap()
}

pub fn int(v: i64) -> Option<Value> {
    Some(Value::Int(v))
}
