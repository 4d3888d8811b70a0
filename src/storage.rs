use crate::CommitSeq;
use crate::data_store::value::Value;
use crate::errors::Result;

/// The key type for data items in the store.
type DataKey = String;

/// Represents a single committed change handed to a [`Storage`] sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMutation {
    /// Insert or update `key` with the given value.
    Put(DataKey, Value),
    /// Delete `key`. A sink that does not know the key treats this as a no-op.
    Delete(DataKey),
}

impl StorageMutation {
    pub fn key(&self) -> &str {
        match self {
            StorageMutation::Put(key, _) | StorageMutation::Delete(key) => key,
        }
    }
}

/// Trait for an optional sink that receives every committed write set.
///
/// The ledger itself is purely in-memory. A `Storage` implementation can
/// mirror committed state elsewhere (a log, a map used by tests, ...). The
/// sink is called once per commit, inside the ledger's commit critical
/// section and before the commit becomes visible, with mutations sorted by
/// key. If it fails the transaction is rolled back and the error returned to
/// the caller, so the sink never records a commit the ledger does not have.
///
/// Implementations must be `Send` and `Sync` to be used concurrently by
/// multiple transactions.
///
/// ```no_run
/// use isoledger::prelude::*;
/// use parking_lot::Mutex;
/// use std::collections::BTreeMap;
///
/// #[derive(Default)]
/// struct MapStorage {
///     data: Mutex<BTreeMap<String, Value>>,
/// }
///
/// impl Storage for MapStorage {
///     fn apply_mutations(&self, _seq: CommitSeq, mutations: Vec<StorageMutation>) -> Result<()> {
///         let mut data = self.data.lock();
///         for mutation in mutations {
///             match mutation {
///                 StorageMutation::Put(key, value) => {
///                     data.insert(key, value);
///                 }
///                 StorageMutation::Delete(key) => {
///                     data.remove(&key);
///                 }
///             }
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Storage: Send + Sync {
    /// Applies the mutations of the commit numbered `commit_seq` atomically.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the mutations could not be applied.
    fn apply_mutations(&self, commit_seq: CommitSeq, mutations: Vec<StorageMutation>) -> Result<()>;
}
