use thiserror::Error;

use crate::transaction::TxnStatus;
use crate::{CommitSeq, TxnId};

/// Why a transaction was refused at write or commit time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The row changed after the transaction's snapshot was taken
    /// (first-updater-wins).
    #[error("concurrent update of key '{key}' committed at seq {committed_at}")]
    ConcurrentUpdate { key: String, committed_at: CommitSeq },

    /// Committing would close a cycle in the serialization graph.
    #[error("serialization graph cycle through {cycle:?}")]
    SerializationFailure { cycle: Vec<TxnId> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("transaction {txn} conflict: {reason}")]
    Conflict { txn: TxnId, reason: ConflictReason },

    #[error("transaction {txn} aborted as deadlock victim")]
    DeadlockAbort { txn: TxnId },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("transaction {txn} is {status}")]
    InvalidState { txn: TxnId, status: TxnStatus },

    #[error("lock on '{key}' is held by transaction {holder}")]
    LockNotAvailable { key: String, holder: TxnId },

    #[error("timed out waiting for lock on '{key}'")]
    LockTimeout { key: String },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Errors after which the whole transaction has been aborted and should be
    /// retried from the start.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict { .. } | LedgerError::DeadlockAbort { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
