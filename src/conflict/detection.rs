use log::debug;

use crate::data_store::ledger_store::LedgerStore;
use crate::errors::{ConflictReason, LedgerError, Result};
use crate::isolation::IsolationLevel;
use crate::{CommitSeq, TxnId};

/// Checks a write against concurrent committed writes.
///
/// Snapshot levels (`RepeatableRead`, `Serializable`) may only overwrite a row
/// whose latest committed change is part of their snapshot; otherwise the
/// write would silently discard an update the transaction never saw. Lower
/// levels always pass, which is how lost updates stay reproducible there.
///
/// Must be called while holding the row lock on `key`, so that no other
/// commit can touch the row between the check and the write.
pub fn detect_write_conflict(
    transaction_id: TxnId,
    isolation_level: IsolationLevel,
    snapshot_seq: CommitSeq,
    key: &str,
    store: &LedgerStore,
) -> Result<()> {
    if !isolation_level.uses_snapshot() {
        return Ok(());
    }

    match store.last_commit_seq(key) {
        Some(committed_at) if committed_at > snapshot_seq => {
            debug!(
                "Write conflict for Tx {} on '{}': committed at {} after snapshot {}",
                transaction_id, key, committed_at, snapshot_seq
            );
            Err(LedgerError::Conflict {
                txn: transaction_id,
                reason: ConflictReason::ConcurrentUpdate {
                    key: key.to_string(),
                    committed_at,
                },
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::value::Value;

    #[test]
    fn test_first_updater_wins_only_for_snapshot_levels() {
        let store = LedgerStore::new();
        let key = "balance".to_string();
        store.put("balance", Value::Int(1000), 1);
        store.commit_txn(1, [&key], 3);

        assert!(detect_write_conflict(9, IsolationLevel::ReadCommitted, 2, "balance", &store).is_ok());
        assert!(detect_write_conflict(9, IsolationLevel::RepeatableRead, 3, "balance", &store).is_ok());
        let err = detect_write_conflict(9, IsolationLevel::Serializable, 2, "balance", &store).unwrap_err();
        assert!(err.is_retryable());
        assert!(detect_write_conflict(9, IsolationLevel::RepeatableRead, 0, "missing", &store).is_ok());
    }
}
