use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::data_store::key_range::KeyRange;
use crate::errors::{LedgerError, Result};
use crate::{CommitSeq, TxnId};

/// What a transaction does when a lock it needs is held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum LockWait {
    /// Fail immediately with `LockNotAvailable` (`FOR UPDATE NOWAIT`).
    NoWait,
    /// Block until the lock is released, the transaction is picked as a
    /// deadlock victim, or `timeout_ms` passes.
    Block { timeout_ms: u64 },
}

impl Default for LockWait {
    fn default() -> Self {
        LockWait::Block { timeout_ms: 1_000 }
    }
}

/// Identity and age of a lock requester. Older owners win deadlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub txn: TxnId,
    pub start_seq: CommitSeq,
}

impl LockOwner {
    /// Ordering key: the greatest value is the newest transaction.
    fn age_key(&self) -> (CommitSeq, TxnId) {
        (self.start_seq, self.txn)
    }
}

#[derive(Debug, Default)]
struct LockState {
    /// Exclusive row locks.
    rows: HashMap<String, TxnId>,
    /// Exclusive range (gap) locks.
    ranges: Vec<(KeyRange, TxnId)>,
    /// Rows held per transaction, for release.
    held_rows: HashMap<TxnId, Vec<String>>,
    /// Wait-for graph: waiter -> holder it is blocked on.
    waits_for: HashMap<TxnId, TxnId>,
    /// Age of every transaction currently waiting.
    waiters: HashMap<TxnId, LockOwner>,
    /// Blocked transactions chosen as deadlock victims, not yet woken.
    victims: HashSet<TxnId>,
}

impl LockState {
    fn row_blocker(&self, txn: TxnId, key: &str) -> Option<TxnId> {
        if let Some(&holder) = self.rows.get(key) {
            if holder != txn {
                return Some(holder);
            }
        }
        self.ranges
            .iter()
            .find(|(range, holder)| *holder != txn && range.contains(key))
            .map(|(_, holder)| *holder)
    }

    fn range_blocker(&self, txn: TxnId, range: &KeyRange) -> Option<TxnId> {
        self.rows
            .iter()
            .find(|(key, holder)| **holder != txn && range.contains(key))
            .map(|(_, holder)| *holder)
            .or_else(|| {
                self.ranges
                    .iter()
                    .find(|(other, holder)| *holder != txn && other.overlaps(range))
                    .map(|(_, holder)| *holder)
            })
    }

    /// Follows wait-for edges from `start`; returns the cycle if the walk
    /// comes back to `start`.
    fn cycle_from(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut path = vec![start];
        let mut current = *self.waits_for.get(&start)?;
        while current != start {
            if path.contains(&current) {
                // A cycle that does not involve `start`; its members detect it.
                return None;
            }
            path.push(current);
            current = *self.waits_for.get(&current)?;
        }
        Some(path)
    }

    fn stop_waiting(&mut self, txn: TxnId) {
        self.waits_for.remove(&txn);
        self.waiters.remove(&txn);
    }
}

enum Target<'a> {
    Row(&'a str),
    Range(&'a KeyRange),
}

impl Target<'_> {
    fn describe(&self) -> String {
        match self {
            Target::Row(key) => (*key).to_string(),
            Target::Range(range) => range.to_string(),
        }
    }
}

/// Row and range locks held until end of transaction, with wait-for graph
/// deadlock detection.
#[derive(Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive lock on `key` for `owner`. Re-entrant.
    pub fn lock_row(&self, owner: LockOwner, key: &str, wait: LockWait) -> Result<()> {
        self.acquire(owner, Target::Row(key), wait)
    }

    /// Acquires an exclusive lock over every key in `range`, including keys
    /// that do not exist yet.
    pub fn lock_range(&self, owner: LockOwner, range: &KeyRange, wait: LockWait) -> Result<()> {
        self.acquire(owner, Target::Range(range), wait)
    }

    fn acquire(&self, owner: LockOwner, target: Target<'_>, wait: LockWait) -> Result<()> {
        let deadline = match wait {
            LockWait::Block { timeout_ms } => Some(Instant::now() + Duration::from_millis(timeout_ms)),
            LockWait::NoWait => None,
        };
        let mut state = self.state.lock();

        loop {
            if state.victims.remove(&owner.txn) {
                state.stop_waiting(owner.txn);
                return Err(LedgerError::DeadlockAbort { txn: owner.txn });
            }

            let blocker = match &target {
                Target::Row(key) => state.row_blocker(owner.txn, key),
                Target::Range(range) => state.range_blocker(owner.txn, range),
            };

            let Some(holder) = blocker else {
                state.stop_waiting(owner.txn);
                match &target {
                    Target::Row(key) => {
                        if state.rows.insert((*key).to_string(), owner.txn).is_none() {
                            state
                                .held_rows
                                .entry(owner.txn)
                                .or_default()
                                .push((*key).to_string());
                        }
                    }
                    Target::Range(range) => {
                        if !state
                            .ranges
                            .iter()
                            .any(|(r, holder)| *holder == owner.txn && r == *range)
                        {
                            state.ranges.push(((*range).clone(), owner.txn));
                        }
                    }
                }
                debug!("Tx {} locked {}", owner.txn, target.describe());
                return Ok(());
            };

            let Some(deadline) = deadline else {
                return Err(LedgerError::LockNotAvailable {
                    key: target.describe(),
                    holder,
                });
            };

            state.waits_for.insert(owner.txn, holder);
            state.waiters.insert(owner.txn, owner);

            if let Some(cycle) = state.cycle_from(owner.txn) {
                let victim = cycle
                    .iter()
                    .filter_map(|txn| state.waiters.get(txn))
                    .max_by_key(|o| o.age_key())
                    .map(|o| o.txn)
                    .unwrap_or(owner.txn);
                warn!(
                    "Deadlock detected among {:?}; aborting newest Tx {}",
                    cycle, victim
                );
                if victim == owner.txn {
                    state.stop_waiting(owner.txn);
                    return Err(LedgerError::DeadlockAbort { txn: owner.txn });
                }
                state.victims.insert(victim);
                self.released.notify_all();
            }

            debug!(
                "Tx {} waiting on Tx {} for {}",
                owner.txn,
                holder,
                target.describe()
            );
            if self.released.wait_until(&mut state, deadline).timed_out() {
                state.stop_waiting(owner.txn);
                if state.victims.remove(&owner.txn) {
                    return Err(LedgerError::DeadlockAbort { txn: owner.txn });
                }
                warn!("Tx {} timed out waiting for {}", owner.txn, target.describe());
                return Err(LedgerError::LockTimeout {
                    key: target.describe(),
                });
            }
        }
    }

    /// Who currently holds the row lock on `key`.
    pub fn row_holder(&self, key: &str) -> Option<TxnId> {
        self.state.lock().rows.get(key).copied()
    }

    /// Releases every lock `txn` holds and wakes all waiters.
    pub fn release_all(&self, txn: TxnId) {
        let mut state = self.state.lock();
        if let Some(keys) = state.held_rows.remove(&txn) {
            for key in keys {
                if state.rows.get(&key) == Some(&txn) {
                    state.rows.remove(&key);
                }
            }
        }
        state.ranges.retain(|(_, holder)| *holder != txn);
        state.stop_waiting(txn);
        state.victims.remove(&txn);
        drop(state);
        self.released.notify_all();
        debug!("Released all locks of Tx {}", txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn owner(txn: TxnId) -> LockOwner {
        LockOwner { txn, start_seq: 0 }
    }

    #[test]
    fn test_row_lock_is_reentrant_and_exclusive() {
        let table = LockTable::new();
        table.lock_row(owner(1), "a", LockWait::NoWait).unwrap();
        table.lock_row(owner(1), "a", LockWait::NoWait).unwrap();

        let err = table.lock_row(owner(2), "a", LockWait::NoWait).unwrap_err();
        assert_eq!(
            err,
            LedgerError::LockNotAvailable {
                key: "a".to_string(),
                holder: 1
            }
        );

        table.release_all(1);
        table.lock_row(owner(2), "a", LockWait::NoWait).unwrap();
        assert_eq!(table.row_holder("a"), Some(2));
    }

    #[test]
    fn test_range_lock_blocks_inserts_into_gap() {
        let table = LockTable::new();
        table
            .lock_range(owner(1), &KeyRange::prefix("acct:"), LockWait::NoWait)
            .unwrap();

        assert!(table.lock_row(owner(2), "acct:9", LockWait::NoWait).is_err());
        assert!(table.lock_row(owner(2), "other", LockWait::NoWait).is_ok());
        assert!(
            table
                .lock_range(owner(3), &KeyRange::new("acct:5", "b"), LockWait::NoWait)
                .is_err()
        );
    }

    #[test]
    fn test_block_times_out() {
        let table = LockTable::new();
        table.lock_row(owner(1), "a", LockWait::NoWait).unwrap();
        let err = table
            .lock_row(owner(2), "a", LockWait::Block { timeout_ms: 20 })
            .unwrap_err();
        assert_eq!(err, LedgerError::LockTimeout { key: "a".to_string() });
    }

    #[test]
    fn test_victim_timing_out_is_still_aborted() {
        let table = Arc::new(LockTable::new());
        table.lock_row(owner(1), "a", LockWait::NoWait).unwrap();

        let waiter = table.clone();
        let handle = thread::spawn(move || {
            waiter.lock_row(owner(2), "a", LockWait::Block { timeout_ms: 100 })
        });
        while !table.state.lock().waiters.contains_key(&2) {
            thread::sleep(Duration::from_millis(1));
        }
        // Chosen as victim but never woken before the deadline.
        table.state.lock().victims.insert(2);

        assert_eq!(
            handle.join().expect("waiter panicked"),
            Err(LedgerError::DeadlockAbort { txn: 2 })
        );
        assert!(table.state.lock().victims.is_empty());

        table.release_all(1);
        table.lock_row(owner(2), "a", LockWait::NoWait).unwrap();
    }

    #[test]
    fn test_cycle_walk() {
        let mut state = LockState::default();
        state.waits_for.insert(1, 2);
        state.waits_for.insert(2, 3);
        assert!(state.cycle_from(1).is_none());
        state.waits_for.insert(3, 1);
        assert_eq!(state.cycle_from(1), Some(vec![1, 2, 3]));
    }
}
