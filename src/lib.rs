pub mod config;
pub mod conflict;
pub mod data_store;
pub mod dependency_tracking;
pub mod errors;
pub mod harness;
pub mod isolation;
pub mod ledger;
pub mod storage;
pub mod transaction;

// Re-export key types and structs for easier access
pub use config::LedgerConfig;
pub use conflict::lock_table::LockWait;
pub use data_store::key_range::KeyRange;
pub use data_store::value::Value;
pub use data_store::version::Version;
pub use dependency_tracking::DataItem;
pub use errors::{ConflictReason, LedgerError, Result};
pub use harness::{AnomalyHarness, Interleaving, Op, Outcome, Script, Trace, TraceEvent};
pub use isolation::{IsolationLevel, PhantomPolicy};
pub use ledger::{GcStats, Ledger, prelude};
pub use storage::{Storage, StorageMutation};
pub use transaction::{Transaction, TxnStatus};

/// Identifier of a transaction, assigned in `begin` order starting at 1.
pub type TxnId = u64;

/// Position in the global commit order. Commit `n` is the `n`-th successful
/// commit; 0 means "before any commit".
pub type CommitSeq = u64;
