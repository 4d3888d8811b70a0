use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data_store::version::Version;
use crate::{CommitSeq, TxnId};

/// Defines the isolation levels supported by the ledger.
///
/// Isolation levels determine how concurrent transactions interact with each
/// other and which anomalies they may observe. The level is a tag chosen at
/// `begin`; every read consults [`is_visible`] with a [`ReadView`] built from
/// that tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// **Read Uncommitted:**
    ///
    /// Reads return the newest version in the chain whether or not its writer
    /// has committed. Dirty reads, non-repeatable reads and phantoms are all
    /// possible. Uncommitted writes disappear again when their writer rolls back.
    ReadUncommitted,
    /// **Read Committed:**
    ///
    /// Every statement sees data committed as of the moment the statement runs.
    /// Reading the same key twice may return different values if another
    /// transaction commits in between.
    ReadCommitted,
    /// **Repeatable Read:**
    ///
    /// All point reads see the snapshot fixed by the first statement of the
    /// transaction. Writes to rows changed after that snapshot are rejected
    /// (first-updater-wins). Whether range scans observe phantoms depends on the
    /// ledger's [`PhantomPolicy`].
    RepeatableRead,
    /// **Serializable:**
    ///
    /// Snapshot reads as with `RepeatableRead`, range scans included. In addition
    /// the dependency tracker records reads and predicate reads, and commit fails
    /// when the transaction would close a cycle in the serialization graph.
    Serializable,
}

impl IsolationLevel {
    /// Levels whose reads come from a snapshot fixed at the first statement.
    pub fn uses_snapshot(self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}

/// How range scans behave under `RepeatableRead`.
///
/// The two big open source databases disagree here, so the ledger lets the
/// caller pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhantomPolicy {
    /// InnoDB style: plain scans read the transaction snapshot and locking
    /// scans take gap (range) locks, so no phantoms appear.
    #[default]
    #[serde(rename = "mysql")]
    MySql,
    /// Scans read the latest committed state, so rows inserted and committed by
    /// other transactions show up on re-execution.
    #[serde(rename = "postgresql")]
    PostgreSql,
}

/// The parameters a single read is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    /// The transaction performing the read.
    pub reader: TxnId,
    /// Commits with a sequence at or below this are visible.
    pub seq: CommitSeq,
    pub level: IsolationLevel,
}

impl ReadView {
    pub fn new(reader: TxnId, seq: CommitSeq, level: IsolationLevel) -> Self {
        Self { reader, seq, level }
    }

    fn sees_uncommitted(&self) -> bool {
        self.level == IsolationLevel::ReadUncommitted
    }
}

/// Decides whether `version` is visible to `view`.
///
/// A reader always sees its own writes and never the rows it deleted. Other
/// transactions' work counts once committed at or below `view.seq`; under
/// `ReadUncommitted` uncommitted creations and deletions count immediately.
pub fn is_visible(version: &Version, view: &ReadView) -> bool {
    let created = if version.created_by() == view.reader {
        true
    } else {
        match version.created_seq() {
            Some(seq) => seq <= view.seq,
            None => view.sees_uncommitted(),
        }
    };
    if !created {
        return false;
    }

    match version.deleted_by() {
        None => true,
        Some(deleter) if deleter == view.reader => false,
        Some(_) => match version.deleted_seq() {
            Some(seq) => seq > view.seq,
            None => !view.sees_uncommitted(),
        },
    }
}
