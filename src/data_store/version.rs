use crate::data_store::value::Value;
use crate::{CommitSeq, TxnId};

/// One entry of a row's version chain.
///
/// The value never changes after the version is appended. The commit stamps
/// (`created_seq`, `deleted_seq`) start out empty and are filled in exactly
/// once, when the creating or deleting transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    value: Value,
    created_by: TxnId,
    created_seq: Option<CommitSeq>,
    deleted_by: Option<TxnId>,
    deleted_seq: Option<CommitSeq>,
}

impl Version {
    /// Creates an uncommitted version written by `created_by`.
    pub fn new(value: Value, created_by: TxnId) -> Self {
        Self {
            value,
            created_by,
            created_seq: None,
            deleted_by: None,
            deleted_seq: None,
        }
    }

    /// Creates a version that is already committed at `seq`.
    pub fn committed(value: Value, created_by: TxnId, seq: CommitSeq) -> Self {
        Self {
            created_seq: Some(seq),
            ..Self::new(value, created_by)
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn created_by(&self) -> TxnId {
        self.created_by
    }

    pub fn created_seq(&self) -> Option<CommitSeq> {
        self.created_seq
    }

    pub fn deleted_by(&self) -> Option<TxnId> {
        self.deleted_by
    }

    pub fn deleted_seq(&self) -> Option<CommitSeq> {
        self.deleted_seq
    }

    /// True while no deletion mark (committed or not) exists.
    pub fn is_live(&self) -> bool {
        self.deleted_by.is_none()
    }

    /// Latest commit that touched this version, if any.
    pub fn last_commit_seq(&self) -> Option<CommitSeq> {
        match (self.created_seq, self.deleted_seq) {
            (Some(c), Some(d)) => Some(c.max(d)),
            (c, d) => c.or(d),
        }
    }

    pub(crate) fn mark_deleted(&mut self, txn: TxnId) {
        self.deleted_by = Some(txn);
    }

    pub(crate) fn clear_deletion(&mut self) {
        self.deleted_by = None;
        self.deleted_seq = None;
    }

    /// Fills in the commit stamps owned by `txn`.
    pub(crate) fn stamp(&mut self, txn: TxnId, seq: CommitSeq) {
        if self.created_by == txn && self.created_seq.is_none() {
            self.created_seq = Some(seq);
        }
        if self.deleted_by == Some(txn) && self.deleted_seq.is_none() {
            self.deleted_seq = Some(seq);
        }
    }
}
