// Commit log (CLOG) and distributed commit log.
//
// The CLOG stores the commit status of every transaction the cluster has
// decided. The distributed log additionally records, for transactions that
// took part in a distributed commit, the coordinator timestamp and
// distributed transaction id under which they committed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::common::TransactionId;

/// Commit status of a transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XidStatus {
    InProgress,
    Committed,
    Aborted,
}

/// Per-XID commit-status log.
///
/// Absent entries are in-progress: XIDs only appear once a decision (or an
/// explicit in-progress marker during replay) has been recorded.
#[derive(Debug, Default)]
pub struct Clog {
    status: DashMap<TransactionId, XidStatus>,
}

impl Clog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a transaction and all of its committed children as committed.
    pub fn set_committed_tree(&self, xid: TransactionId, children: &[TransactionId]) {
        self.status.insert(xid, XidStatus::Committed);
        for &child in children {
            self.status.insert(child, XidStatus::Committed);
        }
    }

    /// Marks a transaction and all of its children as aborted.
    pub fn set_aborted_tree(&self, xid: TransactionId, children: &[TransactionId]) {
        self.status.insert(xid, XidStatus::Aborted);
        for &child in children {
            self.status.insert(child, XidStatus::Aborted);
        }
    }

    pub fn status(&self, xid: TransactionId) -> XidStatus {
        self.status
            .get(&xid)
            .map(|entry| *entry.value())
            .unwrap_or(XidStatus::InProgress)
    }

    pub fn did_commit(&self, xid: TransactionId) -> bool {
        self.status(xid) == XidStatus::Committed
    }

    pub fn did_abort(&self, xid: TransactionId) -> bool {
        self.status(xid) == XidStatus::Aborted
    }
}

/// Distributed-commit metadata recorded alongside the local CLOG entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedCommit {
    /// Coordinator start timestamp embedded in the GID.
    pub distrib_timestamp: u64,
    /// Distributed transaction id embedded in the GID.
    pub distrib_xid: u64,
}

/// Distributed commit log.
#[derive(Debug, Default)]
pub struct DistributedLog {
    entries: DashMap<TransactionId, DistributedCommit>,
}

impl DistributedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the distributed commit for a transaction tree.
    pub fn set_committed_tree(
        &self,
        xid: TransactionId,
        children: &[TransactionId],
        distrib_timestamp: u64,
        distrib_xid: u64,
    ) {
        let entry = DistributedCommit {
            distrib_timestamp,
            distrib_xid,
        };
        self.entries.insert(xid, entry);
        for &child in children {
            self.entries.insert(child, entry);
        }
    }

    pub fn get(&self, xid: TransactionId) -> Option<DistributedCommit> {
        self.entries.get(&xid).map(|entry| *entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_tree_marks_children() {
        let clog = Clog::new();
        clog.set_committed_tree(42, &[43, 44]);

        assert!(clog.did_commit(42));
        assert!(clog.did_commit(43));
        assert!(clog.did_commit(44));
        assert!(!clog.did_abort(42));
        assert_eq!(clog.status(45), XidStatus::InProgress);
    }

    #[test]
    fn test_abort_tree() {
        let clog = Clog::new();
        clog.set_aborted_tree(7, &[8]);

        assert!(clog.did_abort(7));
        assert!(clog.did_abort(8));
        assert!(!clog.did_commit(7));
    }

    #[test]
    fn test_distributed_log_records_tree() {
        let dlog = DistributedLog::new();
        dlog.set_committed_tree(100, &[101], 1_700_000_000, 55);

        let entry = dlog.get(101).unwrap();
        assert_eq!(entry.distrib_timestamp, 1_700_000_000);
        assert_eq!(entry.distrib_xid, 55);
        assert!(dlog.get(102).is_none());
    }
}
