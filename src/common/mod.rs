// Shared types and identifiers used across all AnchorDB modules.
//
// The aliases here are the vocabulary the rest of the crate speaks:
// transaction identifiers, WAL positions, object identifiers, and the
// session/participant identifiers that tie transactions to the process
// array.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Local transaction identifier assigned by the database.
pub type TransactionId = u64;

/// Log Sequence Number: a byte position in the write-ahead log.
/// Zero is never a valid record location.
pub type Lsn = u64;

/// Object identifier (databases, roles, tablespaces, relations).
pub type Oid = u32;

/// Identifier of a participant in the process array. Live sessions occupy
/// `1..=max_live_sessions`; dummy participants for prepared transactions
/// occupy the range immediately above.
pub type BackendId = u64;

/// Session identifier for user connections.
pub type SessionId = u64;

/// The invalid (never-assigned) transaction id.
pub const INVALID_TRANSACTION_ID: TransactionId = 0;

/// The invalid WAL position.
pub const INVALID_LSN: Lsn = 0;

// ============================================================================
// Relation file identity
// ============================================================================

/// Physical identity of a relation's files on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelFileNode {
    /// Tablespace the relation lives in.
    pub spc_node: Oid,
    /// Database the relation belongs to.
    pub db_node: Oid,
    /// Relation file number.
    pub rel_node: Oid,
}

impl RelFileNode {
    pub fn new(spc_node: Oid, db_node: Oid, rel_node: Oid) -> Self {
        Self {
            spc_node,
            db_node,
            rel_node,
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Converts a wall-clock timestamp to the microsecond representation used
/// in on-WAL headers.
pub fn timestamp_to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Inverse of [`timestamp_to_micros`]; out-of-range values clamp to epoch.
pub fn micros_to_timestamp(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

// ============================================================================
// Shared next-XID cache
// ============================================================================

/// Process-shared cache of the next transaction id to assign.
///
/// Recovery advances this past every XID for which evidence exists in the
/// log, including subtransaction ids that never wrote records of their own.
#[derive(Debug)]
pub struct XidCache {
    next_xid: AtomicU64,
}

impl XidCache {
    pub fn new(next_xid: TransactionId) -> Self {
        Self {
            next_xid: AtomicU64::new(next_xid),
        }
    }

    /// Current next-XID value.
    pub fn next_xid(&self) -> TransactionId {
        self.next_xid.load(Ordering::SeqCst)
    }

    /// Allocates and returns a fresh transaction id.
    pub fn assign(&self) -> TransactionId {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    /// Ensures the next assignable XID follows `xid`.
    pub fn advance_past(&self, xid: TransactionId) {
        let mut current = self.next_xid.load(Ordering::SeqCst);
        while current <= xid {
            match self.next_xid.compare_exchange(
                current,
                xid + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Computes the latest XID among a transaction and its committed children.
pub fn latest_xid(xid: TransactionId, children: &[TransactionId]) -> TransactionId {
    children.iter().copied().fold(xid, TransactionId::max)
}
