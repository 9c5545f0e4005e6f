// Core two-phase commit types and domain models.
//
// Constants, the session identity presented to the registry, the
// checkpoint payload exchanged with the WAL, and the wire structs for the
// final commit/abort decision records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{Lsn, Oid, RelFileNode, SessionId, TransactionId};

/// Maximum size of a global transaction identifier, including room for a
/// terminator; client GIDs must be strictly shorter.
pub const GID_SIZE: usize = 200;

/// Format identifier leading every prepare-state payload.
pub const TWOPHASE_MAGIC: u32 = 0x57F9_4531;

/// All payload segments are padded to this boundary.
pub const MAX_ALIGN: usize = 8;

/// Bound on the per-slot subtransaction cache; larger sets overflow.
pub const MAX_CACHED_SUBXIDS: usize = 64;

/// Configuration for the two-phase subsystem. Fixed at startup.
#[derive(Debug, Clone)]
pub struct TwoPhaseConfig {
    /// Number of registry slots. Zero disables prepared transactions.
    pub max_prepared_xacts: usize,
    /// Number of live-session participant ids; dummy participant ids are
    /// assigned immediately above this range.
    pub max_live_sessions: usize,
    /// Ceiling on the assembled prepare-state payload, in bytes.
    pub max_state_payload: usize,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            max_prepared_xacts: 8,
            max_live_sessions: 64,
            max_state_payload: 0x3FFF_FFFF,
        }
    }
}

/// Identity of a session interacting with the two-phase core.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Role executing the session's commands.
    pub role: Oid,
    /// Database the session is connected to.
    pub database: Oid,
    pub superuser: bool,
    /// Coordinator-dispatched sessions may finish transactions prepared
    /// in another database.
    pub coordinator_proxy: bool,
}

impl Session {
    pub fn new(id: SessionId, role: Oid, database: Oid) -> Self {
        Self {
            id,
            role,
            database,
            superuser: false,
            coordinator_proxy: false,
        }
    }

    pub fn superuser(mut self) -> Self {
        self.superuser = true;
        self
    }

    pub fn coordinator_proxy(mut self) -> Self {
        self.coordinator_proxy = true;
        self
    }
}

/// Bounded cache of subtransaction ids carried in a registry slot.
#[derive(Debug, Clone, Default)]
pub struct SubxidCache {
    pub xids: Vec<TransactionId>,
    pub overflowed: bool,
}

impl SubxidCache {
    /// Loads the committed children, truncating past the cache bound.
    pub fn load(&mut self, children: &[TransactionId]) {
        self.overflowed = children.len() > MAX_CACHED_SUBXIDS;
        let keep = children.len().min(MAX_CACHED_SUBXIDS);
        self.xids.clear();
        self.xids.extend_from_slice(&children[..keep]);
    }
}

/// Copy of a registry slot's public fields, as returned by snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSnapshot {
    pub xid: TransactionId,
    pub gid: String,
    pub prepared_at: DateTime<Utc>,
    pub owner: Oid,
    pub database: Oid,
    pub valid: bool,
    pub prepare_begin_lsn: Lsn,
    pub prepare_lsn: Lsn,
}

/// One prepared-transaction pointer carried by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedPointer {
    pub xid: TransactionId,
    pub prepare_begin_lsn: Lsn,
}

/// Body of a checkpoint WAL record: every valid prepared transaction at
/// the time the checkpoint was taken.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub prepared: Vec<PreparedPointer>,
}

/// Wire form of the COMMIT PREPARED decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XactCommitPreparedRecord {
    pub xid: TransactionId,
    /// Coordinator start timestamp cracked out of the GID; zero for a
    /// purely local transaction.
    pub distrib_timestamp: u64,
    /// Distributed transaction id cracked out of the GID; zero for local.
    pub distrib_xid: u64,
    pub commit_time_micros: i64,
    pub rels: Vec<RelFileNode>,
    pub children: Vec<TransactionId>,
}

/// Wire form of the ABORT PREPARED decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XactAbortPreparedRecord {
    pub xid: TransactionId,
    pub abort_time_micros: i64,
    pub rels: Vec<RelFileNode>,
    pub children: Vec<TransactionId>,
}

/// Encodes a WAL record body.
pub(crate) fn encode_wire<T: Serialize>(value: &T) -> super::error::TwoPhaseResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| super::error::TwoPhaseError::Serialization(e.to_string()))
}

/// Decodes a WAL record body.
pub(crate) fn decode_wire<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> super::error::TwoPhaseResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| super::error::TwoPhaseError::Serialization(e.to_string()))
}

/// Cracks a coordinator-generated GID of the form
/// `"<timestamp>-<distributed-xid>"` into its parts. Any other shape is a
/// locally-issued GID.
pub fn crack_distributed_gid(gid: &str) -> Option<(u64, u64)> {
    let (ts, dxid) = gid.split_once('-')?;
    Some((ts.parse().ok()?, dxid.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subxid_cache_overflow() {
        let mut cache = SubxidCache::default();
        let children: Vec<TransactionId> = (1..=100).collect();
        cache.load(&children);

        assert!(cache.overflowed);
        assert_eq!(cache.xids.len(), MAX_CACHED_SUBXIDS);
        assert_eq!(cache.xids[0], 1);

        cache.load(&[5, 6]);
        assert!(!cache.overflowed);
        assert_eq!(cache.xids, vec![5, 6]);
    }

    #[test]
    fn test_crack_distributed_gid() {
        assert_eq!(
            crack_distributed_gid("1700000000-0000000055"),
            Some((1_700_000_000, 55))
        );
        assert_eq!(crack_distributed_gid("gxa"), None);
        assert_eq!(crack_distributed_gid("abc-def"), None);
        assert_eq!(crack_distributed_gid(""), None);
    }
}
