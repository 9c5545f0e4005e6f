// Process array
//
// Shared view of which transactions are currently running. Live sessions
// and the dummy participants standing in for prepared transactions are
// registered here; `xid_in_progress` is the visibility primitive the rest
// of the engine consults. Removing a participant tags the array with the
// latest XID the departing transaction (and its children) completed.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::common::{BackendId, Oid, TransactionId};

/// Identity a participant presents to the process array.
///
/// A prepared transaction's registry slot owns one of these and hands it
/// over when the slot becomes valid; no relationship beyond this handle
/// exists between the array and the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantHandle {
    pub backend_id: BackendId,
    pub xid: TransactionId,
    pub database_id: Oid,
}

/// Shared array of running participants.
#[derive(Debug, Default)]
pub struct ProcArray {
    entries: RwLock<Vec<ParticipantHandle>>,
    latest_completed_xid: AtomicU64,
}

impl ProcArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a participant. The caller is responsible for not adding
    /// the same backend id twice.
    pub fn add(&self, handle: ParticipantHandle) {
        let mut entries = self.entries.write();
        debug_assert!(
            entries.iter().all(|e| e.backend_id != handle.backend_id),
            "backend {} already in process array",
            handle.backend_id
        );
        entries.push(handle);
    }

    /// Removes the participant with `backend_id`, recording `latest_xid`
    /// as completed. Returns false when no such participant exists.
    pub fn remove(&self, backend_id: BackendId, latest_xid: TransactionId) -> bool {
        let mut entries = self.entries.write();
        let Some(pos) = entries.iter().position(|e| e.backend_id == backend_id) else {
            return false;
        };
        entries.swap_remove(pos);
        self.latest_completed_xid.fetch_max(latest_xid, Ordering::SeqCst);
        true
    }

    /// True when some participant is running `xid`.
    pub fn xid_in_progress(&self, xid: TransactionId) -> bool {
        self.entries.read().iter().any(|e| e.xid == xid)
    }

    /// Number of participants with the given backend id (invariant checks).
    pub fn count_backend(&self, backend_id: BackendId) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.backend_id == backend_id)
            .count()
    }

    pub fn participant_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn latest_completed_xid(&self) -> TransactionId {
        self.latest_completed_xid.load(Ordering::SeqCst)
    }
}
