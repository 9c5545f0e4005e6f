// Resource-manager callback registry.
//
// Subsystems that need to piggyback state on a prepared transaction
// register callbacks per resource-manager id. Their bytes travel opaquely
// inside the prepare payload; on finish the matching post-commit or
// post-abort callback gets them back, and on crash recovery the recover
// callback re-establishes whatever state (locks, notifications) the bytes
// describe.

use parking_lot::RwLock;

use crate::common::TransactionId;

/// Resource-manager identifier carried in each payload record.
pub type RmgrId = u8;

/// Sentinel id terminating the record stream; never registrable.
pub const TWOPHASE_RM_END_ID: RmgrId = u8::MAX;

/// Highest registrable resource-manager id. Dispatching a record above
/// this is a fatal assertion: the payload cannot be trusted.
pub const TWOPHASE_RM_MAX_ID: RmgrId = 16;

/// Which lifecycle event a dispatch is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmgrPhase {
    Recover,
    PostCommit,
    PostAbort,
}

type Callback = Box<dyn Fn(TransactionId, u16, &[u8]) + Send + Sync>;

/// Callbacks one resource manager may register. Any subset may be absent;
/// records for an absent callback are skipped silently.
#[derive(Default)]
pub struct RmgrCallbacks {
    pub recover: Option<Callback>,
    pub post_commit: Option<Callback>,
    pub post_abort: Option<Callback>,
}

impl RmgrCallbacks {
    fn for_phase(&self, phase: RmgrPhase) -> Option<&Callback> {
        match phase {
            RmgrPhase::Recover => self.recover.as_ref(),
            RmgrPhase::PostCommit => self.post_commit.as_ref(),
            RmgrPhase::PostAbort => self.post_abort.as_ref(),
        }
    }
}

/// Registry of resource-manager callbacks, indexed by rmgr id.
pub struct RmgrRegistry {
    table: RwLock<Vec<Option<RmgrCallbacks>>>,
}

impl Default for RmgrRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RmgrRegistry {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(TWOPHASE_RM_MAX_ID as usize + 1);
        table.resize_with(TWOPHASE_RM_MAX_ID as usize + 1, || None);
        Self {
            table: RwLock::new(table),
        }
    }

    /// Installs (or replaces) the callbacks for `rmid`.
    pub fn register(&self, rmid: RmgrId, callbacks: RmgrCallbacks) {
        assert!(
            rmid <= TWOPHASE_RM_MAX_ID,
            "resource manager id {} out of range",
            rmid
        );
        self.table.write()[rmid as usize] = Some(callbacks);
    }

    /// Dispatches one payload record. Unknown ids within range are
    /// ignored; ids past the registrable range mean the payload is
    /// garbage and the process must stop.
    pub fn dispatch(&self, phase: RmgrPhase, rmid: RmgrId, xid: TransactionId, info: u16, data: &[u8]) {
        assert!(
            rmid <= TWOPHASE_RM_MAX_ID,
            "two-phase record with invalid resource manager id {}",
            rmid
        );
        let table = self.table.read();
        if let Some(callbacks) = &table[rmid as usize] {
            if let Some(callback) = callbacks.for_phase(phase) {
                callback(xid, info, data);
            }
        }
    }
}
