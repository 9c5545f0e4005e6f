// Registry of global transactions in (or entering) prepared state.
//
// A fixed array of slots sized at startup. Reserving a slot checks GID
// uniqueness and marks the slot locked by the reserving session; marking
// it valid publishes a dummy participant into the process array so the
// prepared XID stays visible as in-progress; finishing locks the slot
// again so exactly one session drives the final decision; removal returns
// the slot to the free stack.
//
// The registry lock guards the slot array, the free stack, and every
// slot's gid/valid/locking_session fields. Critical sections are short
// scans; no I/O ever happens under the lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::{BackendId, Lsn, Oid, SessionId, TransactionId, INVALID_LSN};
use crate::procarray::{ParticipantHandle, ProcArray};

use super::error::{TwoPhaseError, TwoPhaseResult};
use super::types::{PreparedPointer, PreparedSnapshot, Session, SubxidCache, TwoPhaseConfig, GID_SIZE};

/// Opaque handle to a registry slot, valid while the holder keeps the
/// slot reserved or locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GxactHandle(pub(crate) usize);

/// One global-transaction slot.
#[derive(Debug)]
struct GxactSlot {
    /// Participant identity stamped at startup, stable for the slot's
    /// lifetime; lives in the range above live-session ids.
    participant_id: BackendId,
    gid: String,
    xid: TransactionId,
    owner: Oid,
    database: Oid,
    prepared_at: DateTime<Utc>,
    prepare_begin_lsn: Lsn,
    prepare_lsn: Lsn,
    valid: bool,
    locking_session: Option<SessionId>,
    subxids: SubxidCache,
    intent_count: u32,
}

/// Fields the pipelines need to read after locking a slot.
#[derive(Debug, Clone)]
pub(crate) struct SlotInfo {
    pub participant_id: BackendId,
    pub gid: String,
    pub xid: TransactionId,
    pub owner: Oid,
    pub database: Oid,
    pub prepared_at: DateTime<Utc>,
    pub prepare_begin_lsn: Lsn,
    pub prepare_lsn: Lsn,
}

struct RegistryCore {
    slots: Vec<GxactSlot>,
    /// Free slot indexes, popped on reserve and pushed back on removal.
    free: Vec<usize>,
    /// Published slots, in no meaningful order; removal swaps the last
    /// element into the vacated position.
    active: Vec<usize>,
    /// Slot currently reserved or locked by each session.
    pending: HashMap<SessionId, usize>,
}

/// Shared registry of global transactions.
pub struct GxactRegistry {
    capacity: usize,
    inner: RwLock<RegistryCore>,
    procarray: Arc<ProcArray>,
    /// Memoized lookup for repeated dummy-participant queries during
    /// recovery and finish.
    dummy_cache: Mutex<Option<(TransactionId, ParticipantHandle)>>,
}

impl GxactRegistry {
    pub fn new(config: &TwoPhaseConfig, procarray: Arc<ProcArray>) -> Self {
        let capacity = config.max_prepared_xacts;
        let slots = (0..capacity)
            .map(|i| GxactSlot {
                participant_id: config.max_live_sessions as BackendId + 1 + i as BackendId,
                gid: String::new(),
                xid: 0,
                owner: 0,
                database: 0,
                prepared_at: DateTime::<Utc>::MIN_UTC,
                prepare_begin_lsn: INVALID_LSN,
                prepare_lsn: INVALID_LSN,
                valid: false,
                locking_session: None,
                subxids: SubxidCache::default(),
                intent_count: 0,
            })
            .collect();

        Self {
            capacity,
            inner: RwLock::new(RegistryCore {
                slots,
                free: (0..capacity).rev().collect(),
                active: Vec::with_capacity(capacity),
                pending: HashMap::new(),
            }),
            procarray,
            dummy_cache: Mutex::new(None),
        }
    }

    /// Reserves the GID for a transaction entering prepared state. The
    /// slot comes back invalid and locked by the reserving session; any
    /// failure before `mark_valid` must release it through
    /// [`at_abort`](Self::at_abort).
    ///
    /// `begin_lsn` is supplied only when reloading a transaction during
    /// recovery.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
        &self,
        session: &Session,
        xid: TransactionId,
        gid: &str,
        owner: Oid,
        database: Oid,
        prepared_at: DateTime<Utc>,
        begin_lsn: Option<Lsn>,
    ) -> TwoPhaseResult<GxactHandle> {
        if gid.len() >= GID_SIZE {
            return Err(TwoPhaseError::GidTooLong {
                gid: gid.chars().take(32).collect(),
                len: gid.len(),
                max: GID_SIZE,
            });
        }
        if self.capacity == 0 {
            return Err(TwoPhaseError::Disabled);
        }

        let mut core = self.inner.write();

        if core.pending.contains_key(&session.id) {
            return Err(TwoPhaseError::OperationInProgress { session: session.id });
        }
        for &idx in &core.active {
            if core.slots[idx].gid == gid {
                return Err(TwoPhaseError::DuplicateGid {
                    gid: gid.to_string(),
                });
            }
        }

        let Some(idx) = core.free.pop() else {
            return Err(TwoPhaseError::CapacityExhausted {
                capacity: self.capacity,
            });
        };

        let slot = &mut core.slots[idx];
        slot.gid = gid.to_string();
        slot.xid = xid;
        slot.owner = owner;
        slot.database = database;
        slot.prepared_at = prepared_at;
        slot.prepare_begin_lsn = begin_lsn.unwrap_or(INVALID_LSN);
        slot.prepare_lsn = INVALID_LSN;
        slot.valid = false;
        slot.locking_session = Some(session.id);
        slot.subxids = SubxidCache::default();
        slot.intent_count = 0;

        core.active.push(idx);
        core.pending.insert(session.id, idx);

        debug!(gid, xid, session = session.id, "reserved gxact slot");
        Ok(GxactHandle(idx))
    }

    /// Loads subtransaction ids into the slot. Must run before
    /// `mark_valid`; the slot is not yet visible to anyone else.
    pub fn load_subxacts(&self, handle: GxactHandle, children: &[TransactionId]) {
        let mut core = self.inner.write();
        core.slots[handle.0].subxids.load(children);
    }

    /// Records where the PREPARE record landed in the log.
    pub(crate) fn set_prepare_lsns(&self, handle: GxactHandle, begin: Lsn, end: Lsn) {
        let mut core = self.inner.write();
        let slot = &mut core.slots[handle.0];
        slot.prepare_begin_lsn = begin;
        slot.prepare_lsn = end;
    }

    /// Marks the slot fully valid and publishes its dummy participant so
    /// the prepared XID keeps reading as in-progress. Called only by the
    /// preparing session, after the PREPARE record is durable.
    pub fn mark_valid(&self, handle: GxactHandle) {
        let participant = {
            let mut core = self.inner.write();
            let slot = &mut core.slots[handle.0];
            assert!(!slot.valid, "gxact \"{}\" already valid", slot.gid);
            slot.valid = true;
            debug!(gid = %slot.gid, "marking gxact as valid (prepared)");
            ParticipantHandle {
                backend_id: slot.participant_id,
                xid: slot.xid,
                database_id: slot.database,
            }
        };
        self.procarray.add(participant);
    }

    /// Releases the preparing session's hold once prepare has completed;
    /// the slot stays resident for a finisher.
    pub fn post_prepare(&self, session: &Session) {
        let mut core = self.inner.write();
        if let Some(idx) = core.pending.remove(&session.id) {
            core.slots[idx].locking_session = None;
        }
    }

    /// Locates the prepared transaction with `gid` and locks it for
    /// COMMIT PREPARED or ROLLBACK PREPARED. Not-yet-valid slots are
    /// invisible here. `Ok(None)` means no such transaction exists.
    pub fn lock_for_finish(
        &self,
        gid: &str,
        session: &Session,
    ) -> TwoPhaseResult<Option<GxactHandle>> {
        let mut core = self.inner.write();

        if core.pending.contains_key(&session.id) {
            return Err(TwoPhaseError::OperationInProgress { session: session.id });
        }

        let found = core.active.iter().copied().find(|&idx| {
            let slot = &core.slots[idx];
            slot.valid && slot.gid == gid
        });
        let Some(idx) = found else {
            return Ok(None);
        };

        let slot = &core.slots[idx];
        if slot.locking_session.is_some() {
            return Err(TwoPhaseError::Busy {
                gid: gid.to_string(),
            });
        }
        if session.role != slot.owner && !session.superuser {
            return Err(TwoPhaseError::PermissionDenied {
                gid: gid.to_string(),
            });
        }
        if session.database != slot.database && !session.coordinator_proxy {
            return Err(TwoPhaseError::WrongDatabase {
                gid: gid.to_string(),
            });
        }

        core.slots[idx].locking_session = Some(session.id);
        core.pending.insert(session.id, idx);
        debug!(gid, session = session.id, "locked gxact for finish");
        Ok(Some(GxactHandle(idx)))
    }

    /// Locates a resident transaction by GID regardless of validity.
    /// Used by the preparing session's own intent accounting, which may
    /// legitimately see its not-yet-valid slot.
    pub fn find_by_gid(&self, gid: &str) -> TwoPhaseResult<GxactHandle> {
        let core = self.inner.read();
        core.active
            .iter()
            .copied()
            .find(|&idx| core.slots[idx].gid == gid)
            .map(GxactHandle)
            .ok_or_else(|| TwoPhaseError::NotFound {
                gid: gid.to_string(),
            })
    }

    /// Bumps the append-only commit-work intent counter.
    pub fn intent_inc(&self, gid: &str) -> TwoPhaseResult<()> {
        let handle = self.find_by_gid(gid)?;
        let mut core = self.inner.write();
        core.slots[handle.0].intent_count += 1;
        Ok(())
    }

    /// Drops one intent; the counter must be positive.
    pub fn intent_dec(&self, gid: &str) -> TwoPhaseResult<()> {
        let handle = self.find_by_gid(gid)?;
        let mut core = self.inner.write();
        let slot = &mut core.slots[handle.0];
        assert!(
            slot.intent_count >= 1,
            "intent counter underflow for gxact \"{}\"",
            slot.gid
        );
        slot.intent_count -= 1;
        Ok(())
    }

    pub(crate) fn intent_count(&self, handle: GxactHandle) -> u32 {
        self.inner.read().slots[handle.0].intent_count
    }

    /// Cooperative signal that no one else should attempt to finish this
    /// slot; set by the finish pipeline once the decision is durable.
    pub(crate) fn clear_valid(&self, handle: GxactHandle) {
        let mut core = self.inner.write();
        core.slots[handle.0].valid = false;
    }

    pub(crate) fn slot_info(&self, handle: GxactHandle) -> SlotInfo {
        let core = self.inner.read();
        let slot = &core.slots[handle.0];
        SlotInfo {
            participant_id: slot.participant_id,
            gid: slot.gid.clone(),
            xid: slot.xid,
            owner: slot.owner,
            database: slot.database,
            prepared_at: slot.prepared_at,
            prepare_begin_lsn: slot.prepare_begin_lsn,
            prepare_lsn: slot.prepare_lsn,
        }
    }

    /// Excises the slot from the published array and returns it to the
    /// free stack, releasing the session's hold. The caller must already
    /// have removed the dummy participant from the process array.
    pub fn remove(&self, session: &Session, handle: GxactHandle) {
        let mut core = self.inner.write();
        let pos = core
            .active
            .iter()
            .position(|&idx| idx == handle.0)
            .unwrap_or_else(|| panic!("gxact slot {} not in the active array", handle.0));

        core.active.swap_remove(pos);
        core.free.push(handle.0);
        core.slots[handle.0].locking_session = None;
        let removed_xid = core.slots[handle.0].xid;
        core.slots[handle.0].gid.clear();
        core.pending.remove(&session.id);
        drop(core);

        let mut cache = self.dummy_cache.lock();
        if let Some((cached_xid, _)) = *cache {
            if cached_xid == removed_xid {
                *cache = None;
            }
        }
    }

    /// Abort/exit hook: releases whatever slot this session holds.
    ///
    /// A not-yet-valid reservation is discarded outright (the prepare
    /// never became durable). A valid slot is merely unlocked so another
    /// session can finish it; if the crash happened after the decision
    /// record reached the log, replay re-drives the removal.
    pub fn at_abort(&self, session: &Session) {
        let mut core = self.inner.write();
        let Some(idx) = core.pending.remove(&session.id) else {
            return;
        };

        if core.slots[idx].valid {
            core.slots[idx].locking_session = None;
            debug!(session = session.id, "unlocked gxact at session abort");
        } else {
            let pos = core
                .active
                .iter()
                .position(|&i| i == idx)
                .unwrap_or_else(|| panic!("gxact slot {} not in the active array", idx));
            core.active.swap_remove(pos);
            core.free.push(idx);
            core.slots[idx].locking_session = None;
            core.slots[idx].gid.clear();
            debug!(session = session.id, "discarded unprepared gxact at session abort");
        }
    }

    /// Process-exit hook; identical to session abort.
    pub fn at_exit(&self, session: &Session) {
        self.at_abort(session);
    }

    /// Copies every resident slot's public fields. Callers wanting only
    /// fully prepared transactions must filter on `valid`.
    pub fn list_snapshot(&self) -> Vec<PreparedSnapshot> {
        let core = self.inner.read();
        core.active
            .iter()
            .map(|&idx| {
                let slot = &core.slots[idx];
                PreparedSnapshot {
                    xid: slot.xid,
                    gid: slot.gid.clone(),
                    prepared_at: slot.prepared_at,
                    owner: slot.owner,
                    database: slot.database,
                    valid: slot.valid,
                    prepare_begin_lsn: slot.prepare_begin_lsn,
                    prepare_lsn: slot.prepare_lsn,
                }
            })
            .collect()
    }

    /// Every valid slot's `(xid, prepare_begin_lsn)` for the checkpoint
    /// record.
    pub fn collect_for_checkpoint(&self) -> Vec<PreparedPointer> {
        let core = self.inner.read();
        core.active
            .iter()
            .filter(|&&idx| core.slots[idx].valid)
            .map(|&idx| PreparedPointer {
                xid: core.slots[idx].xid,
                prepare_begin_lsn: core.slots[idx].prepare_begin_lsn,
            })
            .collect()
    }

    /// The oldest PREPARE location still referenced by a valid slot; log
    /// trimming must not discard records at or below it.
    pub fn oldest_prepare_lsn(&self) -> Option<Lsn> {
        let core = self.inner.read();
        core.active
            .iter()
            .filter(|&&idx| core.slots[idx].valid)
            .map(|&idx| core.slots[idx].prepare_begin_lsn)
            .min()
    }

    /// Returns the dummy participant representing the prepared
    /// transaction `xid`.
    ///
    /// Recovery and finish ask for the same XID repeatedly; a single
    /// memoized pair keeps those lookups from rescanning. Absence is
    /// fatal: the caller believed the XID was prepared.
    pub fn dummy_proc_for(&self, xid: TransactionId) -> ParticipantHandle {
        let mut cache = self.dummy_cache.lock();
        if let Some((cached_xid, handle)) = *cache {
            if cached_xid == xid {
                return handle;
            }
        }

        let core = self.inner.read();
        let found = core.active.iter().copied().find_map(|idx| {
            let slot = &core.slots[idx];
            (slot.xid == xid).then(|| ParticipantHandle {
                backend_id: slot.participant_id,
                xid: slot.xid,
                database_id: slot.database,
            })
        });
        let Some(handle) = found else {
            panic!(
                "failed to find dummy participant for xid {} ({} entries)",
                xid,
                core.active.len()
            );
        };

        *cache = Some((xid, handle));
        handle
    }

    /// The participant id for the prepared transaction `xid`.
    pub fn dummy_participant_id(&self, xid: TransactionId) -> BackendId {
        self.dummy_proc_for(xid).backend_id
    }

    pub(crate) fn pending_slot(&self, session: &Session) -> Option<GxactHandle> {
        self.inner
            .read()
            .pending
            .get(&session.id)
            .copied()
            .map(GxactHandle)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.inner.read().free.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().active.len()
    }
}
