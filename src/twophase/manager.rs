// Prepare and finish pipelines for global transactions.
//
// The manager owns the registry and ties it to the WAL, the commit logs,
// the process array, the storage manager, and the resource-manager
// callbacks.
//
// Prepare ordering: the preparer's in-commit flag goes up before the
// PREPARE record is inserted and comes down only after the recovery index
// holds `(xid, prepare_begin_lsn)`, so a checkpoint completing afterwards
// always carries the pointer and replay is guaranteed to find the record.
// The slot turns valid only after the WAL flush: onlookers never see a
// valid transaction whose payload is not durable.
//
// Finish ordering: decision record to WAL, commit status to the logs,
// dummy participant out of the process array, relation files dropped,
// then resource-manager callbacks (which release locks), then the slot is
// retired. Once the decision record is durable a failure can no longer be
// surfaced as an error: the decision cannot be retracted, so the process
// stops and replay re-drives the tail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::clog::{Clog, DistributedLog};
use crate::common::{
    latest_xid, timestamp_to_micros, BackendId, Lsn, Oid, RelFileNode, TransactionId, XidCache,
};
use crate::faults::{self, FaultSite};
use crate::procarray::{ParticipantHandle, ProcArray};
use crate::smgr::StorageManager;
use crate::wal::{WalManager, WalRecordKind};

use super::error::{TwoPhaseError, TwoPhaseResult};
use super::payload::{ParsedPayload, PayloadBuilder, PayloadHeader};
use super::recovery::RecoveryIndex;
use super::registry::{GxactHandle, GxactRegistry};
use super::rmgr::{RmgrPhase, RmgrRegistry};
use super::statistics::{TwoPhaseStats, TwoPhaseStatsSummary};
use super::types::{
    crack_distributed_gid, encode_wire, CheckpointPayload, PreparedPointer, PreparedSnapshot,
    Session, TwoPhaseConfig, XactAbortPreparedRecord, XactCommitPreparedRecord,
};

/// Two-phase commit manager.
pub struct TwoPhaseManager {
    pub(super) config: TwoPhaseConfig,
    pub(super) registry: GxactRegistry,
    pub(super) recovery_index: RecoveryIndex,
    pub(super) wal: Arc<WalManager>,
    pub(super) clog: Arc<Clog>,
    pub(super) distributed_log: Arc<DistributedLog>,
    pub(super) procarray: Arc<ProcArray>,
    pub(super) smgr: Arc<StorageManager>,
    pub(super) rmgr: RmgrRegistry,
    pub(super) stats: TwoPhaseStats,
    pub(super) xids: Arc<XidCache>,
    /// Count of sessions between WAL insert and registry publication of a
    /// transaction-control record; checkpoints drain this before
    /// completing.
    delay_checkpoint: AtomicUsize,
}

/// Marks the holder as inside the commit critical section, delaying any
/// concurrent checkpoint until dropped.
struct CommitCritical<'a> {
    manager: &'a TwoPhaseManager,
}

impl<'a> CommitCritical<'a> {
    fn enter(manager: &'a TwoPhaseManager) -> Self {
        manager.delay_checkpoint.fetch_add(1, Ordering::SeqCst);
        Self { manager }
    }
}

impl Drop for CommitCritical<'_> {
    fn drop(&mut self) {
        self.manager.delay_checkpoint.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TwoPhaseManager {
    pub fn new(
        config: TwoPhaseConfig,
        wal: Arc<WalManager>,
        clog: Arc<Clog>,
        distributed_log: Arc<DistributedLog>,
        procarray: Arc<ProcArray>,
        smgr: Arc<StorageManager>,
        xids: Arc<XidCache>,
    ) -> Self {
        Self {
            registry: GxactRegistry::new(&config, Arc::clone(&procarray)),
            recovery_index: RecoveryIndex::new(),
            config,
            wal,
            clog,
            distributed_log,
            procarray,
            smgr,
            rmgr: RmgrRegistry::new(),
            stats: TwoPhaseStats::new(),
            xids,
            delay_checkpoint: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &GxactRegistry {
        &self.registry
    }

    pub fn rmgr(&self) -> &RmgrRegistry {
        &self.rmgr
    }

    pub fn recovery_index(&self) -> &RecoveryIndex {
        &self.recovery_index
    }

    pub fn stats(&self) -> TwoPhaseStatsSummary {
        self.stats.summary()
    }

    // ========================================================================
    // Prepare pipeline
    // ========================================================================

    /// Reserves the GID and a registry slot for a transaction about to
    /// prepare. `begin_lsn` is only supplied when reloading during
    /// recovery.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve_prepare(
        &self,
        session: &Session,
        xid: TransactionId,
        gid: &str,
        owner: Oid,
        database: Oid,
        prepared_at: DateTime<Utc>,
        begin_lsn: Option<Lsn>,
    ) -> TwoPhaseResult<GxactHandle> {
        self.registry
            .reserve(session, xid, gid, owner, database, prepared_at, begin_lsn)
    }

    /// Loads committed-children ids into the reserved slot.
    pub fn load_subxacts(&self, handle: GxactHandle, children: &[TransactionId]) {
        self.registry.load_subxacts(handle, children);
    }

    /// Starts assembling the prepare payload for the session's reserved
    /// slot: header, subtransactions, and the relation drop lists.
    /// Resource managers then add their records to the returned builder.
    pub fn begin_payload(
        &self,
        session: &Session,
        handle: GxactHandle,
        subxids: &[TransactionId],
        commit_rels: &[RelFileNode],
        abort_rels: &[RelFileNode],
    ) -> TwoPhaseResult<PayloadBuilder> {
        if self.registry.pending_slot(session) != Some(handle) {
            return Err(TwoPhaseError::Internal(
                "payload begun for a slot the session does not hold".to_string(),
            ));
        }

        // Stuff the child-xact data into the slot while we have it.
        self.registry.load_subxacts(handle, subxids);

        let info = self.registry.slot_info(handle);
        let header = PayloadHeader::new(
            info.xid,
            info.database,
            info.owner,
            timestamp_to_micros(info.prepared_at),
            &info.gid,
            subxids.len() as u32,
            commit_rels.len() as u32,
            abort_rels.len() as u32,
        );
        let builder = PayloadBuilder::begin(&header, subxids, commit_rels, abort_rels);
        faults::inject(FaultSite::StartPrepareTx);
        Ok(builder)
    }

    /// Completes prepare: writes the payload to the log as a single
    /// PREPARE record, makes it durable, and publishes the transaction as
    /// valid. On return the slot is unlocked and any session may finish
    /// it.
    ///
    /// Failures leave the slot invalid; the session's abort hook discards
    /// it.
    pub fn end_prepare(
        &self,
        session: &Session,
        handle: GxactHandle,
        builder: PayloadBuilder,
    ) -> TwoPhaseResult<()> {
        let payload = builder.finish(self.config.max_state_payload)?;
        let info = self.registry.slot_info(handle);

        let prepare_lsn = {
            let _crit = CommitCritical::enter(self);

            let (begin, end) = self
                .wal
                .append(WalRecordKind::XactPrepare, &payload)
                .map_err(TwoPhaseError::wal)?;
            self.registry.set_prepare_lsns(handle, begin, end);
            self.recovery_index.remember_recovery(info.xid, begin);

            self.wal.flush(end).map_err(TwoPhaseError::wal)?;
            self.wal.wake_senders();

            // If we crash past this point, we have prepared: replay fixes
            // things. Validity must follow the flush so no onlooker sees a
            // valid transaction without a durable payload.
            self.registry.mark_valid(handle);
            end
        };

        faults::inject(FaultSite::EndPreparedTwoPhaseSleep);
        self.wal.sync_rep_wait(prepare_lsn);

        self.registry.post_prepare(session);
        self.stats.record_prepare();
        Ok(())
    }

    // ========================================================================
    // Finish pipeline
    // ========================================================================

    /// Executes COMMIT PREPARED or ROLLBACK PREPARED for `gid`.
    ///
    /// Returns `Ok(false)` when the transaction does not exist and
    /// `raise_if_absent` is false. Failures before the decision record is
    /// inserted abort only this attempt: the slot stays valid for a
    /// retry. Failures after it are fatal.
    pub fn finish(
        &self,
        session: &Session,
        gid: &str,
        is_commit: bool,
        raise_if_absent: bool,
    ) -> TwoPhaseResult<bool> {
        let Some(handle) = self.registry.lock_for_finish(gid, session)? else {
            if raise_if_absent {
                return Err(TwoPhaseError::NotFound {
                    gid: gid.to_string(),
                });
            }
            return Ok(false);
        };

        let info = self.registry.slot_info(handle);
        let xid = info.xid;

        // Re-read the payload from the log at the remembered location.
        let parsed = self
            .read_prepare_payload(xid, info.prepare_begin_lsn)
            .inspect_err(|_| {
                warn!(
                    xid,
                    lsn = info.prepare_begin_lsn,
                    "prepare record is invalid, failover requested"
                );
            })?;

        let latest = latest_xid(xid, &parsed.subxids);

        let crit = CommitCritical::enter(self);
        let decision_lsn = self
            .drive_decision(session, handle, &parsed, is_commit, latest)
            .unwrap_or_else(|e| {
                panic!(
                    "two-phase decision for transaction {} is durable and cannot be rolled back: {}",
                    xid, e
                )
            });
        drop(crit);

        faults::inject(FaultSite::FinishPreparedAfterRecordCommitPrepared);
        self.wal.sync_rep_wait(decision_lsn);
        Ok(true)
    }

    fn read_prepare_payload(&self, xid: TransactionId, lsn: Lsn) -> TwoPhaseResult<ParsedPayload> {
        let corrupt = |detail: String| TwoPhaseError::CorruptWal { xid, lsn, detail };

        let (record, _) = self
            .wal
            .read_record(lsn)
            .map_err(|e| corrupt(e.to_string()))?;
        if record.kind != WalRecordKind::XactPrepare {
            return Err(corrupt(format!(
                "expected a prepare record, found {:?}",
                record.kind
            )));
        }
        let parsed = ParsedPayload::parse(record.body).map_err(|e| corrupt(e.to_string()))?;
        if parsed.header.xid != xid {
            return Err(corrupt(format!(
                "prepare record carries xid {}",
                parsed.header.xid
            )));
        }
        Ok(parsed)
    }

    /// Everything from the decision record onward. An error here cannot
    /// be tolerated; the caller panics.
    fn drive_decision(
        &self,
        session: &Session,
        handle: GxactHandle,
        parsed: &ParsedPayload,
        is_commit: bool,
        latest: TransactionId,
    ) -> TwoPhaseResult<Lsn> {
        let info = self.registry.slot_info(handle);
        let xid = info.xid;

        let decision_lsn = if is_commit {
            self.record_commit_prepared(xid, &info.gid, parsed)?
        } else {
            self.record_abort_prepared(xid, parsed)?
        };

        // The prepared XID stops reading as in-progress here.
        if !self.procarray.remove(info.participant_id, latest) {
            return Err(TwoPhaseError::Internal(format!(
                "dummy participant {} missing from the process array",
                info.participant_id
            )));
        }

        // Cooperative signal: no one else will try to finish this slot.
        self.registry.clear_valid(handle);

        // Drop files before the callbacks release locks, so nothing can
        // observe the relation between lock release and unlink.
        let drop_rels = if is_commit {
            &parsed.commit_rels
        } else {
            &parsed.abort_rels
        };
        for rel in drop_rels {
            self.smgr
                .unlink_all_forks(*rel)
                .map_err(|e| TwoPhaseError::Internal(e.to_string()))?;
        }

        let phase = if is_commit {
            RmgrPhase::PostCommit
        } else {
            RmgrPhase::PostAbort
        };
        for record in parsed.records() {
            let record = record?;
            self.rmgr
                .dispatch(phase, record.rmid, xid, record.info, record.data);
        }

        self.stats.record_finish(is_commit);
        self.recovery_index.forget_recovery(xid);
        self.registry.remove(session, handle);

        Ok(decision_lsn)
    }

    fn record_commit_prepared(
        &self,
        xid: TransactionId,
        gid: &str,
        parsed: &ParsedPayload,
    ) -> TwoPhaseResult<Lsn> {
        let distributed = crack_distributed_gid(gid);
        let (distrib_timestamp, distrib_xid) = distributed.unwrap_or((0, 0));

        let record = XactCommitPreparedRecord {
            xid,
            distrib_timestamp,
            distrib_xid,
            commit_time_micros: timestamp_to_micros(Utc::now()),
            rels: parsed.commit_rels.clone(),
            children: parsed.subxids.clone(),
        };

        faults::inject(FaultSite::TwoPhaseTransactionCommitPrepared);

        let body = encode_wire(&record)?;
        let (_, end) = self
            .wal
            .append(WalRecordKind::XactCommitPrepared, &body)
            .map_err(TwoPhaseError::wal)?;
        self.wal.flush(end).map_err(TwoPhaseError::wal)?;
        self.wal.wake_senders();

        if let Some((ts, dxid)) = distributed {
            self.distributed_log
                .set_committed_tree(xid, &parsed.subxids, ts, dxid);
        }
        self.clog.set_committed_tree(xid, &parsed.subxids);
        Ok(end)
    }

    fn record_abort_prepared(
        &self,
        xid: TransactionId,
        parsed: &ParsedPayload,
    ) -> TwoPhaseResult<Lsn> {
        // Catch the scenario where a previous finisher got as far as the
        // commit record before dying.
        if self.clog.did_commit(xid) {
            panic!("cannot abort transaction {}, it was already committed", xid);
        }

        let record = XactAbortPreparedRecord {
            xid,
            abort_time_micros: timestamp_to_micros(Utc::now()),
            rels: parsed.abort_rels.clone(),
            children: parsed.subxids.clone(),
        };

        faults::inject(FaultSite::TwoPhaseTransactionAbortPrepared);

        let body = encode_wire(&record)?;
        let (_, end) = self
            .wal
            .append(WalRecordKind::XactAbortPrepared, &body)
            .map_err(TwoPhaseError::wal)?;
        self.wal.flush(end).map_err(TwoPhaseError::wal)?;
        self.wal.wake_senders();

        self.clog.set_aborted_tree(xid, &parsed.subxids);
        Ok(end)
    }

    // ========================================================================
    // Checkpoint interface
    // ========================================================================

    /// Every valid prepared transaction's `(xid, prepare_begin_lsn)` for
    /// inclusion in a checkpoint record.
    pub fn collect_for_checkpoint(&self) -> Vec<PreparedPointer> {
        self.registry.collect_for_checkpoint()
    }

    /// The lower bound log trimming must respect; `None` when no prepared
    /// transactions are resident.
    pub fn oldest_prepare_lsn(&self) -> Option<Lsn> {
        self.registry.oldest_prepare_lsn()
    }

    /// Two-phase component of checkpoint fsync: deliberately a no-op.
    /// The payload lives in the WAL and the recovery index is rebuilt at
    /// replay, so there is no per-transaction state file to sync.
    pub fn checkpoint_fsync(&self, _redo_horizon: Lsn) {}

    /// Emits a checkpoint record carrying the prepared-transaction
    /// pointers. Completes only once no session sits between a
    /// transaction-control WAL insert and its registry publication.
    pub fn checkpoint(&self) -> TwoPhaseResult<Lsn> {
        while self.delay_checkpoint.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }

        let payload = CheckpointPayload {
            prepared: self.registry.collect_for_checkpoint(),
        };
        let body = encode_wire(&payload)?;
        let (_, end) = self
            .wal
            .append(WalRecordKind::Checkpoint, &body)
            .map_err(TwoPhaseError::wal)?;
        self.wal.flush(end).map_err(TwoPhaseError::wal)?;
        Ok(end)
    }

    // ========================================================================
    // Queries and session hooks
    // ========================================================================

    /// One row per fully prepared transaction, for the catalog view.
    pub fn list_prepared(&self) -> Vec<PreparedSnapshot> {
        self.registry
            .list_snapshot()
            .into_iter()
            .filter(|s| s.valid)
            .collect()
    }

    /// The dummy participant representing prepared transaction `xid`.
    pub fn find_dummy_participant(&self, xid: TransactionId) -> ParticipantHandle {
        self.registry.dummy_proc_for(xid)
    }

    pub fn dummy_participant_id(&self, xid: TransactionId) -> BackendId {
        self.registry.dummy_participant_id(xid)
    }

    /// Registers an append-only commit-work intent on a resident
    /// transaction.
    pub fn intent_inc(&self, gid: &str) -> TwoPhaseResult<()> {
        self.registry.intent_inc(gid)
    }

    pub fn intent_dec(&self, gid: &str) -> TwoPhaseResult<()> {
        self.registry.intent_dec(gid)
    }

    /// Session abort hook: releases whatever slot the session holds.
    pub fn at_abort(&self, session: &Session) {
        self.registry.at_abort(session);
    }

    /// Process-exit hook; same policy as abort.
    pub fn at_exit(&self, session: &Session) {
        self.registry.at_exit(session);
    }

    /// Sessions this manager knows to be mid-commit (used by tests and
    /// monitoring; checkpoints consult it internally).
    pub fn sessions_delaying_checkpoint(&self) -> usize {
        self.delay_checkpoint.load(Ordering::SeqCst)
    }
}
