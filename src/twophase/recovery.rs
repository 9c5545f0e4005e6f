// Crash recovery for prepared transactions.
//
// The recovery index maps each in-flight prepared XID to the log position
// of its PREPARE record. During normal running it mirrors the registry;
// at startup it is rebuilt by seeding it from the last checkpoint's
// payload and then replaying the log forward: PREPARE records add
// entries, decision records redo the commit logs and delete them. What
// survives is exactly the set of transactions whose fate is still
// undecided; prescan and recovery walk it to put the system back where it
// was.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use crate::common::{micros_to_timestamp, Lsn, TransactionId};
use crate::wal::WalRecordKind;

use super::error::{TwoPhaseError, TwoPhaseResult};
use super::manager::TwoPhaseManager;
use super::payload::ParsedPayload;
use super::rmgr::RmgrPhase;
use super::types::{
    decode_wire, CheckpointPayload, PreparedPointer, Session, XactAbortPreparedRecord,
    XactCommitPreparedRecord,
};

/// In-memory map from prepared XID to the LSN of its PREPARE record.
#[derive(Debug, Default)]
pub struct RecoveryIndex {
    map: RwLock<HashMap<TransactionId, Lsn>>,
}

impl RecoveryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or moves) the PREPARE location for `xid`.
    pub fn remember_recovery(&self, xid: TransactionId, lsn: Lsn) {
        self.map.write().insert(xid, lsn);
    }

    /// Forgets `xid`; called once its decision record exists.
    pub fn forget_recovery(&self, xid: TransactionId) {
        self.map.write().remove(&xid);
    }

    /// Replaces the whole index with a checkpoint's serialized list.
    pub fn replace_from_checkpoint(&self, pointers: &[PreparedPointer]) {
        let mut map = self.map.write();
        map.clear();
        for pointer in pointers {
            map.insert(pointer.xid, pointer.prepare_begin_lsn);
        }
    }

    pub fn lookup(&self, xid: TransactionId) -> Option<Lsn> {
        self.map.read().get(&xid).copied()
    }

    pub fn contains(&self, xid: TransactionId) -> bool {
        self.map.read().contains_key(&xid)
    }

    /// Copies out every `(xid, lsn)` pair.
    pub fn entries(&self) -> Vec<(TransactionId, Lsn)> {
        self.map.read().iter().map(|(&x, &l)| (x, l)).collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl TwoPhaseManager {
    /// Seeds the recovery index from a checkpoint record's payload before
    /// log replay resumes.
    pub fn setup_from_checkpoint(&self, pointers: &[PreparedPointer]) {
        self.recovery_index.replace_from_checkpoint(pointers);
    }

    /// Replays the log from the beginning, rebuilding the recovery index
    /// and redoing commit-log state for decided transactions.
    pub fn replay(&self) -> TwoPhaseResult<()> {
        let records = self
            .wal
            .records_from(self.wal.truncation_horizon())
            .map_err(TwoPhaseError::wal)?;

        for (begin, record, _end) in records {
            match record.kind {
                WalRecordKind::Checkpoint => {
                    let payload: CheckpointPayload = decode_wire(&record.body)?;
                    self.recovery_index.replace_from_checkpoint(&payload.prepared);
                }
                WalRecordKind::XactPrepare => {
                    let parsed = ParsedPayload::parse(record.body)?;
                    self.xids.advance_past(parsed.header.xid);
                    self.recovery_index
                        .remember_recovery(parsed.header.xid, begin);
                }
                WalRecordKind::XactCommitPrepared => {
                    let decision: XactCommitPreparedRecord = decode_wire(&record.body)?;
                    self.xids.advance_past(decision.xid);
                    for &child in &decision.children {
                        self.xids.advance_past(child);
                    }
                    if decision.distrib_timestamp != 0 || decision.distrib_xid != 0 {
                        self.distributed_log.set_committed_tree(
                            decision.xid,
                            &decision.children,
                            decision.distrib_timestamp,
                            decision.distrib_xid,
                        );
                    }
                    self.clog
                        .set_committed_tree(decision.xid, &decision.children);
                    self.recovery_index.forget_recovery(decision.xid);
                }
                WalRecordKind::XactAbortPrepared => {
                    let decision: XactAbortPreparedRecord = decode_wire(&record.body)?;
                    self.xids.advance_past(decision.xid);
                    for &child in &decision.children {
                        self.xids.advance_past(child);
                    }
                    self.clog.set_aborted_tree(decision.xid, &decision.children);
                    self.recovery_index.forget_recovery(decision.xid);
                }
            }
        }
        Ok(())
    }

    /// Walks the recovery index after replay, advancing the shared
    /// next-XID past every prepared transaction and its subtransactions
    /// (subtransaction commits leave no records of their own, so this is
    /// the only evidence of those ids).
    ///
    /// Returns the oldest XID among still-undecided prepared
    /// transactions, or the pre-scan next-XID when there are none.
    pub fn prescan_and_advance_next_xid(&self) -> TwoPhaseResult<TransactionId> {
        let mut result = self.xids.next_xid();

        for (xid, lsn) in self.recovery_index.entries() {
            let parsed = self.read_payload_for_recovery(xid, lsn)?.0;

            if self.clog.did_commit(xid) || self.clog.did_abort(xid) {
                continue;
            }

            if xid < result {
                result = xid;
            }
            self.xids.advance_past(xid);
            for &subxid in &parsed.subxids {
                debug_assert!(subxid > xid, "subxact ids follow the parent xid");
                self.xids.advance_past(subxid);
            }
        }
        Ok(result)
    }

    /// Rebuilds registry state for every undecided prepared transaction
    /// and re-dispatches each payload record to its resource manager's
    /// recover callback. Run once during startup, after replay, under the
    /// startup session.
    pub fn recover_prepared(&self, session: &Session) -> TwoPhaseResult<usize> {
        let mut entries = self.recovery_index.entries();
        entries.sort_by_key(|&(_, lsn)| lsn);

        let mut count = 0;
        for (xid, lsn) in entries {
            if self.clog.did_commit(xid) || self.clog.did_abort(xid) {
                continue;
            }

            let (parsed, end) = self.read_payload_for_recovery(xid, lsn)?;
            info!(xid, gid = %parsed.header.gid, "recovering prepared transaction");

            let handle = self.registry.reserve(
                session,
                xid,
                &parsed.header.gid,
                parsed.header.owner,
                parsed.header.database,
                micros_to_timestamp(parsed.header.prepared_at_micros),
                Some(lsn),
            )?;
            self.registry.load_subxacts(handle, &parsed.subxids);
            self.registry.set_prepare_lsns(handle, lsn, end);
            self.registry.mark_valid(handle);
            self.registry.post_prepare(session);

            // Recover other state (notably locks) via the resource
            // managers.
            for record in parsed.records() {
                let record = record?;
                self.rmgr
                    .dispatch(RmgrPhase::Recover, record.rmid, xid, record.info, record.data);
            }
            count += 1;
        }

        self.stats.record_recovered(count as u64);
        Ok(count)
    }

    fn read_payload_for_recovery(
        &self,
        xid: TransactionId,
        lsn: Lsn,
    ) -> TwoPhaseResult<(ParsedPayload, Lsn)> {
        let corrupt = |detail: String| TwoPhaseError::CorruptWal { xid, lsn, detail };

        let (record, end) = self
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
        Ok((parsed, end))
    }
}
