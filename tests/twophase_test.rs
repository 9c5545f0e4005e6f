// End-to-end scenarios for the two-phase commit core: prepare and finish
// against a real on-disk WAL, crash simulation by reopening the log in a
// fresh set of components, and the checkpoint horizon contract.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tempfile::TempDir;

use anchordb::clog::{Clog, DistributedLog};
use anchordb::common::{RelFileNode, TransactionId, XidCache};
use anchordb::procarray::ProcArray;
use anchordb::smgr::StorageManager;
use anchordb::twophase::{
    GxactHandle, RmgrCallbacks, RmgrId, Session, TwoPhaseConfig, TwoPhaseError, TwoPhaseManager,
};
use anchordb::wal::{WalConfig, WalManager, WalRecordKind};

/// A database instance assembled from its durability components. Dropping
/// it and rebuilding over the same directory simulates a crash: only the
/// file system survives.
struct TestDb {
    dir: TempDir,
    manager: TwoPhaseManager,
    wal: Arc<WalManager>,
    clog: Arc<Clog>,
    dlog: Arc<DistributedLog>,
    procarray: Arc<ProcArray>,
    smgr: Arc<StorageManager>,
}

fn build(dir: TempDir) -> TestDb {
    let wal = Arc::new(
        WalManager::open(dir.path().join("wal.log"), WalConfig { max_wal_senders: 1 }).unwrap(),
    );
    let clog = Arc::new(Clog::new());
    let dlog = Arc::new(DistributedLog::new());
    let procarray = Arc::new(ProcArray::new());
    let smgr = Arc::new(StorageManager::new(dir.path().join("base")));
    let xids = Arc::new(XidCache::new(1));

    let manager = TwoPhaseManager::new(
        TwoPhaseConfig {
            max_prepared_xacts: 4,
            ..Default::default()
        },
        Arc::clone(&wal),
        Arc::clone(&clog),
        Arc::clone(&dlog),
        Arc::clone(&procarray),
        Arc::clone(&smgr),
        xids,
    );

    TestDb {
        dir,
        manager,
        wal,
        clog,
        dlog,
        procarray,
        smgr,
    }
}

fn new_db() -> TestDb {
    build(tempfile::tempdir().unwrap())
}

/// Simulates a crash and restart over the same data directory.
fn crash_and_reopen(db: TestDb) -> TestDb {
    let TestDb { dir, .. } = db;
    build(dir)
}

fn session(id: u64) -> Session {
    Session::new(id, 1, 7)
}

#[allow(clippy::too_many_arguments)]
fn prepare(
    db: &TestDb,
    sess: &Session,
    xid: TransactionId,
    gid: &str,
    subxids: &[TransactionId],
    commit_rels: &[RelFileNode],
    abort_rels: &[RelFileNode],
    records: &[(RmgrId, u16, Vec<u8>)],
) -> GxactHandle {
    let handle = db
        .manager
        .reserve_prepare(sess, xid, gid, sess.role, sess.database, Utc::now(), None)
        .unwrap();
    let mut builder = db
        .manager
        .begin_payload(sess, handle, subxids, commit_rels, abort_rels)
        .unwrap();
    for (rmid, info, data) in records {
        builder.register_record(*rmid, *info, data);
    }
    db.manager.end_prepare(sess, handle, builder).unwrap();
    handle
}

fn wal_kinds(db: &TestDb) -> Vec<WalRecordKind> {
    db.wal
        .records_from(0)
        .unwrap()
        .into_iter()
        .map(|(_, record, _)| record.kind)
        .collect()
}

#[test]
fn test_happy_commit() {
    let db = new_db();
    let sess = session(1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    db.manager.rmgr().register(
        5,
        RmgrCallbacks {
            post_commit: Some(Box::new(move |xid, info, data| {
                recorded.lock().unwrap().push((xid, info, data.to_vec()));
            })),
            ..Default::default()
        },
    );

    let rel = RelFileNode::new(1, 2, 3);
    db.smgr.create(rel).unwrap();

    prepare(
        &db,
        &sess,
        42,
        "gxa",
        &[43, 44],
        &[rel],
        &[],
        &[(5, 0, vec![0xAA, 0xBB])],
    );
    assert_eq!(db.manager.list_prepared().len(), 1);
    assert!(db.procarray.xid_in_progress(42));

    assert!(db.manager.finish(&sess, "gxa", true, true).unwrap());

    assert_eq!(
        wal_kinds(&db),
        vec![WalRecordKind::XactPrepare, WalRecordKind::XactCommitPrepared]
    );
    assert!(db.clog.did_commit(42));
    assert!(db.clog.did_commit(43));
    assert!(db.clog.did_commit(44));
    assert!(!db.smgr.exists(rel));
    assert_eq!(*seen.lock().unwrap(), vec![(42, 0, vec![0xAA, 0xBB])]);

    // The registry is empty again and the XID no longer reads as running.
    assert!(db.manager.list_prepared().is_empty());
    assert_eq!(db.manager.registry().free_count(), 4);
    assert!(db.manager.recovery_index().is_empty());
    assert!(!db.procarray.xid_in_progress(42));
    assert_eq!(db.procarray.latest_completed_xid(), 44);

    let stats = db.manager.stats();
    assert_eq!(stats.prepared, 1);
    assert_eq!(stats.committed_prepared, 1);
}

#[test]
fn test_rollback_after_prepare() {
    let db = new_db();
    let sess = session(1);

    let commit_rel = RelFileNode::new(1, 2, 3);
    let abort_rel = RelFileNode::new(9, 9, 9);
    db.smgr.create(commit_rel).unwrap();
    db.smgr.create(abort_rel).unwrap();

    prepare(
        &db,
        &sess,
        42,
        "gxa",
        &[43, 44],
        &[commit_rel],
        &[abort_rel],
        &[],
    );
    assert!(db.manager.finish(&sess, "gxa", false, true).unwrap());

    assert_eq!(
        wal_kinds(&db),
        vec![WalRecordKind::XactPrepare, WalRecordKind::XactAbortPrepared]
    );
    assert!(db.clog.did_abort(42));
    assert!(db.clog.did_abort(43));

    // Only the drop-on-abort file goes away.
    assert!(!db.smgr.exists(abort_rel));
    assert!(db.smgr.exists(commit_rel));

    assert!(db.manager.list_prepared().is_empty());
    assert_eq!(db.manager.stats().aborted_prepared, 1);
}

#[test]
fn test_duplicate_gid_rejected() {
    let db = new_db();
    let sess = session(1);

    prepare(&db, &sess, 1, "gxa", &[], &[], &[], &[]);

    let free_before = db.manager.registry().free_count();
    let err = db
        .manager
        .reserve_prepare(&session(2), 2, "gxa", 1, 7, Utc::now(), None)
        .unwrap_err();
    assert!(matches!(err, TwoPhaseError::DuplicateGid { .. }));
    assert_eq!(db.manager.registry().free_count(), free_before);
}

#[test]
fn test_crash_replay_then_commit() {
    let db = new_db();
    let sess = session(1);

    let rel = RelFileNode::new(4, 5, 6);
    db.smgr.create(rel).unwrap();

    prepare(
        &db,
        &sess,
        100,
        "gxb",
        &[101],
        &[rel],
        &[],
        &[(5, 1, vec![0xAA, 0xBB])],
    );

    // Crash before any finish: only the log and data files survive.
    let db = crash_and_reopen(db);
    assert!(db.manager.list_prepared().is_empty());

    let recovered = Arc::new(Mutex::new(Vec::new()));
    let committed = Arc::new(Mutex::new(Vec::new()));
    let recovered_tap = Arc::clone(&recovered);
    let committed_tap = Arc::clone(&committed);
    db.manager.rmgr().register(
        5,
        RmgrCallbacks {
            recover: Some(Box::new(move |xid, info, data| {
                recovered_tap.lock().unwrap().push((xid, info, data.to_vec()));
            })),
            post_commit: Some(Box::new(move |xid, info, data| {
                committed_tap.lock().unwrap().push((xid, info, data.to_vec()));
            })),
            ..Default::default()
        },
    );

    db.manager.replay().unwrap();
    assert_eq!(db.manager.recovery_index().len(), 1);

    let oldest = db.manager.prescan_and_advance_next_xid().unwrap();
    assert_eq!(oldest, 100);

    let startup = Session::new(999, 0, 0);
    assert_eq!(db.manager.recover_prepared(&startup).unwrap(), 1);

    // The recover callback saw exactly the bytes registered pre-crash.
    assert_eq!(*recovered.lock().unwrap(), vec![(100, 1, vec![0xAA, 0xBB])]);

    let rows = db.manager.list_prepared();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].gid, "gxb");
    assert_eq!(rows[0].xid, 100);
    assert_ne!(rows[0].prepare_lsn, 0);

    // The rebuilt slot publishes a dummy participant and is indexed for
    // any further crash.
    assert!(db.procarray.xid_in_progress(100));
    assert_eq!(
        db.procarray
            .count_backend(db.manager.dummy_participant_id(100)),
        1
    );
    assert_eq!(
        db.manager.recovery_index().lookup(100),
        Some(rows[0].prepare_begin_lsn)
    );

    assert!(db.manager.finish(&sess, "gxb", true, true).unwrap());
    assert!(db.clog.did_commit(100));
    assert!(db.clog.did_commit(101));
    assert!(!db.smgr.exists(rel));
    assert_eq!(*committed.lock().unwrap(), vec![(100, 1, vec![0xAA, 0xBB])]);
    assert!(db.manager.list_prepared().is_empty());
}

#[test]
fn test_replay_skips_finished_transactions() {
    let db = new_db();
    let sess = session(1);

    prepare(&db, &sess, 10, "done", &[], &[], &[], &[]);
    assert!(db.manager.finish(&sess, "done", true, true).unwrap());
    prepare(&db, &sess, 20, "pending", &[], &[], &[], &[]);

    let db = crash_and_reopen(db);
    db.manager.replay().unwrap();

    // Only the undecided transaction is re-indexed; the decided one has
    // its commit redone in the commit log.
    assert_eq!(db.manager.recovery_index().len(), 1);
    assert!(db.manager.recovery_index().contains(20));
    assert!(db.clog.did_commit(10));

    let startup = Session::new(999, 0, 0);
    assert_eq!(db.manager.recover_prepared(&startup).unwrap(), 1);
    assert_eq!(db.manager.list_prepared()[0].gid, "pending");
}

#[test]
fn test_checkpoint_payload_seeds_recovery() {
    let db = new_db();
    let sess = session(1);

    prepare(&db, &sess, 50, "gxc", &[], &[], &[], &[]);
    let pointers = db.manager.collect_for_checkpoint();
    assert_eq!(pointers.len(), 1);
    assert_eq!(pointers[0].xid, 50);

    let db = crash_and_reopen(db);

    // Restore from the checkpoint payload alone, without a full replay.
    db.manager.setup_from_checkpoint(&pointers);
    let startup = Session::new(999, 0, 0);
    assert_eq!(db.manager.recover_prepared(&startup).unwrap(), 1);

    assert!(db.manager.finish(&sess, "gxc", true, true).unwrap());
    assert!(db.clog.did_commit(50));
}

#[test]
fn test_checkpoint_record_round_trips_through_replay() {
    let db = new_db();
    let sess = session(1);

    prepare(&db, &sess, 60, "gxd", &[], &[], &[], &[]);
    db.manager.checkpoint().unwrap();

    let db = crash_and_reopen(db);
    db.manager.replay().unwrap();
    assert!(db.manager.recovery_index().contains(60));

    let startup = Session::new(999, 0, 0);
    assert_eq!(db.manager.recover_prepared(&startup).unwrap(), 1);
    assert_eq!(db.manager.list_prepared()[0].gid, "gxd");
}

#[test]
fn test_cross_session_finish_race() {
    let db = new_db();
    let preparer = session(1);
    prepare(&db, &preparer, 42, "gxa", &[], &[], &[], &[]);

    // Session A locks the transaction for finish, then dies.
    let finisher_a = session(2).superuser();
    db.manager
        .registry()
        .lock_for_finish("gxa", &finisher_a)
        .unwrap()
        .unwrap();

    let finisher_b = session(3).superuser();
    let err = db.manager.finish(&finisher_b, "gxa", true, true).unwrap_err();
    assert!(matches!(err, TwoPhaseError::Busy { .. }));

    db.manager.at_abort(&finisher_a);

    // B's retry now succeeds.
    assert!(db.manager.finish(&finisher_b, "gxa", true, true).unwrap());
    assert!(db.manager.list_prepared().is_empty());
}

#[test]
fn test_checkpoint_horizon_tracks_oldest_prepare() {
    let db = new_db();
    let sess = session(1);

    prepare(&db, &sess, 1, "gxa", &[], &[], &[], &[]);
    prepare(&db, &sess, 2, "gxb", &[], &[], &[], &[]);
    prepare(&db, &sess, 3, "gxc", &[], &[], &[], &[]);

    let rows = db.manager.list_prepared();
    let lsn_of = |gid: &str| {
        rows.iter()
            .find(|r| r.gid == gid)
            .unwrap()
            .prepare_begin_lsn
    };
    assert!(lsn_of("gxa") < lsn_of("gxb"));
    assert!(lsn_of("gxb") < lsn_of("gxc"));

    assert_eq!(db.manager.oldest_prepare_lsn(), Some(lsn_of("gxa")));

    assert!(db.manager.finish(&sess, "gxa", true, true).unwrap());
    assert_eq!(db.manager.oldest_prepare_lsn(), Some(lsn_of("gxb")));

    // Log trimming bounded by the horizon keeps the survivors readable.
    db.wal.truncate_before(db.manager.oldest_prepare_lsn().unwrap());
    assert!(db.manager.finish(&sess, "gxb", true, true).unwrap());
    assert!(db.manager.finish(&sess, "gxc", true, true).unwrap());
    assert_eq!(db.manager.oldest_prepare_lsn(), None);
}

#[test]
fn test_finish_unknown_gid() {
    let db = new_db();
    let sess = session(1).superuser();

    assert!(!db.manager.finish(&sess, "nope", true, false).unwrap());
    let err = db.manager.finish(&sess, "nope", true, true).unwrap_err();
    assert!(matches!(err, TwoPhaseError::NotFound { .. }));
}

#[test]
fn test_distributed_gid_updates_distributed_log() {
    let db = new_db();
    let sess = session(1);

    let gid = "1700000000-0000000055";
    prepare(&db, &sess, 42, gid, &[43], &[], &[], &[]);
    assert!(db.manager.finish(&sess, gid, true, true).unwrap());

    let entry = db.dlog.get(42).unwrap();
    assert_eq!(entry.distrib_timestamp, 1_700_000_000);
    assert_eq!(entry.distrib_xid, 55);
    assert!(db.dlog.get(43).is_some());

    // Local GIDs leave the distributed log untouched.
    prepare(&db, &sess, 60, "local", &[], &[], &[], &[]);
    assert!(db.manager.finish(&sess, "local", true, true).unwrap());
    assert!(db.dlog.get(60).is_none());
}

#[test]
fn test_sender_wakeups_on_prepare_and_finish() {
    let db = new_db();
    let sess = session(1);

    prepare(&db, &sess, 1, "gxa", &[], &[], &[], &[]);
    let after_prepare = db.wal.sender_wakeups();
    assert!(after_prepare >= 1);

    db.manager.finish(&sess, "gxa", true, true).unwrap();
    assert!(db.wal.sender_wakeups() > after_prepare);
}

#[test]
fn test_prepare_survives_while_unrelated_work_commits() {
    // Interleaved lifecycles of two GIDs are independent.
    let db = new_db();
    let s1 = session(1);
    let s2 = session(2);

    prepare(&db, &s1, 1, "gxa", &[], &[], &[], &[]);
    prepare(&db, &s2, 2, "gxb", &[], &[], &[], &[]);

    assert!(db.manager.finish(&s2, "gxb", false, true).unwrap());
    let rows = db.manager.list_prepared();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].gid, "gxa");
    assert!(db.procarray.xid_in_progress(1));
    assert!(!db.procarray.xid_in_progress(2));

    assert!(db.manager.finish(&s1, "gxa", true, true).unwrap());
    assert_eq!(db.manager.registry().free_count(), 4);
}

#[test]
fn test_payload_too_large_fails_before_wal() {
    let dir = tempfile::tempdir().unwrap();
    let wal = Arc::new(
        WalManager::open(dir.path().join("wal.log"), WalConfig::default()).unwrap(),
    );
    let manager = TwoPhaseManager::new(
        TwoPhaseConfig {
            max_prepared_xacts: 2,
            max_state_payload: 512,
            ..Default::default()
        },
        Arc::clone(&wal),
        Arc::new(Clog::new()),
        Arc::new(DistributedLog::new()),
        Arc::new(ProcArray::new()),
        Arc::new(StorageManager::new(dir.path().join("base"))),
        Arc::new(XidCache::new(1)),
    );

    let sess = session(1);
    let handle = manager
        .reserve_prepare(&sess, 1, "gxa", 1, 7, Utc::now(), None)
        .unwrap();
    let mut builder = manager.begin_payload(&sess, handle, &[], &[], &[]).unwrap();
    builder.register_record(3, 0, &vec![0u8; 1024]);

    let err = manager.end_prepare(&sess, handle, builder).unwrap_err();
    assert!(matches!(err, TwoPhaseError::LimitExceeded { .. }));

    // Nothing reached the log; the abort hook reclaims the reservation.
    assert!(wal.records_from(0).unwrap().is_empty());
    manager.at_abort(&sess);
    assert_eq!(manager.registry().free_count(), 2);
}
