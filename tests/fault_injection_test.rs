// Crash simulation through the named fault-injection sites. This lives in
// its own test binary because the hooks are process-global.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// The hook table is process-global; tests touching it must not overlap.
static FAULT_LOCK: Mutex<()> = Mutex::new(());

use chrono::Utc;

use anchordb::clog::{Clog, DistributedLog};
use anchordb::common::XidCache;
use anchordb::faults::{self, FaultSite};
use anchordb::procarray::ProcArray;
use anchordb::smgr::StorageManager;
use anchordb::twophase::{Session, TwoPhaseConfig, TwoPhaseManager};
use anchordb::wal::{WalConfig, WalManager};

fn build_manager(dir: &tempfile::TempDir) -> TwoPhaseManager {
    let wal = Arc::new(
        WalManager::open(dir.path().join("wal.log"), WalConfig::default()).unwrap(),
    );
    TwoPhaseManager::new(
        TwoPhaseConfig {
            max_prepared_xacts: 2,
            ..Default::default()
        },
        wal,
        Arc::new(Clog::new()),
        Arc::new(DistributedLog::new()),
        Arc::new(ProcArray::new()),
        Arc::new(StorageManager::new(dir.path().join("base"))),
        Arc::new(XidCache::new(1)),
    )
}

fn prepare_one(manager: &TwoPhaseManager, sess: &Session, xid: u64, gid: &str) {
    let handle = manager
        .reserve_prepare(sess, xid, gid, sess.role, sess.database, Utc::now(), None)
        .unwrap();
    let builder = manager.begin_payload(sess, handle, &[], &[], &[]).unwrap();
    manager.end_prepare(sess, handle, builder).unwrap();
}

#[test]
fn test_session_dying_at_commit_site_leaves_retryable_slot() {
    let _serial = FAULT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let manager = build_manager(&dir);

    let preparer = Session::new(1, 1, 7);
    prepare_one(&manager, &preparer, 42, "gxa");

    // The first finisher dies exactly at the commit-record site, before
    // the decision reaches the log.
    faults::set_hook(FaultSite::TwoPhaseTransactionCommitPrepared, || {
        panic!("simulated crash before the decision record");
    });

    let finisher_a = Session::new(2, 1, 7).superuser();
    let result = catch_unwind(AssertUnwindSafe(|| {
        manager.finish(&finisher_a, "gxa", true, true)
    }));
    assert!(result.is_err());
    faults::clear_hook(FaultSite::TwoPhaseTransactionCommitPrepared);

    // No decision was logged, so the exit hook releases the slot for a
    // retry and the retry commits cleanly.
    manager.at_exit(&finisher_a);
    assert_eq!(manager.sessions_delaying_checkpoint(), 0);

    let finisher_b = Session::new(3, 1, 7).superuser();
    assert!(manager.finish(&finisher_b, "gxa", true, true).unwrap());
    assert!(manager.list_prepared().is_empty());
}

#[test]
fn test_prepare_and_finish_sites_fire_in_order() {
    let _serial = FAULT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let manager = build_manager(&dir);

    let fired = Arc::new(AtomicUsize::new(0));
    let at_start = Arc::clone(&fired);
    let at_end = Arc::clone(&fired);
    let at_finish = Arc::clone(&fired);

    faults::set_hook(FaultSite::StartPrepareTx, move || {
        // First site to fire.
        assert_eq!(at_start.fetch_add(1, Ordering::SeqCst), 0);
    });
    faults::set_hook(FaultSite::EndPreparedTwoPhaseSleep, move || {
        assert_eq!(at_end.fetch_add(1, Ordering::SeqCst), 1);
    });
    faults::set_hook(FaultSite::FinishPreparedAfterRecordCommitPrepared, move || {
        assert_eq!(at_finish.fetch_add(1, Ordering::SeqCst), 2);
    });

    let sess = Session::new(1, 1, 7);
    prepare_one(&manager, &sess, 7, "ordered");
    manager.finish(&sess, "ordered", false, true).unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 3);
    faults::clear_all();
}
