//! Integration tests for revision monitors.
//!
//! These tests verify:
//! - Liveness: every commit wakes every monitor with that Globalrev
//! - Cancellation of blocked waits via `close`
//! - Consumers reading complete snapshots while a producer streams

use alopex_recdb::{ElementType, MonitorConfig, RecDatabase, RecDbError};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_commit_wakes_blocked_monitor() {
    let db = RecDatabase::new();
    let monitor = db.start_monitoring_globalrevs();

    thread::scope(|scope| {
        let waiter = scope.spawn(|| monitor.wait_next());
        thread::sleep(Duration::from_millis(20));
        let committed = db.end_transaction(db.start_transaction()).unwrap();
        let seen = waiter.join().unwrap().unwrap();
        assert!(seen.ptr_eq(&committed));
    });
}

#[test]
fn test_all_monitors_see_every_commit() {
    const MONITORS: usize = 4;
    const COMMITS: u64 = 5;
    let db = RecDatabase::new();
    let monitors: Vec<_> = (0..MONITORS)
        .map(|_| db.start_monitoring_globalrevs())
        .collect();
    assert_eq!(db.monitor_count(), MONITORS);

    let ready = Arc::new(Barrier::new(MONITORS + 1));
    thread::scope(|scope| {
        let handles: Vec<_> = monitors
            .iter()
            .map(|monitor| {
                let ready = ready.clone();
                scope.spawn(move || {
                    ready.wait();
                    (0..COMMITS)
                        .map(|_| monitor.wait_next().unwrap().number())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        ready.wait();
        for _ in 0..COMMITS {
            db.end_transaction(db.start_transaction()).unwrap();
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), (1..=COMMITS).collect::<Vec<_>>());
        }
    });
}

#[test]
fn test_monitor_starts_after_current_globalrev() {
    let db = RecDatabase::new();
    db.end_transaction(db.start_transaction()).unwrap();
    let monitor = db.start_monitoring_globalrevs();
    assert_eq!(monitor.last_seen(), 1);
    assert!(monitor.try_next().unwrap().is_none());

    db.end_transaction(db.start_transaction()).unwrap();
    assert_eq!(monitor.try_next().unwrap().unwrap().number(), 2);
}

#[test]
fn test_close_cancels_wait_from_another_thread() {
    let db = RecDatabase::new();
    let monitor = db.start_monitoring_globalrevs();

    thread::scope(|scope| {
        let waiter = scope.spawn(|| monitor.wait_next());
        thread::sleep(Duration::from_millis(20));
        monitor.close();
        assert!(matches!(waiter.join().unwrap(), Err(RecDbError::Cancelled)));
    });
    assert_eq!(db.monitor_count(), 0);

    // Closed monitors no longer receive revisions.
    db.end_transaction(db.start_transaction()).unwrap();
    assert!(matches!(monitor.try_next(), Err(RecDbError::Cancelled)));
}

#[test]
fn test_wait_next_timeout_without_commits() {
    let db = RecDatabase::new();
    let monitor = db.start_monitoring_globalrevs();
    let err = monitor
        .wait_next_timeout(Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, RecDbError::Timeout(_)));
    assert!(err.is_retryable());
}

#[test]
fn test_small_queue_drops_oldest() {
    let db = RecDatabase::new();
    let monitor = db.start_monitoring_globalrevs_with(MonitorConfig::default().with_queue_limit(1));
    for _ in 0..3 {
        db.end_transaction(db.start_transaction()).unwrap();
    }
    assert_eq!(monitor.dropped(), 2);
    assert_eq!(monitor.wait_next().unwrap().number(), 3);
}

/// A consumer following a streaming producer only ever reads complete,
/// consistent frames.
#[test]
fn test_consumer_reads_consistent_frames_while_streaming() {
    const FRAMES: u8 = 20;
    let db = RecDatabase::new();
    let mut txn = db.start_transaction();
    let channel = db.define_channel(&mut txn, "/CAM0", "main").unwrap();
    db.end_transaction(txn).unwrap();

    let monitor = db.start_monitoring_globalrevs();
    thread::scope(|scope| {
        scope.spawn(|| {
            for value in 1..=FRAMES {
                let mut txn = db.start_transaction();
                let rec = db
                    .create_recording(&mut txn, &channel, ElementType::UInt8)
                    .unwrap();
                db.end_transaction(txn).unwrap();
                rec.mark_metadata_done().unwrap();
                rec.allocate_storage(0, &[16, 16]).unwrap();
                rec.reference_ndarray(0).unwrap().fill(value).unwrap();
                rec.mark_data_ready().unwrap();
            }
        });

        let mut last_revision = 0;
        for _ in 0..FRAMES {
            let rev = monitor.wait_next().unwrap();
            rev.wait_complete();
            let rec = rev.get_recording_ref("/CAM0").unwrap();
            let data = rec.data::<u8>(0).unwrap();
            assert!(data.iter().all(|&v| v == data[0]), "torn frame");
            assert_eq!(u64::from(data[0]), rec.revision());
            assert!(rec.revision() > last_revision);
            last_revision = rec.revision();
        }
    });
}
