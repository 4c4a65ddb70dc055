//! Journal device failure and member-device demotion.

mod common;

use std::sync::Arc;

use common::{MockArray, make_stripe, test_config, test_geometry, wait_until};
use stripecache_log::{CacheAdmission, Error, JournalMode, Log};
use tempfile::tempdir;

#[test]
fn test_device_failure_falls_back_to_unlogged_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("journal");
    let array = MockArray::new(true);
    let log = Arc::new(
        Log::init(
            &path,
            array.clone(),
            test_geometry(),
            test_config(JournalMode::WriteThrough, 256),
        )
        .unwrap(),
    );
    array.attach(&log);
    assert!(!log.disk_error());

    log.inject_device_fault(true);
    let stripe = make_stripe(0, &[(0, 0x99)]);
    log.write_stripe(&stripe).unwrap();
    // The failed submission declares the journal dead and hands the
    // stripe back for a direct, unlogged write.
    log.submit_pending();

    assert!(log.disk_error());
    assert_eq!(*array.unlogged.lock(), vec![0]);
    assert!(array.logged.lock().is_empty());

    // From now on every call declines instantly; nothing blocks.
    let next = make_stripe(32, &[(0, 0x77)]);
    assert!(matches!(log.write_stripe(&next), Err(Error::JournalFailed)));
    assert!(matches!(
        log.handle_flush_request(),
        Err(Error::JournalFailed)
    ));
    assert!(matches!(log.flush_to_array(), Err(Error::JournalFailed)));
    assert!(!log.is_writeback());
    log.shutdown();
}

#[test]
fn test_failure_is_sticky_after_fault_clears() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("journal");
    let array = MockArray::new(true);
    let log = Arc::new(
        Log::init(
            &path,
            array.clone(),
            test_geometry(),
            test_config(JournalMode::WriteThrough, 256),
        )
        .unwrap(),
    );
    array.attach(&log);

    log.inject_device_fault(true);
    let stripe = make_stripe(0, &[(0, 1)]);
    log.write_stripe(&stripe).unwrap();
    log.submit_pending();
    assert!(log.disk_error());

    // The device "recovering" does not resurrect the log.
    log.inject_device_fault(false);
    let next = make_stripe(32, &[(0, 2)]);
    assert!(matches!(log.write_stripe(&next), Err(Error::JournalFailed)));
    log.shutdown();
}

#[test]
fn test_member_error_demotes_writeback() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("journal");
    let array = MockArray::new(true);
    let log = Arc::new(
        Log::init(
            &path,
            array.clone(),
            test_geometry(),
            test_config(JournalMode::WriteBack, 256),
        )
        .unwrap(),
    );
    array.attach(&log);

    for i in 0..3u64 {
        let stripe = make_stripe(i * 32, &[(0, i as u8)]);
        assert_eq!(
            log.try_cache_write(&stripe).unwrap(),
            CacheAdmission::Accepted
        );
        log.cache_data(&stripe).unwrap();
    }
    log.handle_flush_request().unwrap();
    assert_eq!(log.stats().cached_stripes, 3);

    log.member_disk_error();
    assert!(!log.is_writeback());

    // Every cached stripe drains through the normal write-out path.
    wait_until("cache drained", || log.stats().cached_stripes == 0);
    assert_eq!(array.applied.lock().len(), 3);

    // Admission stays off, but logging itself still works.
    let stripe = make_stripe(128, &[(0, 0xEE)]);
    assert_eq!(
        log.try_cache_write(&stripe).unwrap(),
        CacheAdmission::Declined
    );
    log.write_stripe(&stripe).unwrap();
    log.submit_pending();
    wait_until("logged write applied", || {
        array.applied.lock().contains(&128)
    });
    assert!(!log.disk_error());
    log.shutdown();
}
