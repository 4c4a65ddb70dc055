//! Shared test fixtures: a mock parity engine and config/geometry helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use stripecache_log::{
    ArrayGeometry, JournalConfig, JournalMode, Log, PAGE_SIZE, ParityArray, Result, Stripe,
    StripeRecord,
};

/// Parity engine stand-in. With `auto_finish` set, every write-out is
/// acknowledged back to the log immediately, as a healthy array would;
/// with it clear, write-outs pile up in `pending` for the test to finish
/// by hand.
pub struct MockArray {
    log: Mutex<Weak<Log>>,
    auto_finish: AtomicBool,
    pub logged: Mutex<Vec<u64>>,
    pub unlogged: Mutex<Vec<u64>>,
    pub applied: Mutex<Vec<u64>>,
    pub replayed: Mutex<Vec<StripeRecord>>,
    pub pending: Mutex<Vec<Arc<Stripe>>>,
}

impl MockArray {
    pub fn new(auto_finish: bool) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Weak::new()),
            auto_finish: AtomicBool::new(auto_finish),
            logged: Mutex::new(Vec::new()),
            unlogged: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            replayed: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Wire up the completion path once the log exists
    pub fn attach(&self, log: &Arc<Log>) {
        *self.log.lock() = Arc::downgrade(log);
    }

    pub fn set_auto_finish(&self, on: bool) {
        self.auto_finish.store(on, Ordering::SeqCst);
    }

    /// Finish one hand-held write-out
    pub fn finish(&self, stripe: &Arc<Stripe>) {
        let log = self.log.lock().upgrade().expect("log is gone");
        self.applied.lock().push(stripe.sector());
        log.stripe_write_finished(stripe);
    }

    /// Take all hand-held write-outs
    pub fn take_pending(&self) -> Vec<Arc<Stripe>> {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl ParityArray for MockArray {
    fn stripe_logged(&self, stripe: &Arc<Stripe>) {
        self.logged.lock().push(stripe.sector());
    }

    fn writeout(&self, stripe: &Arc<Stripe>) -> Result<()> {
        if self.auto_finish.load(Ordering::SeqCst) {
            if let Some(log) = self.log.lock().upgrade() {
                self.applied.lock().push(stripe.sector());
                log.stripe_write_finished(stripe);
                return Ok(());
            }
        }
        self.pending.lock().push(Arc::clone(stripe));
        Ok(())
    }

    fn resubmit_unlogged(&self, stripe: &Arc<Stripe>) {
        self.unlogged.lock().push(stripe.sector());
    }

    fn replay(&self, record: StripeRecord) -> Result<()> {
        self.replayed.lock().push(record);
        Ok(())
    }
}

/// Geometry used across the integration tests: 4-page rows (32 sectors),
/// big stripes of two rows.
pub fn test_geometry() -> ArrayGeometry {
    ArrayGeometry {
        pages_per_stripe: 4,
        big_stripe_sectors: 64,
    }
}

/// Journal config sized for tempfile-backed tests
pub fn test_config(mode: JournalMode, ring_blocks_plus_super: u64) -> JournalConfig {
    let mut config = JournalConfig {
        mode,
        ..JournalConfig::default()
    };
    config.create_blocks = Some(ring_blocks_plus_super);
    config.direct_io = false;
    config.batch_window_ms = 2;
    config.worker_tick_ms = 5;
    config.cache.capacity_stripes = 16;
    config
}

/// A stripe with the given pages staged
pub fn make_stripe(sector: u64, pages: &[(usize, u8)]) -> Arc<Stripe> {
    let stripe = Stripe::new(sector, 4);
    for &(index, fill) in pages {
        stripe.stage_page(index, Bytes::from(vec![fill; PAGE_SIZE]));
    }
    stripe
}

/// Poll until `cond` holds, panicking after five seconds
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
