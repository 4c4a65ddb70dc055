//! Write-back cache policy
//!
//! In write-back mode a stripe write may be absorbed into the journal and
//! acknowledged before the array sees it; the deferred array write is paid
//! later, ideally after more writes to the same stripe have coalesced.
//! Admission is bounded by a stripe-count watermark and by the scratch-page
//! pool; the reclaim worker drains the cache back below the low watermark
//! and opportunistically promotes fully dirty stripes first, since those
//! need no pre-image read at parity time.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use stripecache_common::{CacheAdmission, Error, Result};

use crate::log::{Log, LogInner};
use crate::stripe::{ExtraPage, PagePool, StateKind, Stripe};

/// A stripe resident in the cache
struct CachedStripe {
    stripe: Arc<Stripe>,
    /// Sequence number of the stripe's first journal record; cached
    /// stripes with low first records pin the log head, so drains pick
    /// the lowest first.
    first_seq: u64,
}

/// Cache residency tracking, guarded by the log's append lock
pub(crate) struct CacheState {
    entries: HashMap<u64, CachedStripe>,
    /// Refcount of cached sub-stripes per big-stripe region
    big_refs: HashMap<u64, usize>,
    pool: PagePool,
}

impl CacheState {
    pub(crate) fn new(capacity_stripes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            big_refs: HashMap::new(),
            pool: PagePool::new(capacity_stripes),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn pool_acquire(&self) -> Option<ExtraPage> {
        self.pool.acquire()
    }

    pub(crate) fn contains(&self, stripe: &Arc<Stripe>) -> bool {
        self.entries
            .get(&stripe.sector())
            .is_some_and(|e| Arc::ptr_eq(&e.stripe, stripe))
    }

    pub(crate) fn insert(&mut self, stripe: Arc<Stripe>, first_seq: u64, big_stripe_sectors: u64) {
        let big = stripe.sector() / big_stripe_sectors;
        let prev = self.entries.insert(
            stripe.sector(),
            CachedStripe { stripe, first_seq },
        );
        debug_assert!(prev.is_none(), "cache already holds this sector");
        *self.big_refs.entry(big).or_insert(0) += 1;
    }

    /// Drop the stripe's residency entry (no-op if it is not resident)
    pub(crate) fn remove(&mut self, stripe: &Arc<Stripe>, big_stripe_sectors: u64) {
        let sector = stripe.sector();
        let resident = self
            .entries
            .get(&sector)
            .is_some_and(|e| Arc::ptr_eq(&e.stripe, stripe));
        if !resident {
            return;
        }
        self.entries.remove(&sector);
        let big = sector / big_stripe_sectors;
        if let Some(refs) = self.big_refs.get_mut(&big) {
            *refs -= 1;
            if *refs == 0 {
                self.big_refs.remove(&big);
            }
        }
    }

    /// Whether any cached sub-stripe falls inside the given big stripe
    pub(crate) fn big_cached(&self, big_index: u64) -> bool {
        self.big_refs.contains_key(&big_index)
    }

    /// Up to `max` stripes still in `Caching` state, oldest journal
    /// record first
    pub(crate) fn caching_stripes(&self, max: usize) -> Vec<Arc<Stripe>> {
        let mut candidates: Vec<(u64, Arc<Stripe>)> = self
            .entries
            .values()
            .filter(|e| e.stripe.state_kind() == StateKind::Caching)
            .map(|e| (e.first_seq, Arc::clone(&e.stripe)))
            .collect();
        candidates.sort_by_key(|(seq, _)| *seq);
        candidates.truncate(max);
        candidates.into_iter().map(|(_, s)| s).collect()
    }

    /// Caching stripes whose every page is dirty
    pub(crate) fn full_caching_stripes(&self) -> Vec<Arc<Stripe>> {
        self.entries
            .values()
            .filter(|e| e.stripe.state_kind() == StateKind::Caching && e.stripe.is_full_write())
            .map(|e| Arc::clone(&e.stripe))
            .collect()
    }
}

impl Log {
    /// Try to accept a stripe into the write-back cache.
    ///
    /// Declines (caller falls back to the immediate write path) when the
    /// journal is not effectively in write-back mode, the write is a full
    /// stripe (parity is due anyway), occupancy is at the high watermark,
    /// or the scratch-page pool is exhausted. Idempotent for stripes that
    /// are already caching. `Err(AlreadyCaching)` means the stripe is
    /// mid-drain and cannot take new writes yet.
    pub fn try_cache_write(&self, stripe: &Arc<Stripe>) -> Result<CacheAdmission> {
        let inner = &self.inner;
        let mut state = inner.admission_lock()?;

        if !state.mode.is_writeback() || state.caching_disabled {
            return Ok(CacheAdmission::Declined);
        }
        if stripe.is_full_write() {
            return Ok(CacheAdmission::Declined);
        }
        if state.cache.len() >= inner.config.cache.high_water_stripes() {
            drop(state);
            inner.notify_worker();
            return Ok(CacheAdmission::Declined);
        }

        let was_caching = stripe.state_kind() == StateKind::Caching;
        // Partial writes need a scratch page to rebuild pre-image data when
        // parity is finally computed.
        let admission = stripe.begin_caching(|| state.cache.pool_acquire(), true)?;
        if admission == CacheAdmission::Accepted && !was_caching {
            let first_seq = state.ring.next_seq();
            state
                .cache
                .insert(Arc::clone(stripe), first_seq, inner.geometry.big_stripe_sectors);
            debug!(
                sector = stripe.sector(),
                cached = state.cache.len(),
                "stripe accepted into cache"
            );
        }
        Ok(admission)
    }

    /// Journal the current dirty data of a caching stripe without driving
    /// it toward the array. Panics if the stripe is not in `Caching` state:
    /// that is a protocol violation in the caller, not a runtime condition.
    pub fn cache_data(&self, stripe: &Arc<Stripe>) -> Result<()> {
        let inner = &self.inner;
        let record = stripe.to_record(true);
        assert!(record.page_bitmap != 0, "cache_data on a clean stripe");

        let mut state = inner.admission_lock()?;
        assert_eq!(
            stripe.state_kind(),
            StateKind::Caching,
            "cache_data on a non-caching stripe"
        );
        assert!(
            state.cache.contains(stripe),
            "cache_data on a stripe that was never admitted"
        );

        if !state.ring.fits(state.builder.blocks_with(&record)) {
            inner.retries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            drop(state);
            inner.notify_worker();
            return Err(Error::Retry);
        }
        state.builder.push(Arc::clone(stripe), record);
        inner
            .stripes_logged
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if !state.builder.has_room(inner.config.max_batch_stripes) {
            let outcome = inner.close_window_locked(&mut state);
            drop(state);
            let _ = inner.run_window_callouts(outcome);
        }
        Ok(())
    }

    /// Force one cached stripe out of cache mode and into the normal
    /// write-out path (error handling, explicit flush). Panics if the
    /// stripe is not caching.
    pub fn begin_write_out(&self, stripe: &Arc<Stripe>) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        assert_eq!(
            stripe.state_kind(),
            StateKind::Caching,
            "begin_write_out on a non-caching stripe"
        );
        let outcome = inner.start_write_out_locked(&mut state, vec![Arc::clone(stripe)]);
        drop(state);
        let _ = inner.run_window_callouts(outcome);
        inner.notify_worker();
    }

    /// Completion of a cached stripe's array write: leaves the cache,
    /// releases its scratch page, and lets its journal records be
    /// reclaimed. Equivalent to [`Log::stripe_write_finished`] restricted
    /// to cached stripes.
    pub fn finish_write_out(&self, stripe: &Arc<Stripe>) {
        assert_eq!(
            stripe.state_kind(),
            StateKind::WriteOut,
            "finish_write_out on a stripe that is not writing out"
        );
        self.inner.complete_stripe(stripe);
    }

    /// Proactively drain up to `max` cached stripes, oldest journal
    /// record first. Returns how many write-outs were started.
    pub fn flush_cache(&self, max: usize) -> usize {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let victims = state.cache.caching_stripes(max);
        if victims.is_empty() {
            return 0;
        }
        let started = victims.len();
        let outcome = inner.start_write_out_locked(&mut state, victims);
        drop(state);
        let _ = inner.run_window_callouts(outcome);
        inner.notify_worker();
        debug!(started, "cache drain started");
        started
    }

    /// Enforce the occupancy watermarks: crossing the high watermark
    /// drains oldest-first down to the low watermark. Run periodically by
    /// the reclaim worker.
    pub fn check_cache_usage(&self) {
        self.inner.check_cache_usage();
    }

    /// Opportunistically write out fully dirty cached stripes: they need
    /// no pre-image read, so they are the cheapest way to free cache and
    /// journal space. Run periodically by the reclaim worker.
    pub fn check_cached_full_stripe(&self) {
        self.inner.check_cached_full_stripe();
    }

    /// Whether the big stripe enclosing `sector` currently has any cached
    /// sub-stripe. While true, reads of that region must be served from
    /// the cache; the array copy may be stale.
    pub fn big_stripe_cached(&self, sector: u64) -> bool {
        let big = self.inner.geometry.big_stripe_index(sector);
        self.inner.state.lock().cache.big_cached(big)
    }
}

impl LogInner {
    pub(crate) fn check_cache_usage(&self) {
        let mut state = self.state.lock();
        if state.quiesced {
            return;
        }
        let len = state.cache.len();
        if len < self.config.cache.high_water_stripes() {
            return;
        }
        let target = len.saturating_sub(self.config.cache.low_water_stripes());
        let victims = state.cache.caching_stripes(target);
        if victims.is_empty() {
            return;
        }
        info!(
            occupancy = len,
            draining = victims.len(),
            "cache above high watermark"
        );
        let outcome = self.start_write_out_locked(&mut state, victims);
        drop(state);
        let _ = self.run_window_callouts(outcome);
        self.notify_worker();
    }

    pub(crate) fn check_cached_full_stripe(&self) {
        let mut state = self.state.lock();
        if state.quiesced {
            return;
        }
        let victims = state.cache.full_caching_stripes();
        if victims.is_empty() {
            return;
        }
        debug!(count = victims.len(), "writing out fully dirty cached stripes");
        let outcome = self.start_write_out_locked(&mut state, victims);
        drop(state);
        let _ = self.run_window_callouts(outcome);
        self.notify_worker();
    }

    /// Cached stripes pin the log head: when the ring runs low they must
    /// drain even though cache occupancy is under the watermark, or
    /// writers would see `Retry` forever.
    pub(crate) fn check_ring_pressure(&self) {
        let mut state = self.state.lock();
        if state.quiesced {
            return;
        }
        if state.ring.free_blocks() >= 2 * state.ring.reserve_blocks() {
            return;
        }
        let victims = state.cache.caching_stripes(8);
        if victims.is_empty() {
            return;
        }
        debug!(
            free = state.ring.free_blocks(),
            draining = victims.len(),
            "ring pressure: draining head-pinning cached stripes"
        );
        let outcome = self.start_write_out_locked(&mut state, victims);
        drop(state);
        let _ = self.run_window_callouts(outcome);
        self.notify_worker();
    }
}
