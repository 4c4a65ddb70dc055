//! The log device manager
//!
//! One [`Log`] fronts one array. Stripe writes are made durable on the
//! journal device before the parity engine touches member disks; in
//! write-back mode the journal additionally acts as the backing store for
//! the stripe cache. A single append lock orders all tail advancement (the
//! IO-unit batcher exists to keep contention on it low); the reclaim worker
//! advances the head strictly in submission order.
//!
//! Locking: the append lock (`LogState`) is always taken before any
//! per-stripe lock, and no `ParityArray` method is invoked while it is
//! held. State mutation happens in `*_locked` methods; the resulting
//! call-outs run after the guard is dropped.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use stripecache_common::{
    BLOCK_SIZE, Checksum, Error, FlushStatus, JournalConfig, JournalMode, Result,
};

use crate::array::{ArrayGeometry, ParityArray};
use crate::batch::{InflightUnit, IoUnitBuilder};
use crate::cache::CacheState;
use crate::device::{AlignedBuffer, JournalDevice};
use crate::format::Superblock;
use crate::reclaim::{self, WorkerMsg};
use crate::recovery;
use crate::ring::RingState;
use crate::stripe::{StateKind, Stripe};

/// Counters exposed by [`Log::stats`]
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    /// Stripe records accepted into the journal
    pub stripes_logged: u64,
    /// IO units submitted to the device
    pub io_units: u64,
    /// Ring blocks written (meta + data)
    pub blocks_written: u64,
    /// Writes refused with `Retry` for lack of space
    pub retries: u64,
    /// IO units reclaimed
    pub units_reclaimed: u64,
    /// Records recovered at start-up
    pub records_replayed: u64,
    /// Stripes currently resident in the write-back cache
    pub cached_stripes: usize,
    /// Live ring blocks
    pub used_blocks: u64,
    /// Free ring blocks (including the reserve)
    pub free_blocks: u64,
}

/// Mutable state behind the global append lock
pub(crate) struct LogState {
    pub(crate) ring: RingState,
    pub(crate) builder: IoUnitBuilder,
    pub(crate) inflight: std::collections::VecDeque<InflightUnit>,
    pub(crate) writeout_queue: std::collections::VecDeque<Arc<Stripe>>,
    pub(crate) cache: CacheState,
    pub(crate) mode: JournalMode,
    pub(crate) quiesced: bool,
    /// Member-device error demoted the array out of write-back mode
    pub(crate) caching_disabled: bool,
    /// Logical head position when the superblock was last persisted
    pub(crate) persisted_head: u64,
}

/// What a closed batching window leaves to do once the lock is dropped
pub(crate) enum WindowOutcome {
    /// Nothing was open
    Empty,
    /// The unit is durable; notify the array that these stripes are logged
    Flushed(Vec<Arc<Stripe>>),
    /// The device died; these stripes must be re-driven unlogged
    Failed(Vec<Arc<Stripe>>),
}

pub(crate) struct LogInner {
    pub(crate) device: JournalDevice,
    pub(crate) log_id: u64,
    pub(crate) config: JournalConfig,
    pub(crate) geometry: ArrayGeometry,
    pub(crate) array: Arc<dyn ParityArray>,
    pub(crate) state: Mutex<LogState>,
    pub(crate) cond: Condvar,
    pub(crate) failed: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) worker_tx: crossbeam_channel::Sender<WorkerMsg>,
    // counters
    pub(crate) stripes_logged: AtomicU64,
    pub(crate) io_units: AtomicU64,
    pub(crate) blocks_written: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) units_reclaimed: AtomicU64,
    pub(crate) records_replayed: AtomicU64,
}

/// The journal/cache engine for one array.
///
/// The array's context holds an `Option<Log>`; a `None` there means "no
/// journal configured, handle stripes directly".
pub struct Log {
    pub(crate) inner: Arc<LogInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Log {
    /// Open (or format) the journal device, replay any committed records
    /// through `array`, and start the reclaim worker.
    ///
    /// Fails with `NotReady` when the device cannot be read or is too
    /// small. A corrupt superblock or a torn tail record is not fatal:
    /// torn writes only need to be detected, so the log degrades to
    /// formatting itself empty (with a warning) rather than refusing to
    /// start.
    pub fn init(
        path: impl AsRef<Path>,
        array: Arc<dyn ParityArray>,
        geometry: ArrayGeometry,
        config: JournalConfig,
    ) -> Result<Log> {
        config.validate()?;
        geometry.validate()?;

        let device = JournalDevice::open(
            &path,
            config.create_blocks.map(|b| b * BLOCK_SIZE as u64),
            config.direct_io,
        )?;

        let reserve = ((device.ring_blocks() as f64 * config.reserve_fraction).ceil() as u64).max(1);
        let widest_unit = 1 + geometry.pages_per_stripe as u64;
        if device.ring_blocks() < reserve + widest_unit {
            return Err(Error::not_ready(format!(
                "ring of {} blocks cannot hold a full-stripe unit plus the {}-block reserve",
                device.ring_blocks(),
                reserve
            )));
        }

        let super_buf = device.read_blocks(0, 1)?;
        let (superblock, replayed) = match Superblock::decode(super_buf.as_slice()) {
            Ok(sb) if sb.ring_blocks == device.ring_blocks() => {
                let outcome = recovery::replay(&device, &sb, array.as_ref())?;
                info!(
                    device = device.path(),
                    replayed = outcome.records,
                    next_seq = outcome.next_seq,
                    "journal recovery complete"
                );
                let sb = Superblock {
                    log_id: sb.log_id,
                    seq: outcome.next_seq,
                    head_pos: outcome.next_phys,
                    ring_blocks: device.ring_blocks(),
                };
                (sb, outcome.records)
            }
            Ok(sb) => {
                warn!(
                    device = device.path(),
                    recorded = sb.ring_blocks,
                    actual = device.ring_blocks(),
                    "superblock ring size disagrees with device, formatting empty log"
                );
                (
                    Superblock::format(generate_log_id(&path), device.ring_blocks()),
                    0,
                )
            }
            Err(_) if super_buf.as_slice().iter().all(|&b| b == 0) => {
                info!(device = device.path(), "formatting new journal");
                (
                    Superblock::format(generate_log_id(&path), device.ring_blocks()),
                    0,
                )
            }
            Err(e) => {
                warn!(
                    device = device.path(),
                    error = %e,
                    "corrupt superblock, formatting empty log"
                );
                (
                    Superblock::format(generate_log_id(&path), device.ring_blocks()),
                    0,
                )
            }
        };

        let mut sb_buf = AlignedBuffer::blocks(1);
        sb_buf.copy_from(&superblock.encode());
        device.write_blocks(0, sb_buf.as_slice())?;
        device.sync()?;

        let ring = RingState::new(
            device.ring_blocks(),
            config.reserve_fraction,
            superblock.head_pos,
            superblock.seq,
        );
        let start_logical = ring.head_logical();

        let (worker_tx, worker_rx) = crossbeam_channel::unbounded();
        let cache = CacheState::new(config.cache.capacity_stripes);
        let mode = config.mode;

        let inner = Arc::new(LogInner {
            device,
            log_id: superblock.log_id,
            config,
            geometry,
            array,
            state: Mutex::new(LogState {
                ring,
                builder: IoUnitBuilder::new(),
                inflight: std::collections::VecDeque::new(),
                writeout_queue: std::collections::VecDeque::new(),
                cache,
                mode,
                quiesced: false,
                caching_disabled: false,
                persisted_head: start_logical,
            }),
            cond: Condvar::new(),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker_tx,
            stripes_logged: AtomicU64::new(0),
            io_units: AtomicU64::new(0),
            blocks_written: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            units_reclaimed: AtomicU64::new(0),
            records_replayed: AtomicU64::new(replayed as u64),
        });

        let worker = reclaim::spawn(Arc::clone(&inner), worker_rx);

        Ok(Log {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Request durability for one stripe's pending write.
    ///
    /// `Err(Retry)` signals back-pressure: free journal space is below the
    /// reserve and the caller should resubmit after reclaim makes
    /// progress. `Err(AlreadyCaching)` means the stripe still owns a live
    /// journal record and must drain first. `Err(JournalFailed)` means the
    /// journal device is dead and the caller must fall back to direct,
    /// unlogged writes.
    pub fn write_stripe(&self, stripe: &Arc<Stripe>) -> Result<()> {
        let inner = &self.inner;
        let record = stripe.to_record(false);
        assert!(record.page_bitmap != 0, "write_stripe on a clean stripe");

        let mut state = inner.admission_lock()?;
        if !state.ring.fits(state.builder.blocks_with(&record)) {
            inner.retries.fetch_add(1, Ordering::Relaxed);
            drop(state);
            inner.notify_worker();
            return Err(Error::Retry);
        }
        stripe.trap_in_journal()?;
        state.builder.push(Arc::clone(stripe), record);
        inner.stripes_logged.fetch_add(1, Ordering::Relaxed);

        if !state.builder.has_room(inner.config.max_batch_stripes) {
            // Window is full: close it now rather than waiting for the tick.
            let outcome = inner.close_window_locked(&mut state);
            drop(state);
            let _ = inner.run_window_callouts(outcome);
        }
        Ok(())
    }

    /// Close the batching window immediately (fire-and-forget). Used by
    /// callers that just queued writes and have nothing further to batch.
    pub fn submit_pending(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.quiesced {
            return;
        }
        let outcome = inner.close_window_locked(&mut state);
        drop(state);
        let _ = inner.run_window_callouts(outcome);
    }

    /// Barrier: once this returns, everything accepted before the call is
    /// durable on the journal device.
    pub fn handle_flush_request(&self) -> Result<FlushStatus> {
        let inner = &self.inner;
        if inner.failed.load(Ordering::Acquire) {
            return Err(Error::JournalFailed);
        }
        let mut state = inner.state.lock();
        while state.quiesced {
            inner.cond.wait(&mut state);
        }
        let outcome = inner.close_window_locked(&mut state);
        drop(state);
        inner.run_window_callouts(outcome)
    }

    /// Blocking full drain: push every logged and cached stripe through to
    /// the array and return once the log holds no live records. Used
    /// before operations that need a fully consistent on-array state
    /// (reshape, stop).
    pub fn flush_to_array(&self) -> Result<()> {
        let inner = &self.inner;
        loop {
            if inner.failed.load(Ordering::Acquire) {
                return Err(Error::JournalFailed);
            }
            let mut state = inner.state.lock();
            if !state.builder.is_empty() && !state.quiesced {
                let outcome = inner.close_window_locked(&mut state);
                drop(state);
                let _ = inner.run_window_callouts(outcome);
                continue;
            }
            let stuck = state.cache.caching_stripes(usize::MAX);
            if !stuck.is_empty() {
                let outcome = inner.start_write_out_locked(&mut state, stuck);
                drop(state);
                let _ = inner.run_window_callouts(outcome);
                inner.notify_worker();
                continue;
            }
            if state.inflight.is_empty()
                && state.writeout_queue.is_empty()
                && state.cache.is_empty()
                && state.builder.is_empty()
            {
                return Ok(());
            }
            inner.notify_worker();
            inner.cond.wait(&mut state);
        }
    }

    /// Completion notification from the parity engine: the stripe's data is
    /// durably applied to the array. Must be called exactly once per
    /// applied write; calling it for a stripe with no outstanding write is
    /// a caller bug and panics.
    pub fn stripe_write_finished(&self, stripe: &Arc<Stripe>) {
        self.inner.complete_stripe(stripe);
    }

    /// Whether the journal device has failed. Once true the array must
    /// run unlogged; the flag never clears for the life of this `Log`.
    pub fn disk_error(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Suspend all log activity. Returns once in-flight journal I/O has
    /// completed; from then until [`Log::resume`], producers block.
    pub fn quiesce(&self) {
        let inner = &self.inner;
        loop {
            let mut state = inner.state.lock();
            if state.quiesced {
                return;
            }
            if state.builder.is_empty() {
                state.quiesced = true;
                info!("journal quiesced");
                return;
            }
            let outcome = inner.close_window_locked(&mut state);
            drop(state);
            let _ = inner.run_window_callouts(outcome);
        }
    }

    /// Resume normal operation after [`Log::quiesce`]
    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        if state.quiesced {
            state.quiesced = false;
            info!("journal resumed");
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Current journal mode
    pub fn mode(&self) -> JournalMode {
        self.inner.state.lock().mode
    }

    /// Whether write-back caching is currently effective (configured,
    /// not demoted by a member error, journal healthy)
    pub fn is_writeback(&self) -> bool {
        if self.inner.failed.load(Ordering::Acquire) {
            return false;
        }
        let state = self.inner.state.lock();
        state.mode.is_writeback() && !state.caching_disabled
    }

    /// Switch journal mode. Leaving write-back requires an empty cache:
    /// drain with [`Log::flush_to_array`] first.
    pub fn set_mode(&self, mode: JournalMode) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.mode == mode {
            return Ok(());
        }
        match mode {
            JournalMode::WriteThrough => {
                let cached = state.cache.len();
                if cached > 0 {
                    return Err(Error::CacheNotEmpty { cached });
                }
                state.mode = JournalMode::WriteThrough;
            }
            JournalMode::WriteBack => {
                if inner.failed.load(Ordering::Acquire) {
                    return Err(Error::JournalFailed);
                }
                state.mode = JournalMode::WriteBack;
                state.caching_disabled = false;
            }
        }
        info!(mode = %mode, "journal mode changed");
        Ok(())
    }

    /// A member device of the array has failed. Cached data can no longer
    /// be reconciled safely, so write-back admission stops immediately and
    /// every cached stripe is pushed out through the normal path.
    pub fn member_disk_error(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.mode.is_writeback() || state.caching_disabled {
            return;
        }
        state.caching_disabled = true;
        let cached = state.cache.caching_stripes(usize::MAX);
        warn!(
            cached = cached.len(),
            "member device error: demoting out of write-back mode"
        );
        let outcome = inner.start_write_out_locked(&mut state, cached);
        drop(state);
        let _ = inner.run_window_callouts(outcome);
        inner.notify_worker();
    }

    /// Counters snapshot
    pub fn stats(&self) -> LogStats {
        let inner = &self.inner;
        let state = inner.state.lock();
        LogStats {
            stripes_logged: inner.stripes_logged.load(Ordering::Relaxed),
            io_units: inner.io_units.load(Ordering::Relaxed),
            blocks_written: inner.blocks_written.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            units_reclaimed: inner.units_reclaimed.load(Ordering::Relaxed),
            records_replayed: inner.records_replayed.load(Ordering::Relaxed),
            cached_stripes: state.cache.len(),
            used_blocks: state.ring.used_blocks(),
            free_blocks: state.ring.free_blocks(),
        }
    }

    /// Failure-injection hook for crash and error testing: while armed,
    /// journal writes fail as if the device had died.
    pub fn inject_device_fault(&self, on: bool) {
        self.inner.device.set_write_fault(on);
    }

    /// Drain outstanding work, stop the reclaim worker, and persist the
    /// superblock. Idempotent; also invoked best-effort from `Drop`.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // A quiesced log cannot drain.
        self.resume();
        if !inner.failed.load(Ordering::Acquire) {
            if let Err(e) = self.flush_to_array() {
                warn!(error = %e, "drain during shutdown failed");
            }
        }
        let _ = inner.worker_tx.send(WorkerMsg::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        if !inner.failed.load(Ordering::Acquire) {
            let mut state = inner.state.lock();
            inner.persist_superblock(&mut state);
        }
        info!(device = inner.device.path(), "journal shut down");
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LogInner {
    /// Take the append lock for a new record, honoring quiesce and the
    /// sticky failure/shutdown flags.
    pub(crate) fn admission_lock(&self) -> Result<MutexGuard<'_, LogState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::not_ready("log is shut down"));
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::JournalFailed);
        }
        let mut state = self.state.lock();
        while state.quiesced {
            self.cond.wait(&mut state);
            if self.failed.load(Ordering::Acquire) {
                return Err(Error::JournalFailed);
            }
        }
        Ok(state)
    }

    /// Close the open IO unit: write it to the ring and make it durable.
    /// The append lock is held across the device I/O; that is what makes
    /// sequence numbers become durable in order. Call-outs implied by the
    /// returned outcome run in [`LogInner::run_window_callouts`] once the
    /// caller has released the lock.
    pub(crate) fn close_window_locked(&self, state: &mut LogState) -> WindowOutcome {
        if state.builder.is_empty() {
            return WindowOutcome::Empty;
        }
        let blocks = state.builder.total_blocks();
        let (start, seq) = state
            .ring
            .append(blocks)
            .expect("space was reserved at enqueue time");
        let meta_phys = self.device.ring_to_phys(start);
        let (buf, entries) = state.builder.take(self.log_id, seq, meta_phys);

        let io = self
            .device
            .write_ring(start, buf.as_slice())
            .and_then(|()| self.device.sync());

        match io {
            Ok(()) => {
                let stripes: Vec<Arc<Stripe>> =
                    entries.iter().map(|e| Arc::clone(&e.stripe)).collect();
                for entry in &entries {
                    if !entry.record.cached {
                        state.writeout_queue.push_back(Arc::clone(&entry.stripe));
                    }
                }
                state
                    .inflight
                    .push_back(InflightUnit::new(seq, start, blocks, entries));
                self.io_units.fetch_add(1, Ordering::Relaxed);
                self.blocks_written.fetch_add(blocks, Ordering::Relaxed);
                debug!(seq, blocks, entries = stripes.len(), "IO unit submitted");
                WindowOutcome::Flushed(stripes)
            }
            Err(e) => {
                error!(error = %e, "journal write failed, disabling logging");
                self.failed.store(true, Ordering::Release);
                let mut stripes = Vec::with_capacity(entries.len());
                for entry in entries {
                    if entry.record.cached {
                        state
                            .cache
                            .remove(&entry.stripe, self.geometry.big_stripe_sectors);
                    }
                    entry.stripe.force_clean();
                    stripes.push(entry.stripe);
                }
                WindowOutcome::Failed(stripes)
            }
        }
    }

    /// Deliver the notifications a closed window owes. Must be called
    /// without the append lock held.
    pub(crate) fn run_window_callouts(&self, outcome: WindowOutcome) -> Result<FlushStatus> {
        match outcome {
            WindowOutcome::Empty => Ok(FlushStatus::Empty),
            WindowOutcome::Flushed(stripes) => {
                self.notify_worker();
                for stripe in &stripes {
                    self.array.stripe_logged(stripe);
                }
                Ok(FlushStatus::Flushed)
            }
            WindowOutcome::Failed(stripes) => {
                self.cond.notify_all();
                for stripe in &stripes {
                    self.array.resubmit_unlogged(stripe);
                }
                Err(Error::JournalFailed)
            }
        }
    }

    /// Push cached stripes into write-out. Closes the open window first so
    /// no record of these stripes is still batched when the array reports
    /// completion: a completion arriving before its unit is in flight would
    /// leave that unit unreclaimable.
    pub(crate) fn start_write_out_locked(
        &self,
        state: &mut LogState,
        stripes: Vec<Arc<Stripe>>,
    ) -> WindowOutcome {
        let outcome = self.close_window_locked(state);
        for stripe in stripes {
            // The window close may have force-cleaned the stripe on device
            // failure; only transition the ones that are still caching.
            if stripe.state_kind() == StateKind::Caching {
                stripe.begin_write_out();
                state.writeout_queue.push_back(stripe);
            }
        }
        outcome
    }

    /// Array-apply completion for one stripe: retire its journal records
    /// and reclaim whatever prefix of the ring became dead.
    pub(crate) fn complete_stripe(&self, stripe: &Arc<Stripe>) {
        let mut state = self.state.lock();
        match stripe.state_kind() {
            StateKind::InJournal => stripe.finish_journal_write(),
            StateKind::WriteOut => {
                stripe.finish_write_out();
                state.cache.remove(stripe, self.geometry.big_stripe_sectors);
            }
            other => panic!(
                "stripe_write_finished for stripe {} in state {:?}",
                stripe.sector(),
                other
            ),
        }
        for unit in state.inflight.iter_mut() {
            unit.mark_finished(stripe);
        }
        self.try_reclaim(&mut state);
        drop(state);
        self.cond.notify_all();
    }

    /// Pop fully-applied units off the front of the in-flight queue,
    /// strictly in sequence order, and persist the superblock once the
    /// head has moved far enough.
    pub(crate) fn try_reclaim(&self, state: &mut LogState) {
        let mut freed = 0;
        while let Some(front) = state.inflight.front() {
            if !front.is_complete() {
                break;
            }
            let unit = state.inflight.pop_front().unwrap();
            state.ring.reclaim(unit.seq, unit.blocks);
            self.units_reclaimed.fetch_add(1, Ordering::Relaxed);
            freed += unit.blocks;
        }
        if freed == 0 {
            return;
        }
        debug!(
            freed,
            head_seq = state.ring.head_seq(),
            "reclaimed journal space"
        );
        let advance = state.ring.head_logical() - state.persisted_head;
        if state.inflight.is_empty() || advance >= self.config.checkpoint_interval_blocks {
            self.persist_superblock(state);
        }
    }

    /// Rewrite the superblock to point recovery at the current head
    pub(crate) fn persist_superblock(&self, state: &mut LogState) {
        let sb = Superblock {
            log_id: self.log_id,
            seq: state.ring.head_seq(),
            head_pos: state.ring.head_phys(),
            ring_blocks: self.device.ring_blocks(),
        };
        let mut buf = AlignedBuffer::blocks(1);
        buf.copy_from(&sb.encode());
        let io = self
            .device
            .write_blocks(0, buf.as_slice())
            .and_then(|()| self.device.sync());
        match io {
            Ok(()) => state.persisted_head = state.ring.head_logical(),
            Err(e) => {
                warn!(error = %e, "superblock write failed, disabling logging");
                self.failed.store(true, Ordering::Release);
            }
        }
    }

    pub(crate) fn notify_worker(&self) {
        let _ = self.worker_tx.send(WorkerMsg::Wake);
    }
}

/// Log instance identity: embedded in every metadata block so replay can
/// tell this log's records from whatever a previous tenant left on the
/// device. Never zero.
fn generate_log_id(path: &impl AsRef<Path>) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let path_hash = Checksum::compute(path.as_ref().to_string_lossy().as_bytes()).xxhash64;
    (nanos ^ path_hash.rotate_left(32)) | 1
}
