//! Per-stripe state shared with the parity engine
//!
//! A [`Stripe`] is the durability unit: one row of data pages headed for the
//! array. The parity engine owns stripe lifecycle; this subsystem drives the
//! stripe's journal/cache status through a tagged state machine so every
//! transition is spelled out in one place. A caller that breaks the protocol
//! (double finish, caching a stripe that is mid-drain) panics: that is a bug
//! in the caller's state machine, not a runtime condition.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use stripecache_common::{CacheAdmission, Error, PAGE_SIZE, Result, SECTORS_PER_PAGE};

/// Journal/cache status of one stripe.
///
/// ```text
/// write-through:  Clean -> InJournal -> Clean
/// write-back:     Clean -> Caching -> WriteOut -> Clean
/// ```
///
/// There is no `Caching -> Clean` shortcut: every cached write must reach
/// the array through `WriteOut` first.
#[derive(Debug)]
pub enum StripeState {
    /// No live journal record
    Clean,
    /// Logged (or queued for logging); the array write follows as soon as
    /// the record is durable
    InJournal,
    /// Resident in the write-back cache; the array write is deferred.
    /// Partial writes hold a scratch page for pre-image reconstruction.
    Caching { extra_page: Option<ExtraPage> },
    /// Being drained to the array
    WriteOut { extra_page: Option<ExtraPage> },
}

/// Discriminant-only view of [`StripeState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Clean,
    InJournal,
    Caching,
    WriteOut,
}

/// Dirty data staged on a stripe
#[derive(Debug, Default)]
struct StripeData {
    bitmap: u64,
    pages: Vec<Option<Bytes>>,
}

/// One RAID stripe's journal-facing handle. Identity is the `Arc` pointer:
/// the same sector can be represented by a new `Stripe` after a full
/// clean/reuse cycle in the parity engine.
pub struct Stripe {
    sector: u64,
    page_count: usize,
    state: Mutex<StripeState>,
    data: Mutex<StripeData>,
}

impl Stripe {
    /// Create a clean stripe covering `page_count` data pages starting at
    /// array sector `sector`.
    pub fn new(sector: u64, page_count: usize) -> Arc<Self> {
        assert!(page_count > 0 && page_count <= 64, "invalid stripe width");
        Arc::new(Self {
            sector,
            page_count,
            state: Mutex::new(StripeState::Clean),
            data: Mutex::new(StripeData {
                bitmap: 0,
                pages: vec![None; page_count],
            }),
        })
    }

    /// Stripe start sector on the array
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Data pages per stripe row
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Sectors covered by this stripe's data pages
    pub fn sectors(&self) -> u64 {
        self.page_count as u64 * SECTORS_PER_PAGE
    }

    /// Stage dirty data for page `index`
    pub fn stage_page(&self, index: usize, data: Bytes) {
        assert!(index < self.page_count, "page index out of range");
        assert_eq!(data.len(), PAGE_SIZE, "stripe pages are fixed-size");
        let mut inner = self.data.lock();
        inner.bitmap |= 1 << index;
        inner.pages[index] = Some(data);
    }

    /// Dirty-page bitmap
    pub fn dirty_bitmap(&self) -> u64 {
        self.data.lock().bitmap
    }

    /// Whether every page of the row is dirty (a full-stripe write)
    pub fn is_full_write(&self) -> bool {
        let inner = self.data.lock();
        inner.bitmap.count_ones() as usize == self.page_count
    }

    /// Read back one staged page, if dirty
    pub fn page(&self, index: usize) -> Option<Bytes> {
        self.data.lock().pages.get(index).cloned().flatten()
    }

    /// Snapshot the staged dirty data as a logged record
    pub fn to_record(&self, cached: bool) -> StripeRecord {
        let inner = self.data.lock();
        let mut pages = Vec::with_capacity(inner.bitmap.count_ones() as usize);
        for index in 0..self.page_count {
            if inner.bitmap & (1 << index) != 0 {
                let page = inner.pages[index]
                    .clone()
                    .expect("dirty bitmap bit without staged page");
                pages.push(page);
            }
        }
        StripeRecord {
            sector: self.sector,
            page_bitmap: inner.bitmap,
            pages,
            cached,
        }
    }

    /// Current state discriminant
    pub fn state_kind(&self) -> StateKind {
        match *self.state.lock() {
            StripeState::Clean => StateKind::Clean,
            StripeState::InJournal => StateKind::InJournal,
            StripeState::Caching { .. } => StateKind::Caching,
            StripeState::WriteOut { .. } => StateKind::WriteOut,
        }
    }

    /// `Clean -> InJournal`. Any other starting state means the stripe is
    /// still owned by an earlier journal record and must drain first.
    pub(crate) fn trap_in_journal(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            StripeState::Clean => {
                *state = StripeState::InJournal;
                Ok(())
            }
            _ => Err(Error::AlreadyCaching),
        }
    }

    /// `Clean -> Caching`. Idempotent for stripes already caching.
    pub(crate) fn begin_caching(
        &self,
        acquire_extra: impl FnOnce() -> Option<ExtraPage>,
        needs_extra: bool,
    ) -> Result<CacheAdmission> {
        let mut state = self.state.lock();
        match *state {
            StripeState::Caching { .. } => Ok(CacheAdmission::Accepted),
            StripeState::Clean => {
                let extra_page = if needs_extra {
                    match acquire_extra() {
                        Some(page) => Some(page),
                        // Scratch pool exhausted: decline, caller writes through.
                        None => return Ok(CacheAdmission::Declined),
                    }
                } else {
                    None
                };
                *state = StripeState::Caching { extra_page };
                Ok(CacheAdmission::Accepted)
            }
            _ => Err(Error::AlreadyCaching),
        }
    }

    /// `Caching -> WriteOut`. Panics unless the stripe is caching.
    pub(crate) fn begin_write_out(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, StripeState::Clean) {
            StripeState::Caching { extra_page } => {
                *state = StripeState::WriteOut { extra_page };
            }
            other => panic!(
                "begin_write_out on stripe {} in state {:?}",
                self.sector, other
            ),
        }
    }

    /// `WriteOut -> Clean`, releasing the scratch page. Panics on double
    /// finish.
    pub(crate) fn finish_write_out(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, StripeState::Clean) {
            StripeState::WriteOut { extra_page } => drop(extra_page),
            other => panic!(
                "finish_write_out on stripe {} in state {:?}",
                self.sector, other
            ),
        }
    }

    /// Unconditional reset to `Clean`, releasing any scratch page. Only
    /// used when the journal dies before the stripe's record became
    /// durable and the write is handed back to the direct path.
    pub(crate) fn force_clean(&self) {
        *self.state.lock() = StripeState::Clean;
    }

    /// `InJournal -> Clean`. Panics on double finish.
    pub(crate) fn finish_journal_write(&self) {
        let mut state = self.state.lock();
        match *state {
            StripeState::InJournal => *state = StripeState::Clean,
            ref other => panic!(
                "stripe_write_finished on stripe {} in state {:?}",
                self.sector, other
            ),
        }
    }
}

impl std::fmt::Debug for Stripe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stripe")
            .field("sector", &self.sector)
            .field("state", &self.state_kind())
            .field("bitmap", &format_args!("{:#x}", self.dirty_bitmap()))
            .finish()
    }
}

/// The logged representation of one stripe write: what goes into (and comes
/// back out of) the journal.
#[derive(Debug, Clone)]
pub struct StripeRecord {
    /// Stripe start sector on the array
    pub sector: u64,
    /// Dirty-page bitmap
    pub page_bitmap: u64,
    /// Dirty pages in ascending bit order
    pub pages: Vec<Bytes>,
    /// Whether this record was a write-back cached write
    pub cached: bool,
}

impl StripeRecord {
    /// Number of data pages
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Concatenated data length in bytes
    pub fn data_len(&self) -> usize {
        self.pages.iter().map(Bytes::len).sum()
    }
}

/// Bounded pool of scratch pages used to rebuild pre-image data when a
/// partial cached write is eventually flushed.
pub struct PagePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
}

impl PagePool {
    /// Pool with `capacity` pages
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|_| BytesMut::zeroed(PAGE_SIZE))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
            }),
        }
    }

    /// Take a scratch page, or `None` when the pool is exhausted
    pub fn acquire(&self) -> Option<ExtraPage> {
        let page = self.inner.free.lock().pop()?;
        Some(ExtraPage {
            page,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Pages currently available
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// Guard over one scratch page; returns the page to the pool on drop
pub struct ExtraPage {
    page: BytesMut,
    pool: Arc<PoolInner>,
}

impl ExtraPage {
    /// Scratch contents
    pub fn as_slice(&self) -> &[u8] {
        &self.page
    }

    /// Mutable scratch contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.page
    }
}

impl Drop for ExtraPage {
    fn drop(&mut self) {
        let mut page = std::mem::take(&mut self.page);
        page.clear();
        page.resize(PAGE_SIZE, 0);
        self.pool.free.lock().push(page);
    }
}

impl std::fmt::Debug for ExtraPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtraPage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(byte: u8) -> Bytes {
        Bytes::from(vec![byte; PAGE_SIZE])
    }

    #[test]
    fn test_journal_cycle() {
        let stripe = Stripe::new(128, 4);
        stripe.stage_page(0, page(0xAA));
        stripe.trap_in_journal().unwrap();
        assert_eq!(stripe.state_kind(), StateKind::InJournal);

        // A second write while trapped must be refused, not double-queued.
        assert!(matches!(
            stripe.trap_in_journal(),
            Err(Error::AlreadyCaching)
        ));

        stripe.finish_journal_write();
        assert_eq!(stripe.state_kind(), StateKind::Clean);
    }

    #[test]
    fn test_caching_cycle_releases_extra_page() {
        let pool = PagePool::new(2);
        let stripe = Stripe::new(0, 4);
        stripe.stage_page(1, page(0xBB));

        let admitted = stripe
            .begin_caching(|| pool.acquire(), true)
            .unwrap();
        assert_eq!(admitted, CacheAdmission::Accepted);
        assert_eq!(pool.available(), 1);

        // Idempotent re-admission does not take a second page.
        let again = stripe.begin_caching(|| pool.acquire(), true).unwrap();
        assert_eq!(again, CacheAdmission::Accepted);
        assert_eq!(pool.available(), 1);

        stripe.begin_write_out();
        assert_eq!(stripe.state_kind(), StateKind::WriteOut);
        // Held through write-out: parity reconstruction may still need it.
        assert_eq!(pool.available(), 1);

        stripe.finish_write_out();
        assert_eq!(stripe.state_kind(), StateKind::Clean);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_exhaustion_declines() {
        let pool = PagePool::new(1);
        let held = pool.acquire().unwrap();

        let stripe = Stripe::new(0, 4);
        let admitted = stripe.begin_caching(|| pool.acquire(), true).unwrap();
        assert_eq!(admitted, CacheAdmission::Declined);
        assert_eq!(stripe.state_kind(), StateKind::Clean);

        drop(held);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    #[should_panic(expected = "stripe_write_finished")]
    fn test_double_finish_panics() {
        let stripe = Stripe::new(8, 4);
        stripe.trap_in_journal().unwrap();
        stripe.finish_journal_write();
        stripe.finish_journal_write();
    }

    #[test]
    fn test_record_snapshot_orders_pages() {
        let stripe = Stripe::new(64, 4);
        stripe.stage_page(2, page(0x22));
        stripe.stage_page(0, page(0x00));

        let record = stripe.to_record(false);
        assert_eq!(record.page_bitmap, 0b101);
        assert_eq!(record.page_count(), 2);
        assert_eq!(record.pages[0][0], 0x00);
        assert_eq!(record.pages[1][0], 0x22);
        assert_eq!(record.data_len(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_full_write_detection() {
        let stripe = Stripe::new(0, 2);
        stripe.stage_page(0, page(1));
        assert!(!stripe.is_full_write());
        stripe.stage_page(1, page(2));
        assert!(stripe.is_full_write());
    }
}
