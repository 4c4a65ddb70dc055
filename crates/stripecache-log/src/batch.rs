//! IO-unit batching
//!
//! Stripe writes arriving inside one batching window are coalesced into a
//! single physical journal write: one metadata block followed by every
//! stripe's dirty pages. The open unit lives under the global append lock;
//! it is closed when full, on an explicit run/flush trigger, or when the
//! reclaim worker notices the window has aged out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stripecache_common::{BLOCK_SIZE, ChecksumCalculator};

use crate::device::AlignedBuffer;
use crate::format::{MAX_META_ENTRIES, MetaBlock, StripeDescriptor};
use crate::stripe::{Stripe, StripeRecord};

/// One stripe queued into the open IO unit
pub struct PendingEntry {
    pub stripe: Arc<Stripe>,
    pub record: StripeRecord,
}

/// The open (not yet submitted) IO unit
pub struct IoUnitBuilder {
    entries: Vec<PendingEntry>,
    data_blocks: u64,
    opened_at: Option<Instant>,
}

impl IoUnitBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            data_blocks: 0,
            opened_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Blocks this unit would occupy on the ring if submitted now
    pub fn total_blocks(&self) -> u64 {
        if self.entries.is_empty() {
            0
        } else {
            1 + self.data_blocks
        }
    }

    /// Blocks the unit would occupy with one more record appended
    pub fn blocks_with(&self, record: &StripeRecord) -> u64 {
        1 + self.data_blocks + record.page_count() as u64
    }

    /// Whether another record still fits under the entry cap
    pub fn has_room(&self, max_batch: usize) -> bool {
        self.entries.len() < max_batch.min(MAX_META_ENTRIES)
    }

    /// Age of the oldest queued record
    pub fn age(&self) -> Option<Duration> {
        self.opened_at.map(|t| t.elapsed())
    }

    /// Queue one stripe record
    pub fn push(&mut self, stripe: Arc<Stripe>, record: StripeRecord) {
        assert!(self.entries.len() < MAX_META_ENTRIES, "IO unit overflow");
        if self.entries.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.data_blocks += record.page_count() as u64;
        self.entries.push(PendingEntry { stripe, record });
    }

    /// Close the unit: serialize the metadata block and data pages into one
    /// ring-ready buffer and hand back the entries for in-flight tracking.
    /// The builder is left empty.
    pub fn take(&mut self, log_id: u64, seq: u64, meta_phys: u64) -> (AlignedBuffer, Vec<PendingEntry>) {
        assert!(!self.entries.is_empty(), "closing an empty IO unit");

        let entries = std::mem::take(&mut self.entries);
        let data_blocks = std::mem::replace(&mut self.data_blocks, 0);
        self.opened_at = None;

        let mut meta = MetaBlock::new(log_id, seq, meta_phys);
        for entry in &entries {
            let mut calc = ChecksumCalculator::new();
            for page in &entry.record.pages {
                calc.update(page);
            }
            meta.entries.push(StripeDescriptor {
                sector: entry.record.sector,
                page_bitmap: entry.record.page_bitmap,
                cached: entry.record.cached,
                data_checksum: calc.finalize(),
            });
        }

        let mut buf = AlignedBuffer::blocks(1 + data_blocks as usize);
        let out = buf.as_mut_slice();
        out[..BLOCK_SIZE].copy_from_slice(&meta.encode());

        let mut off = BLOCK_SIZE;
        for entry in &entries {
            for page in &entry.record.pages {
                out[off..off + page.len()].copy_from_slice(page);
                off += page.len();
            }
        }
        debug_assert_eq!(off, (1 + data_blocks as usize) * BLOCK_SIZE);

        (buf, entries)
    }
}

impl Default for IoUnitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A submitted IO unit whose records are durable in the journal but not yet
/// all applied to the array. Units are reclaimed strictly in order.
pub struct InflightUnit {
    pub seq: u64,
    pub start_logical: u64,
    pub blocks: u64,
    entries: Vec<InflightEntry>,
}

struct InflightEntry {
    stripe: Arc<Stripe>,
    done: bool,
}

impl InflightUnit {
    pub fn new(seq: u64, start_logical: u64, blocks: u64, entries: Vec<PendingEntry>) -> Self {
        Self {
            seq,
            start_logical,
            blocks,
            entries: entries
                .into_iter()
                .map(|e| InflightEntry {
                    stripe: e.stripe,
                    done: false,
                })
                .collect(),
        }
    }

    /// Mark every live entry for `stripe` as applied. One array write-out
    /// covers all earlier journal copies of the same stripe, so a single
    /// completion retires them all. Returns whether anything was marked.
    pub fn mark_finished(&mut self, stripe: &Arc<Stripe>) -> bool {
        let mut marked = false;
        for entry in &mut self.entries {
            if !entry.done && Arc::ptr_eq(&entry.stripe, stripe) {
                entry.done = true;
                marked = true;
            }
        }
        marked
    }

    /// Whether every record in this unit has been applied to the array
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.done)
    }

    /// Records not yet applied
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.done).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stripecache_common::PAGE_SIZE;

    fn staged_stripe(sector: u64, pages: &[usize]) -> Arc<Stripe> {
        let stripe = Stripe::new(sector, 8);
        for &p in pages {
            stripe.stage_page(p, Bytes::from(vec![p as u8 + 1; PAGE_SIZE]));
        }
        stripe
    }

    #[test]
    fn test_builder_accumulates_blocks() {
        let mut builder = IoUnitBuilder::new();
        assert_eq!(builder.total_blocks(), 0);

        let s1 = staged_stripe(0, &[0, 1]);
        builder.push(Arc::clone(&s1), s1.to_record(false));
        let s2 = staged_stripe(64, &[3]);
        builder.push(Arc::clone(&s2), s2.to_record(false));

        assert_eq!(builder.len(), 2);
        assert_eq!(builder.total_blocks(), 1 + 3);
        assert!(builder.age().is_some());
    }

    #[test]
    fn test_take_produces_decodable_unit() {
        let mut builder = IoUnitBuilder::new();
        let s1 = staged_stripe(0, &[0, 2]);
        builder.push(Arc::clone(&s1), s1.to_record(false));
        let s2 = staged_stripe(64, &[1]);
        builder.push(Arc::clone(&s2), s2.to_record(true));

        let (buf, entries) = builder.take(0xABCD, 5, 17);
        assert!(builder.is_empty());
        assert_eq!(entries.len(), 2);
        assert_eq!(buf.len(), 4 * BLOCK_SIZE);

        let meta = MetaBlock::decode(&buf.as_slice()[..BLOCK_SIZE]).unwrap();
        assert_eq!(meta.log_id, 0xABCD);
        assert_eq!(meta.seq, 5);
        assert_eq!(meta.position, 17);
        assert_eq!(meta.entries.len(), 2);
        assert!(!meta.entries[0].cached);
        assert!(meta.entries[1].cached);

        // Data pages follow the meta block in entry order and checksum clean.
        let first = &buf.as_slice()[BLOCK_SIZE..3 * BLOCK_SIZE];
        assert!(meta.entries[0].data_checksum.verify(first));
        let second = &buf.as_slice()[3 * BLOCK_SIZE..4 * BLOCK_SIZE];
        assert!(meta.entries[1].data_checksum.verify(second));
    }

    #[test]
    fn test_inflight_completion_covers_repeat_entries() {
        let stripe = staged_stripe(0, &[0]);
        let other = staged_stripe(64, &[1]);

        let entries = vec![
            PendingEntry {
                stripe: Arc::clone(&stripe),
                record: stripe.to_record(true),
            },
            PendingEntry {
                stripe: Arc::clone(&stripe),
                record: stripe.to_record(true),
            },
            PendingEntry {
                stripe: Arc::clone(&other),
                record: other.to_record(false),
            },
        ];
        let mut unit = InflightUnit::new(1, 0, 4, entries);
        assert_eq!(unit.pending(), 3);

        assert!(unit.mark_finished(&stripe));
        assert_eq!(unit.pending(), 1);
        assert!(!unit.is_complete());

        assert!(unit.mark_finished(&other));
        assert!(unit.is_complete());
        assert!(!unit.mark_finished(&stripe));
    }
}
