//! Start-up replay
//!
//! Recovery is the quiesce-from-an-unknown-state case: no writer exists
//! yet, so the ring is scanned head to tail under no lock at all. A unit is
//! accepted only if its metadata block carries this log's identity, the
//! exact expected sequence number and position, a clean CRC seal, and data
//! pages matching their recorded checksums. The first unit that fails any
//! of these is a torn tail write: it and everything after it were never
//! acknowledged, so replay stops and discards them. That asymmetry -
//! detect and discard, never reconstruct - is the whole write-hole defense.

use bytes::Bytes;
use tracing::{debug, warn};

use stripecache_common::{ChecksumCalculator, Result};

use crate::array::ParityArray;
use crate::device::JournalDevice;
use crate::format::{MetaBlock, Superblock};
use crate::stripe::StripeRecord;

/// What replay found and where the log restarts
#[derive(Debug)]
pub(crate) struct ReplayOutcome {
    /// Stripe records re-injected into the array
    pub records: usize,
    /// Sequence number for the first post-recovery unit
    pub next_seq: u64,
    /// Physical block the first post-recovery unit will be written at
    pub next_phys: u64,
}

/// Walk the ring from the superblock head, re-injecting every intact unit
/// through `array` in journal order.
pub(crate) fn replay(
    device: &JournalDevice,
    sb: &Superblock,
    array: &dyn ParityArray,
) -> Result<ReplayOutcome> {
    let ring = device.ring_blocks();
    if sb.head_pos == 0 || sb.head_pos > ring {
        warn!(head_pos = sb.head_pos, "superblock head out of range, treating log as empty");
        return Ok(ReplayOutcome {
            records: 0,
            next_seq: sb.seq.max(1),
            next_phys: 1,
        });
    }

    let mut logical = sb.head_pos - 1;
    let mut seq = sb.seq;
    let mut records = 0usize;
    let mut scanned = 0u64;

    loop {
        if scanned >= ring {
            warn!("replay walked the entire ring, stopping");
            break;
        }

        let meta_buf = device.read_ring_block(logical)?;
        let meta = match MetaBlock::decode(meta_buf.as_slice()) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(seq, error = %e, "end of journal: no further metadata block");
                break;
            }
        };
        if meta.log_id != sb.log_id
            || meta.seq != seq
            || meta.position != device.ring_to_phys(logical)
        {
            debug!(
                expected_seq = seq,
                found_seq = meta.seq,
                "end of journal: stale metadata block"
            );
            break;
        }
        let unit_blocks = meta.total_blocks();
        if scanned + unit_blocks > ring {
            warn!(seq, "IO unit larger than remaining ring, discarding");
            break;
        }

        // Verify every entry's data before replaying any of the unit: a
        // unit is all-or-nothing.
        let mut unit_records = Vec::with_capacity(meta.entries.len());
        let mut data_logical = logical + 1;
        let mut intact = true;
        for entry in &meta.entries {
            let mut pages = Vec::with_capacity(entry.page_count());
            let mut calc = ChecksumCalculator::new();
            for _ in 0..entry.page_count() {
                let block = device.read_ring_block(data_logical)?;
                data_logical += 1;
                calc.update(block.as_slice());
                pages.push(Bytes::copy_from_slice(block.as_slice()));
            }
            if calc.finalize() != entry.data_checksum {
                intact = false;
                break;
            }
            unit_records.push(StripeRecord {
                sector: entry.sector,
                page_bitmap: entry.page_bitmap,
                pages,
                cached: entry.cached,
            });
        }
        if !intact {
            warn!(seq, "torn IO unit at journal tail, discarding it and everything after");
            break;
        }

        for record in unit_records {
            array.replay(record)?;
            records += 1;
        }
        logical += unit_blocks;
        scanned += unit_blocks;
        seq += 1;
    }

    Ok(ReplayOutcome {
        records,
        next_seq: seq,
        next_phys: device.ring_to_phys(logical),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::IoUnitBuilder;
    use crate::device::{AlignedBuffer, MIN_DEVICE_BLOCKS};
    use crate::stripe::Stripe;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use stripecache_common::{BLOCK_SIZE, PAGE_SIZE};
    use tempfile::tempdir;

    struct SinkArray {
        replayed: Mutex<Vec<StripeRecord>>,
    }

    impl SinkArray {
        fn new() -> Self {
            Self {
                replayed: Mutex::new(Vec::new()),
            }
        }
    }

    impl ParityArray for SinkArray {
        fn stripe_logged(&self, _stripe: &Arc<Stripe>) {}
        fn writeout(&self, _stripe: &Arc<Stripe>) -> Result<()> {
            Ok(())
        }
        fn resubmit_unlogged(&self, _stripe: &Arc<Stripe>) {}
        fn replay(&self, record: StripeRecord) -> Result<()> {
            self.replayed.lock().push(record);
            Ok(())
        }
    }

    fn write_unit(
        device: &JournalDevice,
        log_id: u64,
        seq: u64,
        logical: u64,
        sector: u64,
        fill: u8,
    ) -> u64 {
        let stripe = Stripe::new(sector, 4);
        stripe.stage_page(0, Bytes::from(vec![fill; PAGE_SIZE]));
        stripe.stage_page(2, Bytes::from(vec![fill ^ 0xFF; PAGE_SIZE]));
        let mut builder = IoUnitBuilder::new();
        builder.push(Arc::clone(&stripe), stripe.to_record(false));
        let (buf, _entries) = builder.take(log_id, seq, device.ring_to_phys(logical));
        device.write_ring(logical, buf.as_slice()).unwrap();
        (buf.len() / BLOCK_SIZE) as u64
    }

    #[test]
    fn test_replay_stops_at_torn_unit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let device =
            JournalDevice::open(&path, Some(MIN_DEVICE_BLOCKS * BLOCK_SIZE as u64), false).unwrap();

        let log_id = 0x1234;
        let sb = Superblock::format(log_id, device.ring_blocks());

        let mut logical = sb.head_pos - 1;
        logical += write_unit(&device, log_id, 1, logical, 0, 0xA1);
        let second_start = logical;
        logical += write_unit(&device, log_id, 2, logical, 64, 0xB2);
        let _ = logical;

        // Tear the second unit: clobber one of its data blocks.
        let garbage = AlignedBuffer::blocks(1);
        device
            .write_ring(second_start + 1, garbage.as_slice())
            .unwrap();

        let array = SinkArray::new();
        let outcome = replay(&device, &sb, &array).unwrap();

        assert_eq!(outcome.records, 1);
        assert_eq!(outcome.next_seq, 2);
        assert_eq!(outcome.next_phys, device.ring_to_phys(second_start));

        let replayed = array.replayed.lock();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sector, 0);
        assert_eq!(replayed[0].page_bitmap, 0b101);
        assert!(replayed[0].pages[0].iter().all(|&b| b == 0xA1));
    }

    #[test]
    fn test_replay_rejects_foreign_log_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let device =
            JournalDevice::open(&path, Some(MIN_DEVICE_BLOCKS * BLOCK_SIZE as u64), false).unwrap();

        // Records written by a previous tenant of the device.
        let sb_old = Superblock::format(0xAAAA, device.ring_blocks());
        write_unit(&device, 0xAAAA, 1, sb_old.head_pos - 1, 0, 0x11);

        // This log instance has a different identity.
        let sb_new = Superblock::format(0xBBBB, device.ring_blocks());
        let array = SinkArray::new();
        let outcome = replay(&device, &sb_new, &array).unwrap();

        assert_eq!(outcome.records, 0);
        assert_eq!(outcome.next_seq, 1);
        assert!(array.replayed.lock().is_empty());
    }

    #[test]
    fn test_replay_sequence_gap_stops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let device =
            JournalDevice::open(&path, Some(MIN_DEVICE_BLOCKS * BLOCK_SIZE as u64), false).unwrap();

        let log_id = 0x77;
        let sb = Superblock::format(log_id, device.ring_blocks());
        let mut logical = sb.head_pos - 1;
        logical += write_unit(&device, log_id, 1, logical, 0, 0x01);
        // Unit with a skipped sequence number: must end replay.
        write_unit(&device, log_id, 3, logical, 64, 0x02);

        let array = SinkArray::new();
        let outcome = replay(&device, &sb, &array).unwrap();
        assert_eq!(outcome.records, 1);
        assert_eq!(outcome.next_seq, 2);
    }
}
