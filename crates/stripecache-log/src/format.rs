//! On-disk journal format
//!
//! Block 0 holds the superblock; the rest of the device is a ring of IO
//! units. One IO unit is a single metadata block immediately followed by the
//! data pages it describes:
//!
//! ```text
//! +------------+----------------+----------------+---
//! | meta block | entry 0 pages  | entry 1 pages  | ...
//! | 1 block    | popcnt(bitmap) | popcnt(bitmap) |
//! +------------+----------------+----------------+---
//! ```
//!
//! Every metadata block carries the log identity, its own sequence number
//! and physical position, and a CRC32C seal. A partially written unit at the
//! tail fails one of those checks and ends replay; it is discarded, never
//! surfaced as committed data.

use stripecache_common::{BLOCK_SIZE, Checksum, Error, MAX_STRIPE_PAGES, Result};

/// Superblock magic ("SCSB")
const SUPER_MAGIC: u32 = 0x4253_4353;

/// Metadata block magic ("SCMB")
const META_MAGIC: u32 = 0x424D_4353;

/// On-disk format version
const FORMAT_VERSION: u32 = 1;

/// Fixed superblock prefix: magic, version, log_id, seq, head_pos,
/// ring_blocks
const SUPER_PREFIX: usize = 4 + 4 + 8 + 8 + 8 + 8;

/// Fixed metadata block prefix: magic, version, log_id, seq, position,
/// entry_count, reserved
const META_PREFIX: usize = 4 + 4 + 8 + 8 + 8 + 4 + 4;

/// Serialized size of one stripe descriptor
const ENTRY_SIZE: usize = 8 + 8 + 4 + 4 + 8;

/// Entry flag: the stripe was accepted as a write-back cached write
const FLAG_CACHED: u32 = 1 << 0;

/// Maximum stripe descriptors one metadata block can carry
pub const MAX_META_ENTRIES: usize = (BLOCK_SIZE - META_PREFIX - 4) / ENTRY_SIZE;

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// The journal superblock, rewritten lazily as the head advances and at
/// clean shutdown. Points replay at the oldest live IO unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Identity of this log instance; every metadata block must match
    pub log_id: u64,
    /// Sequence number expected at `head_pos`
    pub seq: u64,
    /// Physical block index where replay starts
    pub head_pos: u64,
    /// Ring size recorded at format time (sanity-checked against the device)
    pub ring_blocks: u64,
}

impl Superblock {
    /// Superblock for a freshly formatted log
    pub fn format(log_id: u64, ring_blocks: u64) -> Self {
        Self {
            log_id,
            seq: 1,
            head_pos: 1,
            ring_blocks,
        }
    }

    /// Serialize into one journal block
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&SUPER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.log_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.seq.to_le_bytes());
        buf[24..32].copy_from_slice(&self.head_pos.to_le_bytes());
        buf[32..40].copy_from_slice(&self.ring_blocks.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..SUPER_PREFIX]);
        buf[SUPER_PREFIX..SUPER_PREFIX + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a superblock, verifying magic, version, and checksum
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_SIZE {
            return Err(Error::corrupt("superblock short read"));
        }
        if get_u32(buf, 0) != SUPER_MAGIC {
            return Err(Error::corrupt("superblock magic mismatch"));
        }
        let version = get_u32(buf, 4);
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported journal format version {}",
                version
            )));
        }
        let stored = get_u32(buf, SUPER_PREFIX);
        let computed = crc32c::crc32c(&buf[..SUPER_PREFIX]);
        if stored != computed {
            return Err(Error::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        Ok(Self {
            log_id: get_u64(buf, 8),
            seq: get_u64(buf, 16),
            head_pos: get_u64(buf, 24),
            ring_blocks: get_u64(buf, 32),
        })
    }
}

/// One stripe's descriptor inside a metadata block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeDescriptor {
    /// Stripe start sector on the array
    pub sector: u64,
    /// Dirty-page bitmap; bit i set means page i follows in the data area
    pub page_bitmap: u64,
    /// Whether this was a write-back cached write
    pub cached: bool,
    /// Checksum over the entry's concatenated data pages
    pub data_checksum: Checksum,
}

impl StripeDescriptor {
    /// Number of data pages (= data blocks) this entry contributes
    pub fn page_count(&self) -> usize {
        self.page_bitmap.count_ones() as usize
    }

    fn encode_into(&self, buf: &mut [u8]) {
        let flags = if self.cached { FLAG_CACHED } else { 0 };
        buf[0..8].copy_from_slice(&self.sector.to_le_bytes());
        buf[8..16].copy_from_slice(&self.page_bitmap.to_le_bytes());
        buf[16..20].copy_from_slice(&flags.to_le_bytes());
        buf[20..24].copy_from_slice(&self.data_checksum.crc32c.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_checksum.xxhash64.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Result<Self> {
        let page_bitmap = get_u64(buf, 8);
        if page_bitmap == 0 {
            return Err(Error::corrupt("stripe descriptor with empty page bitmap"));
        }
        let flags = get_u32(buf, 16);
        if flags & !FLAG_CACHED != 0 {
            return Err(Error::corrupt(format!(
                "stripe descriptor with unknown flags {:#x}",
                flags
            )));
        }
        Ok(Self {
            sector: get_u64(buf, 0),
            page_bitmap,
            cached: flags & FLAG_CACHED != 0,
            data_checksum: Checksum::new(get_u32(buf, 20), get_u64(buf, 24)),
        })
    }
}

/// The metadata block heading one IO unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaBlock {
    /// Log identity, must match the superblock
    pub log_id: u64,
    /// Strictly increasing IO-unit sequence number
    pub seq: u64,
    /// Physical block index this metadata block was written at
    pub position: u64,
    /// Stripe descriptors, in data-area order
    pub entries: Vec<StripeDescriptor>,
}

impl MetaBlock {
    /// Empty metadata block for a new IO unit
    pub fn new(log_id: u64, seq: u64, position: u64) -> Self {
        Self {
            log_id,
            seq,
            position,
            entries: Vec::new(),
        }
    }

    /// Total data blocks referenced by this unit (excludes the meta block)
    pub fn data_blocks(&self) -> u64 {
        self.entries.iter().map(|e| e.page_count() as u64).sum()
    }

    /// Total blocks this unit occupies on the ring
    pub fn total_blocks(&self) -> u64 {
        1 + self.data_blocks()
    }

    /// Serialize into one journal block
    pub fn encode(&self) -> Vec<u8> {
        assert!(self.entries.len() <= MAX_META_ENTRIES, "metadata block overflow");
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.log_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.seq.to_le_bytes());
        buf[24..32].copy_from_slice(&self.position.to_le_bytes());
        buf[32..36].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        // buf[36..40] reserved
        let mut off = META_PREFIX;
        for entry in &self.entries {
            entry.encode_into(&mut buf[off..off + ENTRY_SIZE]);
            off += ENTRY_SIZE;
        }
        let crc = crc32c::crc32c(&buf[..off]);
        buf[off..off + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a metadata block, verifying magic, version, entry bounds, and
    /// the CRC seal. Any failure means a torn or stale block.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_SIZE {
            return Err(Error::corrupt("metadata block short read"));
        }
        if get_u32(buf, 0) != META_MAGIC {
            return Err(Error::corrupt("metadata block magic mismatch"));
        }
        let version = get_u32(buf, 4);
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported journal format version {}",
                version
            )));
        }
        let count = get_u32(buf, 32) as usize;
        if count == 0 || count > MAX_META_ENTRIES {
            return Err(Error::corrupt(format!(
                "metadata block entry count {} out of range",
                count
            )));
        }
        let entries_end = META_PREFIX + count * ENTRY_SIZE;
        let stored = get_u32(buf, entries_end);
        let computed = crc32c::crc32c(&buf[..entries_end]);
        if stored != computed {
            return Err(Error::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let mut entries = Vec::with_capacity(count);
        let mut off = META_PREFIX;
        for _ in 0..count {
            let entry = StripeDescriptor::decode_from(&buf[off..off + ENTRY_SIZE])?;
            if entry.page_count() > MAX_STRIPE_PAGES {
                return Err(Error::corrupt("stripe descriptor bitmap too wide"));
            }
            entries.push(entry);
            off += ENTRY_SIZE;
        }

        Ok(Self {
            log_id: get_u64(buf, 8),
            seq: get_u64(buf, 16),
            position: get_u64(buf, 24),
            entries,
        })
    }
}
