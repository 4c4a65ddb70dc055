//! Ring space accounting
//!
//! Head and tail are monotonically increasing logical block positions; the
//! physical block for logical position `p` is `1 + p % ring_blocks`. Keeping
//! the counters monotonic makes occupancy arithmetic wrap-free: the ring
//! holds exactly `tail - head` live blocks.

use stripecache_common::{Error, Result};

/// Head/tail/sequence bookkeeping for the journal ring
#[derive(Debug)]
pub struct RingState {
    ring_blocks: u64,
    reserve_blocks: u64,
    head_logical: u64,
    tail_logical: u64,
    /// Sequence number of the oldest live unit (or of the next unit to be
    /// written when the ring is empty)
    head_seq: u64,
    /// Sequence number the next submitted unit will carry
    next_seq: u64,
}

impl RingState {
    /// Ring positioned so that logical addressing lines up with
    /// `start_phys`, the physical block the next unit will land on.
    pub fn new(ring_blocks: u64, reserve_fraction: f64, start_phys: u64, start_seq: u64) -> Self {
        debug_assert!((1..=ring_blocks).contains(&start_phys));
        let reserve_blocks = ((ring_blocks as f64 * reserve_fraction).ceil() as u64).max(1);
        let start_logical = start_phys - 1;
        Self {
            ring_blocks,
            reserve_blocks,
            head_logical: start_logical,
            tail_logical: start_logical,
            head_seq: start_seq,
            next_seq: start_seq,
        }
    }

    /// Blocks occupied by live records
    pub fn used_blocks(&self) -> u64 {
        self.tail_logical - self.head_logical
    }

    /// Blocks not occupied by live records (includes the reserve)
    pub fn free_blocks(&self) -> u64 {
        self.ring_blocks - self.used_blocks()
    }

    /// Size of the reserve
    pub fn reserve_blocks(&self) -> u64 {
        self.reserve_blocks
    }

    /// Whether a unit of `blocks` fits without eating into the reserve
    pub fn fits(&self, blocks: u64) -> bool {
        self.free_blocks() >= blocks + self.reserve_blocks
    }

    /// Reserve `blocks` at the tail for a new unit; returns the unit's
    /// logical start position and its sequence number.
    pub fn append(&mut self, blocks: u64) -> Result<(u64, u64)> {
        if !self.fits(blocks) {
            return Err(Error::Retry);
        }
        let start = self.tail_logical;
        let seq = self.next_seq;
        self.tail_logical += blocks;
        self.next_seq += 1;
        Ok((start, seq))
    }

    /// Release `blocks` at the head after the oldest unit (sequence
    /// `unit_seq`) is fully applied to the array. Strict FIFO: units are
    /// released in sequence order, head never passes tail.
    pub fn reclaim(&mut self, unit_seq: u64, blocks: u64) {
        assert_eq!(unit_seq, self.head_seq, "out-of-order reclaim");
        assert!(self.head_logical + blocks <= self.tail_logical);
        self.head_logical += blocks;
        self.head_seq += 1;
    }

    /// Sequence number of the oldest live unit
    pub fn head_seq(&self) -> u64 {
        self.head_seq
    }

    /// Sequence number the next unit will carry
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Logical tail position (next unit start)
    pub fn tail_logical(&self) -> u64 {
        self.tail_logical
    }

    /// Logical head position (oldest live block)
    pub fn head_logical(&self) -> u64 {
        self.head_logical
    }

    /// Physical block index of the head
    pub fn head_phys(&self) -> u64 {
        1 + self.head_logical % self.ring_blocks
    }

    /// Physical block index the next unit's metadata block will land on
    pub fn tail_phys(&self) -> u64 {
        1 + self.tail_logical % self.ring_blocks
    }

    /// Whether the ring holds no live records
    pub fn is_empty(&self) -> bool {
        self.head_logical == self.tail_logical
    }
}
