//! Shared types and layout constants for StripeCache

use serde::{Deserialize, Serialize};

/// Size of one journal device block in bytes. All journal I/O is issued in
/// whole blocks at block-aligned offsets (direct I/O requirement).
pub const BLOCK_SIZE: usize = 4096;

/// Size of one stripe data page in bytes. The unit of dirty tracking inside
/// a stripe; equal to the journal block size so a page maps to one block.
pub const PAGE_SIZE: usize = 4096;

/// Array logical sector size in bytes. Stripe addresses handed in by the
/// parity engine are expressed in these sectors.
pub const SECTOR_SIZE: u64 = 512;

/// Sectors covered by one data page
pub const SECTORS_PER_PAGE: u64 = PAGE_SIZE as u64 / SECTOR_SIZE;

/// Upper bound on data pages per stripe row (dirty state is a u64 bitmap)
pub const MAX_STRIPE_PAGES: usize = 64;

/// Journal operating mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalMode {
    /// Log only: every write is applied to the array immediately after it
    /// is durable in the journal.
    WriteThrough,
    /// Caching: writes may be acknowledged once journaled, with the array
    /// write deferred and coalesced.
    WriteBack,
}

impl JournalMode {
    /// Whether write-back caching is enabled in this mode
    #[must_use]
    pub fn is_writeback(self) -> bool {
        matches!(self, Self::WriteBack)
    }
}

impl std::fmt::Display for JournalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriteThrough => write!(f, "write-through"),
            Self::WriteBack => write!(f, "write-back"),
        }
    }
}

/// Outcome of a flush/barrier request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushStatus {
    /// Nothing was outstanding; the barrier was satisfied immediately
    Empty,
    /// The open IO unit was submitted and is now durable
    Flushed,
}

/// Outcome of a cache admission attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheAdmission {
    /// The stripe was accepted into (or already lives in) the cache
    Accepted,
    /// Declined; the caller should use the immediate write-out path
    Declined,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_mode() {
        assert!(JournalMode::WriteBack.is_writeback());
        assert!(!JournalMode::WriteThrough.is_writeback());
        assert_eq!(JournalMode::WriteBack.to_string(), "write-back");
    }

    #[test]
    fn test_page_covers_whole_sectors() {
        assert_eq!(PAGE_SIZE as u64 % SECTOR_SIZE, 0);
        assert_eq!(SECTORS_PER_PAGE, 8);
    }
}
