//! StripeCache Log - stripe-aligned write-ahead log and write-back cache
//!
//! This crate closes the parity write hole for RAID5/6-style arrays: a
//! crash in the middle of a multi-disk stripe update can no longer leave
//! data and parity silently inconsistent, because every stripe write is
//! made durable on a fast journal device first. In write-back mode the
//! journal doubles as the backing store for a stripe cache, absorbing
//! small writes and coalescing them into full-stripe write-outs.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │   Parity engine    │  (stripe heads, parity, member disks)
//! └────────┬───────────┘
//!          │ write_stripe / try_cache_write / stripe_write_finished
//! ┌────────▼───────────┐
//! │        Log         │
//! │  - IO-unit batcher │──── reclaim worker (write-outs, watermarks,
//! │  - cache policy    │                     FIFO head advancement)
//! │  - quiesce/replay  │
//! └────────┬───────────┘
//!          │ block-aligned IO units
//! ┌────────▼───────────┐
//! │   Journal device   │  (ring: superblock + meta/data units)
//! └────────────────────┘
//! ```
//!
//! The parity engine is out of scope: it is reached exclusively through
//! the [`ParityArray`] trait, and it calls back in through
//! [`Log::stripe_write_finished`] when a stripe's array write completes.

pub mod array;
pub mod batch;
pub mod cache;
pub mod device;
pub mod format;
pub mod log;
mod reclaim;
mod recovery;
pub mod ring;
pub mod stripe;

pub use array::{ArrayGeometry, ParityArray};
pub use device::{AlignedBuffer, JournalDevice, MIN_DEVICE_BLOCKS, RawDevice};
pub use format::{MAX_META_ENTRIES, MetaBlock, StripeDescriptor, Superblock};
pub use log::{Log, LogStats};
pub use stripe::{ExtraPage, PagePool, StateKind, Stripe, StripeRecord, StripeState};

// Re-export the shared vocabulary so integrators need only this crate.
pub use stripecache_common::{
    BLOCK_SIZE, CacheAdmission, CachePolicyConfig, Error, FlushStatus, JournalConfig, JournalMode,
    PAGE_SIZE, Result, SECTOR_SIZE,
};
