//! Configuration types for StripeCache
//!
//! Watermarks, batching windows, and checkpoint cadence are deployment
//! policy, not protocol: they may be tuned freely without affecting the
//! on-disk format or the durability contract.

use crate::error::{Error, Result};
use crate::types::JournalMode;
use serde::{Deserialize, Serialize};

/// Journal configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Operating mode at start-up
    pub mode: JournalMode,
    /// When the journal path is a regular file that does not exist yet,
    /// create it with this many blocks. Block devices ignore this.
    #[serde(default)]
    pub create_blocks: Option<u64>,
    /// Open the journal device with direct I/O (O_DIRECT / F_NOCACHE).
    /// Disable only for filesystems that lack direct I/O support.
    #[serde(default = "default_direct_io")]
    pub direct_io: bool,
    /// Fraction of ring capacity held in reserve. A stripe write is refused
    /// with `Retry` when accepting it would leave less than this much free.
    pub reserve_fraction: f64,
    /// Maximum stripes coalesced into one IO unit
    pub max_batch_stripes: usize,
    /// Age at which the reclaim worker force-closes an open IO unit (ms)
    pub batch_window_ms: u64,
    /// Persist the superblock after the head has advanced this many blocks
    pub checkpoint_interval_blocks: u64,
    /// Reclaim worker wake-up period (ms)
    pub worker_tick_ms: u64,
    /// Cache policy (write-back mode)
    pub cache: CachePolicyConfig,
}

fn default_direct_io() -> bool {
    true
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            mode: JournalMode::WriteThrough,
            create_blocks: None,
            direct_io: default_direct_io(),
            reserve_fraction: 0.25,
            max_batch_stripes: 32,
            batch_window_ms: 5,
            checkpoint_interval_blocks: 1024,
            worker_tick_ms: 50,
            cache: CachePolicyConfig::default(),
        }
    }
}

impl JournalConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.reserve_fraction > 0.0 && self.reserve_fraction < 0.9) {
            return Err(Error::invalid_config(format!(
                "reserve_fraction {} out of range (0, 0.9)",
                self.reserve_fraction
            )));
        }
        if self.max_batch_stripes == 0 || self.max_batch_stripes > 128 {
            return Err(Error::invalid_config(format!(
                "max_batch_stripes {} out of range [1, 128]",
                self.max_batch_stripes
            )));
        }
        if self.worker_tick_ms == 0 {
            return Err(Error::invalid_config("worker_tick_ms must be non-zero"));
        }
        self.cache.validate()
    }
}

/// Write-back cache policy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachePolicyConfig {
    /// Maximum number of stripes held in the cache
    pub capacity_stripes: usize,
    /// Occupancy fraction above which admission stops and the reclaim
    /// worker starts draining
    pub high_water: f64,
    /// Occupancy fraction the drain aims for once triggered
    pub low_water: f64,
}

impl Default for CachePolicyConfig {
    fn default() -> Self {
        Self {
            capacity_stripes: 256,
            high_water: 0.75,
            low_water: 0.5,
        }
    }
}

impl CachePolicyConfig {
    /// Validate the cache policy
    pub fn validate(&self) -> Result<()> {
        if self.capacity_stripes == 0 {
            return Err(Error::invalid_config("capacity_stripes must be non-zero"));
        }
        if !(self.low_water > 0.0 && self.low_water < self.high_water && self.high_water <= 1.0) {
            return Err(Error::invalid_config(format!(
                "watermarks must satisfy 0 < low ({}) < high ({}) <= 1",
                self.low_water, self.high_water
            )));
        }
        Ok(())
    }

    /// Occupancy count at which admission stops
    #[must_use]
    pub fn high_water_stripes(&self) -> usize {
        (self.capacity_stripes as f64 * self.high_water).ceil() as usize
    }

    /// Occupancy count the drain aims for
    #[must_use]
    pub fn low_water_stripes(&self) -> usize {
        (self.capacity_stripes as f64 * self.low_water).floor() as usize
    }
}
