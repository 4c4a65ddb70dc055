//! Boundary with the parity engine
//!
//! The parity/geometry engine that owns stripe heads, computes parity, and
//! issues member-disk I/O lives outside this crate. Everything it needs to
//! provide is the [`ParityArray`] trait; everything it needs to know about
//! the array's shape comes in as [`ArrayGeometry`].

use std::sync::Arc;

use stripecache_common::{Error, Result, SECTORS_PER_PAGE};

use crate::stripe::{Stripe, StripeRecord};

/// Array shape as seen by the journal
#[derive(Debug, Clone, Copy)]
pub struct ArrayGeometry {
    /// Data pages per stripe row
    pub pages_per_stripe: usize,
    /// Sectors covered by one "big stripe", the granularity at which
    /// [`big_stripe_cached`](crate::log::Log::big_stripe_cached) answers.
    /// On arrays whose natural stripe is larger than the caching unit this
    /// is a multiple of the row size.
    pub big_stripe_sectors: u64,
}

impl ArrayGeometry {
    /// Sectors covered by one stripe row's data pages
    pub fn stripe_sectors(&self) -> u64 {
        self.pages_per_stripe as u64 * SECTORS_PER_PAGE
    }

    /// Which big stripe a sector falls into
    pub fn big_stripe_index(&self, sector: u64) -> u64 {
        sector / self.big_stripe_sectors
    }

    /// Validate the geometry
    pub fn validate(&self) -> Result<()> {
        if self.pages_per_stripe == 0 || self.pages_per_stripe > 64 {
            return Err(Error::invalid_config(format!(
                "pages_per_stripe {} out of range [1, 64]",
                self.pages_per_stripe
            )));
        }
        if self.big_stripe_sectors == 0 || self.big_stripe_sectors % self.stripe_sectors() != 0 {
            return Err(Error::invalid_config(format!(
                "big_stripe_sectors {} is not a multiple of the stripe size {}",
                self.big_stripe_sectors,
                self.stripe_sectors()
            )));
        }
        Ok(())
    }
}

/// What the journal asks of the parity engine.
///
/// Calls arrive from journal submission paths and from the reclaim worker
/// thread; implementations must be thread-safe and must never call back
/// into the journal while one of these calls is still on the stack, except
/// for the completion notifications
/// ([`stripe_write_finished`](crate::log::Log::stripe_write_finished)),
/// which are always safe.
pub trait ParityArray: Send + Sync {
    /// The stripe's journal record is durable. For cached writes this is
    /// the point at which the original writer may be acknowledged.
    fn stripe_logged(&self, stripe: &Arc<Stripe>);

    /// Apply the stripe's dirty pages to the array (parity computation and
    /// member-disk writes). The engine reports completion by calling
    /// `stripe_write_finished` on the log, exactly once per write-out.
    fn writeout(&self, stripe: &Arc<Stripe>) -> Result<()>;

    /// The journal has failed before this stripe's record became durable.
    /// The write was never acknowledged; the engine must re-drive it
    /// through the direct, unlogged path.
    fn resubmit_unlogged(&self, stripe: &Arc<Stripe>);

    /// Re-inject one recovered record into the normal dirty-stripe path
    /// during start-up replay. Called in journal order, before the log
    /// accepts any new writes.
    fn replay(&self, record: StripeRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_validation() {
        let good = ArrayGeometry {
            pages_per_stripe: 4,
            big_stripe_sectors: 64,
        };
        good.validate().unwrap();
        assert_eq!(good.stripe_sectors(), 32);
        assert_eq!(good.big_stripe_index(63), 0);
        assert_eq!(good.big_stripe_index(64), 1);

        let misaligned = ArrayGeometry {
            pages_per_stripe: 4,
            big_stripe_sectors: 48,
        };
        assert!(misaligned.validate().is_err());

        let too_wide = ArrayGeometry {
            pages_per_stripe: 65,
            big_stripe_sectors: 65 * 8,
        };
        assert!(too_wide.validate().is_err());
    }
}
