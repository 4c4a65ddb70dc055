//! Checksum utilities for StripeCache
//!
//! Every on-disk structure is sealed with CRC32C; data pages additionally
//! carry an xxHash64 for cheap cross-verification during recovery.

use serde::{Deserialize, Serialize};

/// Checksum values computed for a block of data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for comparison)
    pub xxhash64: u64,
}

impl Checksum {
    /// Create a new checksum with all fields
    #[must_use]
    pub const fn new(crc32c: u32, xxhash64: u64) -> Self {
        Self { crc32c, xxhash64 }
    }

    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against this checksum (both algorithms)
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        self.verify_fast(data) && xxhash_rust::xxh64::xxh64(data, 0) == self.xxhash64
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
        }
    }

    /// Reset the calculator for reuse
    pub fn reset(&mut self) {
        self.crc32c = 0;
        self.xxhash_state.reset(0);
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_compute() {
        let data = b"stripe payload";
        let checksum = Checksum::compute(data);

        assert_ne!(checksum.crc32c, 0);
        assert_ne!(checksum.xxhash64, 0);
        assert!(checksum.verify_fast(data));
        assert!(checksum.verify(data));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let data = b"stripe payload";
        let checksum = Checksum::compute(data);

        let mut corrupted = data.to_vec();
        corrupted[3] ^= 0x80;
        assert!(!checksum.verify_fast(&corrupted));
        assert!(!checksum.verify(&corrupted));
    }

    #[test]
    fn test_streaming_calculator() {
        let data = b"stripe payload";
        let expected = Checksum::compute(data);

        let mut calc = ChecksumCalculator::new();
        calc.update(b"stripe ");
        calc.update(b"payload");
        assert_eq!(calc.finalize(), expected);
    }

    #[test]
    fn test_calculator_reset() {
        let mut calc = ChecksumCalculator::new();
        calc.update(b"garbage");
        calc.reset();
        calc.update(b"data");
        assert_eq!(calc.finalize(), Checksum::compute(b"data"));
    }
}
