//! StripeCache Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and utilities
//! used across the StripeCache components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator};
pub use config::{CachePolicyConfig, JournalConfig};
pub use error::{Error, Result};
pub use types::*;
