//! Utility functions for the pairflow indexer.
//!
//! - [`validation`] - Finite/positive guards for derived prices and TVL
//! - [`conversion`] - Type conversions (U256, f64, hex encoding)
//! - [`time`] - Block timestamps and hourly bucketing

mod conversion;
mod time;
mod validation;

// ============================================
// Re-exports
// ============================================

pub use conversion::{hex_encode, parse_u256, u256_to_f64};

pub use time::{block_time, floor_to_hour, SECONDS_PER_DAY, SECONDS_PER_HOUR};

pub use validation::{validate_price_ratio, validate_usd_price, validate_usd_tvl};
