//! Block-time helpers.

use chrono::{DateTime, Utc};

pub const SECONDS_PER_HOUR: i64 = 3_600;
pub const SECONDS_PER_DAY: i64 = 24 * SECONDS_PER_HOUR;

/// Convert a block timestamp (unix seconds) to a UTC datetime.
/// Out-of-range values collapse to the unix epoch.
pub fn block_time(timestamp: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_default()
}

/// Floor a unix timestamp to the start of its hour.
#[inline]
pub fn floor_to_hour(timestamp: i64) -> i64 {
    timestamp.div_euclid(SECONDS_PER_HOUR) * SECONDS_PER_HOUR
}
