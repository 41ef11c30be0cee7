//! Hourly volume buckets and sliding-window sums.
//!
//! Only hourly buckets are stored. Window totals are always recomputed from
//! the full bucket set, never kept as running sums, so a late or corrected
//! bucket is picked up on the next recompute.

use chrono::{DateTime, Utc};

use crate::{
    db::models::{PairVolumeSnapshot, VolumeInterval},
    utils::{floor_to_hour, SECONDS_PER_DAY, SECONDS_PER_HOUR},
};

pub const WINDOW_1H: i64 = SECONDS_PER_HOUR;
pub const WINDOW_24H: i64 = SECONDS_PER_DAY;
pub const WINDOW_7D: i64 = 7 * SECONDS_PER_DAY;
pub const WINDOW_30D: i64 = 30 * SECONDS_PER_DAY;
pub const WINDOW_1Y: i64 = 365 * SECONDS_PER_DAY;

/// Trailing-window volume totals in the reference currency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowVolumes {
    pub volume_1h: f64,
    pub volume_24h: f64,
    pub volume_7d: f64,
    pub volume_30d: f64,
    pub volume_1y: f64,
}

/// Start of the hourly bucket covering `timestamp`.
pub fn hourly_bucket_start(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(floor_to_hour(timestamp.timestamp()), 0).unwrap_or(timestamp)
}

pub fn hourly_snapshot_id(pair_address: &str, timestamp: DateTime<Utc>) -> String {
    PairVolumeSnapshot::snapshot_id(
        pair_address,
        VolumeInterval::Hourly,
        hourly_bucket_start(timestamp).timestamp(),
    )
}

/// Add one trade to the bucket covering `timestamp`, creating the bucket if
/// needed. The transaction count always grows; the value only when known.
///
/// Returns the id of the touched bucket.
pub fn create_or_update_hourly_snapshot(
    buckets: &mut Vec<PairVolumeSnapshot>,
    pair_address: &str,
    value_usd: Option<f64>,
    timestamp: DateTime<Utc>,
) -> String {
    let id = hourly_snapshot_id(pair_address, timestamp);

    let idx = match buckets.iter().position(|b| b.id == id) {
        Some(idx) => idx,
        None => {
            buckets.push(PairVolumeSnapshot::empty(
                pair_address,
                VolumeInterval::Hourly,
                hourly_bucket_start(timestamp),
                timestamp,
            ));
            buckets.len() - 1
        },
    };

    let bucket = &mut buckets[idx];
    if let Some(value) = value_usd {
        bucket.volume_usd += value;
    }
    bucket.tx_count += 1;
    bucket.updated_at = timestamp;

    id
}

/// Sum bucket values into the five trailing windows ending at `as_of`.
///
/// A bucket counts toward a window iff `as_of - window <= bucket.timestamp <= as_of`.
pub fn calculate_volumes_from_snapshots<'a, I>(buckets: I, as_of: DateTime<Utc>) -> WindowVolumes
where
    I: IntoIterator<Item = &'a PairVolumeSnapshot>,
{
    let as_of_ts = as_of.timestamp();
    let mut volumes = WindowVolumes::default();

    for bucket in buckets {
        let ts = bucket.timestamp.timestamp();
        if ts > as_of_ts {
            continue;
        }
        let age = as_of_ts - ts;
        let value = bucket.volume_usd;

        if age <= WINDOW_1H {
            volumes.volume_1h += value;
        }
        if age <= WINDOW_24H {
            volumes.volume_24h += value;
        }
        if age <= WINDOW_7D {
            volumes.volume_7d += value;
        }
        if age <= WINDOW_30D {
            volumes.volume_30d += value;
        }
        if age <= WINDOW_1Y {
            volumes.volume_1y += value;
        }
    }

    volumes
}

/// Drop buckets older than the longest window. Returns how many were removed.
pub fn clear_old_snapshots(buckets: &mut Vec<PairVolumeSnapshot>, as_of: DateTime<Utc>) -> usize {
    let cutoff = as_of.timestamp() - WINDOW_1Y;
    let before = buckets.len();
    buckets.retain(|b| b.timestamp.timestamp() >= cutoff);
    before - buckets.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR: &str = "0x00000000000000000000000000000000000000aa";

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    fn bucket(ts: i64, value: f64) -> PairVolumeSnapshot {
        let mut b = PairVolumeSnapshot::empty(PAIR, VolumeInterval::Hourly, at(ts), at(ts));
        b.volume_usd = value;
        b
    }

    #[test]
    fn test_trades_in_same_hour_share_a_bucket() {
        let mut buckets = Vec::new();
        let a = create_or_update_hourly_snapshot(&mut buckets, PAIR, Some(10.0), at(7_210));
        let b = create_or_update_hourly_snapshot(&mut buckets, PAIR, Some(5.0), at(10_799));
        assert_eq!(a, b);
        assert_eq!(a, format!("{}:hourly:7200", PAIR));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].volume_usd, 15.0);
        assert_eq!(buckets[0].tx_count, 2);
        assert_eq!(buckets[0].timestamp, at(7_200));
    }

    #[test]
    fn test_unknown_value_counts_trade_only() {
        let mut buckets = Vec::new();
        create_or_update_hourly_snapshot(&mut buckets, PAIR, None, at(0));
        assert_eq!(buckets[0].volume_usd, 0.0);
        assert_eq!(buckets[0].tx_count, 1);
    }

    #[test]
    fn test_window_boundaries_are_inclusive() {
        let as_of = WINDOW_1Y + 100;
        let buckets = vec![
            bucket(as_of, 1.0),                // all windows
            bucket(as_of - WINDOW_1H, 2.0),    // exactly 1h old
            bucket(as_of - WINDOW_1H - 1, 4.0), // just outside 1h
            bucket(as_of - WINDOW_1Y, 8.0),    // exactly 1y old
            bucket(as_of - WINDOW_1Y - 1, 16.0),
            bucket(as_of + 1, 32.0), // in the future
        ];

        let v = calculate_volumes_from_snapshots(&buckets, at(as_of));
        assert_eq!(v.volume_1h, 3.0);
        assert_eq!(v.volume_24h, 7.0);
        assert_eq!(v.volume_7d, 7.0);
        assert_eq!(v.volume_30d, 7.0);
        assert_eq!(v.volume_1y, 15.0);
    }

    #[test]
    fn test_windows_grow_with_more_buckets() {
        let as_of = 10 * SECONDS_PER_DAY;
        let mut buckets = vec![bucket(as_of - 2 * SECONDS_PER_DAY, 5.0)];
        let before = calculate_volumes_from_snapshots(&buckets, at(as_of));
        buckets.push(bucket(as_of - 3 * SECONDS_PER_DAY, 7.0));
        let after = calculate_volumes_from_snapshots(&buckets, at(as_of));

        assert!(after.volume_7d >= before.volume_7d);
        assert_eq!(after.volume_7d, 12.0);
        assert_eq!(after.volume_24h, 0.0);
    }

    #[test]
    fn test_clear_old_snapshots() {
        let as_of = WINDOW_1Y + 10 * SECONDS_PER_HOUR;
        let mut buckets = vec![
            bucket(0, 1.0),
            bucket(as_of - WINDOW_1Y, 1.0),
            bucket(as_of, 1.0),
        ];
        assert_eq!(clear_old_snapshots(&mut buckets, at(as_of)), 1);
        assert_eq!(buckets.len(), 2);
    }
}
