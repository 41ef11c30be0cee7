use chrono::{DateTime, Utc};

/// Width of a persisted volume bucket. Only hourly buckets are durable;
/// longer windows are derived from them on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeInterval {
    Hourly,
}

impl VolumeInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeInterval::Hourly => "hourly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hourly" => Some(VolumeInterval::Hourly),
            _ => None,
        }
    }

    pub fn duration_secs(&self) -> i64 {
        match self {
            VolumeInterval::Hourly => crate::utils::SECONDS_PER_HOUR,
        }
    }
}

/// One fixed-width volume bucket per pair.
///
/// Identity: `{pair}:{interval}:{bucket_start}`.
///
/// Query Patterns:
///   - "Get hourly volume chart for pair X"
///   - "Sum volume for pair X over the last N hours"
#[derive(Debug, Clone, PartialEq)]
pub struct PairVolumeSnapshot {
    pub id: String,
    pub pair_address: String,
    pub interval: VolumeInterval,
    /// Bucket start (floor-aligned to the interval).
    pub timestamp: DateTime<Utc>,
    pub volume_usd: f64,
    pub tx_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PairVolumeSnapshot {
    pub fn snapshot_id(pair_address: &str, interval: VolumeInterval, bucket_start: i64) -> String {
        format!("{}:{}:{}", pair_address, interval.as_str(), bucket_start)
    }

    /// Empty bucket starting at `bucket_start`.
    pub fn empty(
        pair_address: &str,
        interval: VolumeInterval,
        bucket_start: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::snapshot_id(pair_address, interval, bucket_start.timestamp()),
            pair_address: pair_address.to_string(),
            interval,
            timestamp: bucket_start,
            volume_usd: 0.0,
            tx_count: 0,
            created_at,
            updated_at: created_at,
        }
    }
}
