use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Indexer sync progress checkpoint (PostgreSQL).
///
/// Tracks the next block to fetch for a factory. Written in the same
/// transaction as the batch it follows, so a restart resumes exactly after
/// the last committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub factory_address: String,
    pub next_block: u64,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn new(factory_address: &str, next_block: u64) -> Self {
        Self {
            factory_address: factory_address.to_lowercase(),
            next_block,
            updated_at: Utc::now(),
        }
    }
}
