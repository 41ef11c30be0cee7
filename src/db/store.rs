//! Durable store seam.
//!
//! The engine talks to storage only through [`Store`]; Postgres is the
//! production implementation. Everything a processing pass changed travels
//! in one [`WriteBatch`], which implementations must apply all-or-nothing.

use chrono::{DateTime, Utc};

use crate::db::models::{
    Pair, PairVolumeSnapshot, SyncCheckpoint, Token, TokenPriceSnapshot, Transaction,
    VolumeInterval,
};

/// Entities changed during one processing pass.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub pairs: Vec<Pair>,
    pub tokens: Vec<Token>,
    pub transactions: Vec<Transaction>,
    pub volume_snapshots: Vec<PairVolumeSnapshot>,
    pub price_snapshots: Vec<TokenPriceSnapshot>,
    pub checkpoint: Option<SyncCheckpoint>,
}

impl WriteBatch {
    /// Number of entity rows (the checkpoint is not counted).
    pub fn len(&self) -> usize {
        self.pairs.len()
            + self.tokens.len()
            + self.transactions.len()
            + self.volume_snapshots.len()
            + self.price_snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.checkpoint.is_none()
    }
}

#[allow(async_fn_in_trait)]
pub trait Store {
    /// All pairs persisted by previous runs.
    async fn load_pairs(&self) -> anyhow::Result<Vec<Pair>>;

    async fn get_tokens(&self, addresses: &[String]) -> anyhow::Result<Vec<Token>>;

    /// Closest price snapshot for `token` taken at or before `at`.
    async fn get_price_snapshot_at_or_before(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<TokenPriceSnapshot>>;

    async fn get_latest_volume_snapshot(
        &self,
        pair: &str,
        interval: VolumeInterval,
    ) -> anyhow::Result<Option<PairVolumeSnapshot>>;

    async fn get_volume_snapshot(&self, id: &str) -> anyhow::Result<Option<PairVolumeSnapshot>>;

    /// Buckets of `pair` starting at or after `since`.
    async fn get_volume_snapshots_since(
        &self,
        pair: &str,
        interval: VolumeInterval,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PairVolumeSnapshot>>;

    /// Subset of `ids` that already exist as persisted transactions.
    async fn get_existing_transaction_ids(&self, ids: &[String]) -> anyhow::Result<Vec<String>>;

    async fn get_sync_checkpoint(&self, factory: &str) -> anyhow::Result<Option<SyncCheckpoint>>;

    /// Apply a write batch atomically: either every row lands or none does.
    async fn save(&self, batch: &WriteBatch) -> anyhow::Result<()>;
}
