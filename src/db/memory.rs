//! In-memory [`Store`] used by the engine tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::db::{
    models::{
        Pair, PairVolumeSnapshot, SyncCheckpoint, Token, TokenPriceSnapshot, Transaction,
        VolumeInterval,
    },
    store::{Store, WriteBatch},
};

#[derive(Default)]
struct Inner {
    pairs: BTreeMap<String, Pair>,
    tokens: BTreeMap<String, Token>,
    transactions: BTreeMap<String, Transaction>,
    volume_snapshots: BTreeMap<String, PairVolumeSnapshot>,
    price_snapshots: BTreeMap<String, TokenPriceSnapshot>,
    checkpoints: BTreeMap<String, SyncCheckpoint>,
    save_calls: usize,
    fail_next_save: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_save(&self) {
        self.inner.lock().unwrap().fail_next_save = true;
    }

    pub fn save_calls(&self) -> usize {
        self.inner.lock().unwrap().save_calls
    }

    pub fn pair(&self, address: &str) -> Option<Pair> {
        self.inner.lock().unwrap().pairs.get(address).cloned()
    }

    pub fn token(&self, address: &str) -> Option<Token> {
        self.inner.lock().unwrap().tokens.get(address).cloned()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().transactions.values().cloned().collect()
    }

    pub fn volume_snapshots(&self, pair: &str) -> Vec<PairVolumeSnapshot> {
        let mut buckets: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .volume_snapshots
            .values()
            .filter(|s| s.pair_address == pair)
            .cloned()
            .collect();
        buckets.sort_by_key(|s| s.timestamp);
        buckets
    }

    pub fn price_snapshots(&self, token: &str) -> Vec<TokenPriceSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .price_snapshots
            .values()
            .filter(|s| s.token_address == token)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.block_number);
        snapshots
    }

    pub fn insert_price_snapshot(&self, snapshot: TokenPriceSnapshot) {
        self.inner
            .lock()
            .unwrap()
            .price_snapshots
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn insert_pair(&self, pair: Pair) {
        self.inner.lock().unwrap().pairs.insert(pair.address.clone(), pair);
    }
}

impl Store for MemoryStore {
    async fn load_pairs(&self) -> anyhow::Result<Vec<Pair>> {
        Ok(self.inner.lock().unwrap().pairs.values().cloned().collect())
    }

    async fn get_tokens(&self, addresses: &[String]) -> anyhow::Result<Vec<Token>> {
        let inner = self.inner.lock().unwrap();
        Ok(addresses
            .iter()
            .filter_map(|a| inner.tokens.get(a).cloned())
            .collect())
    }

    async fn get_price_snapshot_at_or_before(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<TokenPriceSnapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .price_snapshots
            .values()
            .filter(|s| s.token_address == token && s.timestamp <= at)
            .max_by_key(|s| (s.timestamp, s.block_number))
            .cloned())
    }

    async fn get_latest_volume_snapshot(
        &self,
        pair: &str,
        interval: VolumeInterval,
    ) -> anyhow::Result<Option<PairVolumeSnapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .volume_snapshots
            .values()
            .filter(|s| s.pair_address == pair && s.interval == interval)
            .max_by_key(|s| s.timestamp)
            .cloned())
    }

    async fn get_volume_snapshot(&self, id: &str) -> anyhow::Result<Option<PairVolumeSnapshot>> {
        Ok(self.inner.lock().unwrap().volume_snapshots.get(id).cloned())
    }

    async fn get_volume_snapshots_since(
        &self,
        pair: &str,
        interval: VolumeInterval,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PairVolumeSnapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .volume_snapshots
            .values()
            .filter(|s| s.pair_address == pair && s.interval == interval && s.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn get_existing_transaction_ids(&self, ids: &[String]) -> anyhow::Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|id| inner.transactions.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get_sync_checkpoint(&self, factory: &str) -> anyhow::Result<Option<SyncCheckpoint>> {
        Ok(self.inner.lock().unwrap().checkpoints.get(factory).cloned())
    }

    async fn save(&self, batch: &WriteBatch) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.save_calls += 1;
        if inner.fail_next_save {
            inner.fail_next_save = false;
            anyhow::bail!("simulated write failure");
        }

        for pair in &batch.pairs {
            inner.pairs.insert(pair.address.clone(), pair.clone());
        }
        for token in &batch.tokens {
            inner.tokens.insert(token.address.clone(), token.clone());
        }
        for tx in &batch.transactions {
            // Transactions are immutable: first write wins
            inner
                .transactions
                .entry(tx.id.clone())
                .or_insert_with(|| tx.clone());
        }
        for bucket in &batch.volume_snapshots {
            inner.volume_snapshots.insert(bucket.id.clone(), bucket.clone());
        }
        for snapshot in &batch.price_snapshots {
            inner
                .price_snapshots
                .insert(snapshot.id.clone(), snapshot.clone());
        }
        if let Some(checkpoint) = &batch.checkpoint {
            inner
                .checkpoints
                .insert(checkpoint.factory_address.clone(), checkpoint.clone());
        }
        Ok(())
    }
}
