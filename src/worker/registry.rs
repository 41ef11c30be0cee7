use chrono::{DateTime, Utc};
use log::info;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::db::{
    models::{Pair, PairInfo, PairVolumeSnapshot, Transaction},
    store::Store,
};

/// Mutable working state of one tracked pair.
#[derive(Debug, Clone)]
pub struct PairState {
    pub info: PairInfo,
    /// `None` until the pair has been bootstrapped from contract reads.
    pub entity: Option<Pair>,
    /// Transactions observed this pass, not yet persisted.
    pub transactions: Vec<Transaction>,
    /// In-memory hourly buckets (bounded by the 1y eviction horizon).
    pub volume_snapshots: Vec<PairVolumeSnapshot>,
    /// Buckets created or changed this pass.
    pub dirty_volume_ids: FxHashSet<String>,
    pub is_dirty: bool,
    pub is_volume_dirty: bool,
    pub last_price_and_volume_update: Option<DateTime<Utc>>,
    pub volume_seeded: bool,
}

impl PairState {
    fn new(info: PairInfo, entity: Option<Pair>) -> Self {
        Self {
            info,
            entity,
            transactions: Vec::new(),
            volume_snapshots: Vec::new(),
            dirty_volume_ids: FxHashSet::default(),
            is_dirty: false,
            is_volume_dirty: false,
            last_price_and_volume_update: None,
            volume_seeded: false,
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.entity.is_some()
    }

    pub fn bucket(&self, id: &str) -> Option<&PairVolumeSnapshot> {
        self.volume_snapshots.iter().find(|b| b.id == id)
    }

    /// Add a bucket to the working set unless one with the same id exists.
    pub fn adopt_bucket(&mut self, bucket: PairVolumeSnapshot) {
        if self.bucket(&bucket.id).is_none() {
            self.volume_snapshots.push(bucket);
        }
    }

    pub fn mark_bucket_dirty(&mut self, id: String) {
        self.dirty_volume_ids.insert(id);
        self.is_volume_dirty = true;
    }

    pub fn dirty_buckets(&self) -> impl Iterator<Item = &PairVolumeSnapshot> {
        self.volume_snapshots
            .iter()
            .filter(|b| self.dirty_volume_ids.contains(&b.id))
    }

    /// Forget everything pending once it is durable.
    pub fn clear_dirty(&mut self) {
        self.transactions.clear();
        self.dirty_volume_ids.clear();
        self.is_dirty = false;
        self.is_volume_dirty = false;
    }
}

/// Keyed collection of tracked pairs, plus a token → pairs index.
#[derive(Debug, Default)]
pub struct Registry {
    pairs: FxHashMap<String, PairState>,
    by_token: FxHashMap<String, Vec<String>>,
    existing_loaded: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create working state for a pair. Never touches storage and
    /// never replaces existing state.
    pub fn register_pair(&mut self, info: PairInfo) -> &mut PairState {
        self.insert_state(info, None)
    }

    fn insert_state(&mut self, info: PairInfo, entity: Option<Pair>) -> &mut PairState {
        let address = info.address.clone();
        if !self.pairs.contains_key(&address) {
            for token in [&info.token0, &info.token1] {
                let pairs = self.by_token.entry(token.clone()).or_default();
                if !pairs.contains(&address) {
                    pairs.push(address.clone());
                }
            }
        }
        self.pairs
            .entry(address)
            .or_insert_with(|| PairState::new(info, entity))
    }

    /// Hydrate working state from persisted pairs. Runs once; later calls
    /// are no-ops returning 0.
    pub async fn load_existing_pairs<S: Store>(&mut self, store: &S) -> anyhow::Result<usize> {
        if self.existing_loaded {
            return Ok(0);
        }

        let pairs = store.load_pairs().await?;
        let count = pairs.len();
        for pair in pairs {
            let state = self.insert_state(pair.info(), None);
            if state.entity.is_none() {
                state.entity = Some(pair);
            }
        }

        self.existing_loaded = true;
        info!("Loaded {} persisted pairs", count);
        Ok(count)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.pairs.contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<&PairState> {
        self.pairs.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut PairState> {
        self.pairs.get_mut(address)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Tracked pair addresses in a stable order.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.pairs.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn states(&self) -> impl Iterator<Item = &PairState> {
        self.pairs.values()
    }

    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut PairState> {
        self.pairs.values_mut()
    }

    /// Bootstrapped pairs that contain `token`.
    pub fn pairs_with_token(&self, token: &str) -> Vec<&Pair> {
        self.by_token
            .get(token)
            .into_iter()
            .flatten()
            .filter_map(|address| self.pairs.get(address)?.entity.as_ref())
            .collect()
    }

    /// Every token referenced by a tracked pair, in a stable order.
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.by_token.keys().cloned().collect();
        tokens.sort();
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use alloy::primitives::U256;

    fn info(address: &str, t0: &str, t1: &str) -> PairInfo {
        PairInfo::new(address, t0, t1)
    }

    #[test]
    fn test_register_pair_is_idempotent() {
        let mut registry = Registry::new();
        registry.register_pair(info("0xP1", "0xA", "0xB")).is_dirty = true;
        let state = registry.register_pair(info("0xp1", "0xa", "0xb"));

        // Existing state is returned untouched
        assert!(state.is_dirty);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_token.get("0xa").map(Vec::len), Some(1));
    }

    #[test]
    fn test_pairs_with_token_only_returns_bootstrapped() {
        let mut registry = Registry::new();
        let p1 = info("0xp1", "0xa", "0xb");
        registry.register_pair(p1.clone());
        registry.register_pair(info("0xp2", "0xa", "0xc"));

        assert!(registry.pairs_with_token("0xa").is_empty());

        registry.get_mut("0xp1").unwrap().entity = Some(Pair::bootstrap(
            &p1,
            "A".into(),
            "B".into(),
            (U256::from(1u64), U256::from(1u64)),
            U256::ZERO,
            1,
            DateTime::from_timestamp(0, 0).unwrap(),
        ));
        let pairs = registry.pairs_with_token("0xa");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].address, "0xp1");
        assert_eq!(registry.tokens(), vec!["0xa", "0xb", "0xc"]);
    }

    #[tokio::test]
    async fn test_load_existing_pairs_runs_once() {
        let store = MemoryStore::new();
        let p1 = info("0xp1", "0xa", "0xb");
        store.insert_pair(Pair::bootstrap(
            &p1,
            "A".into(),
            "B".into(),
            (U256::from(5u64), U256::from(7u64)),
            U256::from(3u64),
            9,
            DateTime::from_timestamp(0, 0).unwrap(),
        ));

        let mut registry = Registry::new();
        assert_eq!(registry.load_existing_pairs(&store).await.unwrap(), 1);
        assert_eq!(registry.load_existing_pairs(&store).await.unwrap(), 0);

        let state = registry.get("0xp1").unwrap();
        assert!(state.is_bootstrapped());
        assert_eq!(state.entity.as_ref().unwrap().reserve1, U256::from(7u64));
    }
}
