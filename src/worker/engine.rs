use alloy::primitives::{Address, U256};
use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use log::{debug, error, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    abis::PairCreated,
    config::{DeploymentMode, IndexerSettings, PricingSettings},
    db::{
        models::{
            Pair, PairInfo, PairVolumeSnapshot, SyncCheckpoint, Token, TokenPriceSnapshot, Transaction,
            TransactionType, VolumeInterval,
        },
        store::{Store, WriteBatch},
    },
    error::IndexerError,
    utils::{block_time, hex_encode, SECONDS_PER_HOUR},
    worker::{
        block_source::{Block, BlockBatch, RawEvent},
        contract_reader::ContractReader,
        decoder::{ContractKind, DecodedEvent, Decoder, FactoryEvent, PairEvent},
        price_calculator::{amount_to_usd, PriceCalculator},
        registry::Registry,
        volume_calculator::{
            calculate_volumes_from_snapshots, clear_old_snapshots,
            create_or_update_hourly_snapshot, hourly_bucket_start, hourly_snapshot_id, WINDOW_1Y,
        },
    },
};

/// Counters for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub blocks: usize,
    pub events: usize,
    /// Transactions recorded this pass.
    pub transactions: usize,
    /// Events whose transaction was already durable.
    pub replayed: usize,
    /// Events skipped after a caught error (lenient mode only).
    pub skipped: usize,
    /// Entity rows written.
    pub rows: usize,
    pub next_block: u64,
}

/// Pair aggregation engine.
///
/// Owns all per-pair working state and drives one batch at a time through:
/// 1. pair bootstrap, token metadata and price seeding, volume bucket seeding
/// 2. per block: hourly maintenance, then every event in log order
/// 3. window volume and TVL recomputation
/// 4. a single atomic write of everything that changed, plus the checkpoint
///
/// Per-event failures are isolated: in lenient mode the event is logged and
/// skipped, in strict mode the batch aborts. Store failures always abort and
/// nothing of the batch is written. A failed batch also drops the in-memory
/// working state, so the next batch starts again from durable state and the
/// caller may re-run the failed one.
pub struct Engine<R, S> {
    reader: R,
    store: S,
    decoder: Decoder,
    price_calculator: PriceCalculator,
    mode: DeploymentMode,
    factory_address: String,
    discover_pairs_on_start: bool,

    registry: Registry,
    tokens: FxHashMap<String, Token>,
    dirty_tokens: FxHashSet<String>,
    token_prices: FxHashMap<String, f64>,
    /// Tokens whose initial price lookup already ran
    price_seeded: FxHashSet<String>,
    /// Price snapshots created this pass, by id
    pending_price_snapshots: FxHashMap<String, TokenPriceSnapshot>,
    /// Pairs first registered by the running batch
    batch_pairs: FxHashSet<String>,
    initialized: bool,
}

impl<R: ContractReader, S: Store> Engine<R, S> {
    pub fn new(
        reader: R,
        store: S,
        decoder: Decoder,
        indexer: &IndexerSettings,
        pricing: &PricingSettings,
    ) -> Result<Self, IndexerError> {
        let factory_address = indexer.factory_address.to_lowercase();
        factory_address.parse::<Address>().map_err(|e| {
            IndexerError::Config(format!("invalid factory address {}: {}", factory_address, e))
        })?;

        Ok(Self {
            reader,
            store,
            decoder,
            price_calculator: PriceCalculator::new(pricing),
            mode: indexer.mode,
            factory_address,
            discover_pairs_on_start: indexer.discover_pairs_on_start,
            registry: Registry::new(),
            tokens: FxHashMap::default(),
            dirty_tokens: FxHashSet::default(),
            token_prices: FxHashMap::default(),
            price_seeded: FxHashSet::default(),
            pending_price_snapshots: FxHashMap::default(),
            batch_pairs: FxHashSet::default(),
            initialized: false,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn token(&self, address: &str) -> Option<&Token> {
        self.tokens.get(address)
    }

    pub fn token_price(&self, address: &str) -> Option<f64> {
        self.token_prices.get(address).copied()
    }

    #[cfg(test)]
    pub fn reader(&self) -> &R {
        &self.reader
    }

    #[cfg(test)]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Block to resume from, according to the durable checkpoint.
    pub async fn resume_block(&self, default_start: u64) -> Result<u64, IndexerError> {
        let checkpoint = self
            .store
            .get_sync_checkpoint(&self.factory_address)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(checkpoint.map_or(default_start, |c| c.next_block))
    }

    /// Process one batch end to end and persist its effects atomically.
    ///
    /// On error nothing of the batch is durable and nothing of it stays in
    /// memory: re-running the same batch gives the same result as the first
    /// attempt would have.
    pub async fn process_batch(&mut self, batch: &BlockBatch) -> Result<BatchSummary, IndexerError> {
        self.batch_pairs.clear();
        let result = self.run_batch(batch).await;
        if result.is_err() {
            self.discard_working_state();
        }
        result
    }

    async fn run_batch(&mut self, batch: &BlockBatch) -> Result<BatchSummary, IndexerError> {
        if !self.initialized {
            self.initialize().await?;
        }

        let mut summary = BatchSummary {
            blocks: batch.blocks.len(),
            next_block: batch.next_block,
            ..Default::default()
        };

        if let (Some(first), Some(last)) = (batch.blocks.first(), batch.blocks.last()) {
            let mut known_ids = self.durable_transaction_ids(batch).await?;

            self.prepare_pairs(first).await?;

            for block in &batch.blocks {
                self.run_hourly_maintenance(block).await?;

                for event in &block.events {
                    summary.events += 1;
                    match self.handle_event(event, block, &mut known_ids).await {
                        Ok(EventOutcome::Recorded) => summary.transactions += 1,
                        Ok(EventOutcome::Replayed) => summary.replayed += 1,
                        Ok(EventOutcome::Ignored) => {},
                        Err(err) => {
                            let method = self.decoder.method_of(event).unwrap_or("unknown");
                            if self.is_fatal(&err) {
                                error!(
                                    "Aborting batch at {}-{} ({} on {}, block {}): {}",
                                    event.tx_hash,
                                    event.log_index,
                                    method,
                                    event.address,
                                    block.number,
                                    err
                                );
                                return Err(err);
                            }
                            error!(
                                "Skipping event {}-{} ({} on {}, block {}): {}",
                                event.tx_hash,
                                event.log_index,
                                method,
                                event.address,
                                block.number,
                                err
                            );
                            summary.skipped += 1;
                        },
                    }
                }
            }

            let as_of = block_time(last.timestamp);
            self.converge_prices(last.number, as_of).await?;
            self.recompute_volumes(as_of).await?;
            self.recompute_tvl();
        }

        let write_batch = self.collect_write_batch(batch.next_block);
        summary.rows = write_batch.len();

        if let Some(last) = batch.blocks.last() {
            let as_of = block_time(last.timestamp);
            for state in self.registry.states_mut() {
                clear_old_snapshots(&mut state.volume_snapshots, as_of);
            }
        }

        self.store
            .save(&write_batch)
            .await
            .map_err(IndexerError::Persistence)?;

        self.clear_dirty();
        Ok(summary)
    }

    /// Forget everything derived since the last successful save. Pairs tracked
    /// before the failed batch stay registered; their entities, buckets,
    /// tokens and prices are loaded again from the store on the next batch.
    fn discard_working_state(&mut self) {
        let tracked: Vec<PairInfo> = self
            .registry
            .states()
            .filter(|s| !self.batch_pairs.contains(&s.info.address))
            .map(|s| s.info.clone())
            .collect();

        warn!(
            "Discarding in-memory state after a failed batch; {} pairs will reload from the store",
            tracked.len()
        );

        self.registry = Registry::new();
        for info in tracked {
            self.registry.register_pair(info);
        }
        self.tokens.clear();
        self.dirty_tokens.clear();
        self.token_prices.clear();
        self.price_seeded.clear();
        self.pending_price_snapshots.clear();
        self.batch_pairs.clear();
        self.initialized = false;
    }

    fn is_fatal(&self, err: &IndexerError) -> bool {
        self.mode.is_strict()
            || matches!(err, IndexerError::Persistence(_) | IndexerError::Config(_))
    }

    /// Return the error in strict mode, log it and carry on in lenient mode.
    fn recover(&self, err: IndexerError) -> Result<(), IndexerError> {
        if self.is_fatal(&err) {
            return Err(err);
        }
        error!("{}", err);
        Ok(())
    }

    /// First pass only: persisted pairs, then factory discovery.
    async fn initialize(&mut self) -> Result<(), IndexerError> {
        self.registry
            .load_existing_pairs(&self.store)
            .await
            .map_err(IndexerError::Persistence)?;

        if self.discover_pairs_on_start {
            match self.reader.get_pairs(&self.factory_address).await {
                Ok(pairs) => {
                    let before = self.registry.len();
                    for pair in pairs {
                        self.registry.register_pair(pair);
                    }
                    info!(
                        "Discovered {} new pairs from factory {}",
                        self.registry.len() - before,
                        self.factory_address
                    );
                },
                Err(e) => self.recover(IndexerError::state_sync(&self.factory_address, 0, e))?,
            }
        }

        self.initialized = true;
        Ok(())
    }

    async fn durable_transaction_ids(
        &self,
        batch: &BlockBatch,
    ) -> Result<FxHashSet<String>, IndexerError> {
        let ids: Vec<String> = batch
            .blocks
            .iter()
            .flat_map(|b| &b.events)
            .filter(|e| !e.removed && !e.topics.is_empty() && self.registry.contains(&e.address))
            .map(|e| Transaction::message_id(&e.tx_hash, e.log_index))
            .collect();

        if ids.is_empty() {
            return Ok(FxHashSet::default());
        }

        let existing = self
            .store
            .get_existing_transaction_ids(&ids)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(existing.into_iter().collect())
    }

    /// Make sure every tracked pair is bootstrapped, has its tokens and a
    /// seeded volume bucket before the first block runs.
    async fn prepare_pairs(&mut self, first: &Block) -> Result<(), IndexerError> {
        let observed_at = block_time(first.timestamp);
        for address in self.registry.addresses() {
            // Pairs tracked before the batch are already deployed: read latest state
            if let Err(e) = self
                .ensure_pair_ready(&address, None, first.number, observed_at)
                .await
            {
                self.recover(e)?;
            }
        }
        Ok(())
    }

    /// Bootstrap a pair at most once, ensure its tokens and volume seed.
    async fn ensure_pair_ready(
        &mut self,
        address: &str,
        pin: Option<u64>,
        block_number: u64,
        observed_at: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        let Some(state) = self.registry.get(address) else {
            return Ok(());
        };
        let info = state.info.clone();
        let needs_bootstrap = !state.is_bootstrapped();
        let needs_volume = !state.volume_seeded;

        self.ensure_tokens(&info, observed_at).await?;

        if needs_bootstrap {
            self.bootstrap_pair(&info, pin, block_number, observed_at)
                .await?;
        }
        if needs_volume {
            self.seed_volume(&info.address, observed_at).await?;
        }
        Ok(())
    }

    async fn bootstrap_pair(
        &mut self,
        info: &PairInfo,
        pin: Option<u64>,
        block_number: u64,
        observed_at: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        let (reserves, total_supply) = futures::try_join!(
            self.reader.get_reserves(&info.address, pin),
            self.reader.get_total_supply(&info.address, pin),
        )
        .map_err(|e| IndexerError::state_sync(&info.address, block_number, e))?;

        let symbol = |token: &str| {
            self.tokens
                .get(token)
                .map(|t| t.symbol.clone())
                .unwrap_or_default()
        };
        let pair = Pair::bootstrap(
            info,
            symbol(&info.token0),
            symbol(&info.token1),
            reserves,
            total_supply,
            block_number,
            observed_at,
        );

        info!(
            "Bootstrapped pair {} ({}/{}) at block {}",
            info.address, pair.token0_symbol, pair.token1_symbol, block_number
        );

        if let Some(state) = self.registry.get_mut(&info.address) {
            if state.entity.is_none() {
                state.entity = Some(pair);
                state.is_dirty = true;
            }
        }
        Ok(())
    }

    /// Load unseen tokens (store first, then contract reads) and seed their
    /// initial price.
    async fn ensure_tokens(
        &mut self,
        info: &PairInfo,
        observed_at: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        let mut missing: Vec<String> = [&info.token0, &info.token1]
            .into_iter()
            .filter(|t| !self.tokens.contains_key(*t))
            .cloned()
            .collect();
        missing.dedup();

        if !missing.is_empty() {
            let stored = self
                .store
                .get_tokens(&missing)
                .await
                .map_err(IndexerError::Persistence)?;
            for token in stored {
                self.tokens.insert(token.address.clone(), token);
            }

            let unseen: Vec<&String> = missing
                .iter()
                .filter(|t| !self.tokens.contains_key(*t))
                .collect();

            if !unseen.is_empty() {
                let reader = &self.reader;
                let fetched = try_join_all(
                    unseen
                        .iter()
                        .map(|address| fetch_token(reader, address, observed_at)),
                )
                .await?;

                for token in fetched {
                    debug!("New token {} ({})", token.address, token.symbol);
                    self.dirty_tokens.insert(token.address.clone());
                    self.tokens.insert(token.address.clone(), token);
                }
            }
        }

        for token in [&info.token0, &info.token1] {
            if !self.price_seeded.insert(token.clone()) {
                continue;
            }
            if self.price_calculator.is_stablecoin(token) {
                self.token_prices.insert(token.clone(), 1.0);
                continue;
            }
            let snapshot = self
                .store
                .get_price_snapshot_at_or_before(token, observed_at)
                .await
                .map_err(IndexerError::Persistence)?;
            if let Some(snapshot) = snapshot {
                self.token_prices.insert(token.clone(), snapshot.price_usd);
            }
        }

        Ok(())
    }

    /// Seed the working set with the latest durable bucket, or a fresh empty
    /// one at `observed_at`.
    async fn seed_volume(
        &mut self,
        address: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        let latest = self
            .store
            .get_latest_volume_snapshot(address, VolumeInterval::Hourly)
            .await
            .map_err(IndexerError::Persistence)?;

        let Some(state) = self.registry.get_mut(address) else {
            return Ok(());
        };
        match latest {
            Some(bucket) => state.adopt_bucket(bucket),
            None => {
                let bucket = PairVolumeSnapshot::empty(
                    address,
                    VolumeInterval::Hourly,
                    hourly_bucket_start(observed_at),
                    observed_at,
                );
                let id = bucket.id.clone();
                state.adopt_bucket(bucket);
                state.mark_bucket_dirty(id);
            },
        }
        state.volume_seeded = true;
        Ok(())
    }

    /// The bucket covering `timestamp` if it is not already in memory:
    /// the durable copy when there is one, otherwise a fresh empty bucket.
    async fn load_bucket(
        &self,
        address: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<PairVolumeSnapshot>, IndexerError> {
        let id = hourly_snapshot_id(address, timestamp);
        if self
            .registry
            .get(address)
            .is_some_and(|s| s.bucket(&id).is_some())
        {
            return Ok(None);
        }

        let durable = self
            .store
            .get_volume_snapshot(&id)
            .await
            .map_err(IndexerError::Persistence)?;

        Ok(Some(durable.unwrap_or_else(|| {
            PairVolumeSnapshot::empty(
                address,
                VolumeInterval::Hourly,
                hourly_bucket_start(timestamp),
                timestamp,
            )
        })))
    }

    async fn run_hourly_maintenance(&mut self, block: &Block) -> Result<(), IndexerError> {
        let now = block_time(block.timestamp);

        for address in self.registry.addresses() {
            let due = match self.registry.get(&address) {
                Some(state) if state.is_bootstrapped() => {
                    state
                        .last_price_and_volume_update
                        .map_or(true, |last| (now - last).num_seconds() >= SECONDS_PER_HOUR)
                },
                _ => false,
            };

            if due {
                if let Err(e) = self.hourly_tick(&address, block.number, now).await {
                    self.recover(e)?;
                }
            }
        }
        Ok(())
    }

    /// Refresh prices and supplies and open this hour's bucket, so a data
    /// point exists even when the pair did not trade.
    async fn hourly_tick(
        &mut self,
        address: &str,
        block_number: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        let Some(info) = self.registry.get(address).map(|s| s.info.clone()) else {
            return Ok(());
        };
        debug!("Hourly maintenance for pair {} at block {}", address, block_number);

        let bucket = self.load_bucket(address, now).await?;
        self.refresh_token_supplies(&info, block_number, now).await;
        self.refresh_prices(&info, block_number, now).await?;

        if let Some(state) = self.registry.get_mut(address) {
            if let Some(bucket) = bucket {
                state.adopt_bucket(bucket);
            }
            state.mark_bucket_dirty(hourly_snapshot_id(address, now));
            state.last_price_and_volume_update = Some(now);
            if let Some(pair) = state.entity.as_mut() {
                pair.updated_at = now;
            }
            state.is_dirty = true;
        }
        Ok(())
    }

    /// Re-read both tokens' total supply. Failures keep the previous value.
    async fn refresh_token_supplies(&mut self, info: &PairInfo, block_number: u64, now: DateTime<Utc>) {
        let (supply0, supply1) = futures::join!(
            self.reader.get_total_supply(&info.token0, Some(block_number)),
            self.reader.get_total_supply(&info.token1, Some(block_number)),
        );

        for (address, supply) in [(&info.token0, supply0), (&info.token1, supply1)] {
            match supply {
                Ok(supply) => {
                    if let Some(token) = self.tokens.get_mut(address) {
                        if token.total_supply != Some(supply) {
                            token.total_supply = Some(supply);
                            token.updated_at = now;
                            self.dirty_tokens.insert(address.clone());
                        }
                    }
                },
                Err(e) => warn!(
                    "Total supply refresh failed for token {} at block {}: {:#}",
                    address, block_number, e
                ),
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: &RawEvent,
        block: &Block,
        known_ids: &mut FxHashSet<String>,
    ) -> Result<EventOutcome, IndexerError> {
        let kind = if event.address == self.factory_address {
            ContractKind::Factory
        } else if self.registry.contains(&event.address) {
            ContractKind::Pair
        } else {
            return Ok(EventOutcome::Ignored);
        };

        let decoded = match self.decoder.decode(kind, event) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(EventOutcome::Ignored),
            Err(source) => {
                return Err(IndexerError::Decode {
                    address: event.address.clone(),
                    block_number: block.number,
                    source,
                })
            },
        };

        match decoded {
            DecodedEvent::Factory(FactoryEvent::PairCreated(created)) => {
                self.on_pair_created(&created, block).await?;
                Ok(EventOutcome::Ignored)
            },
            DecodedEvent::Pair(PairEvent::Unrecognized { method })
            | DecodedEvent::Factory(FactoryEvent::Unrecognized { method }) => {
                debug!(
                    "Ignoring {} {} event from {} at block {}",
                    kind, method, event.address, block.number
                );
                Ok(EventOutcome::Ignored)
            },
            DecodedEvent::Pair(pair_event) => {
                self.on_pair_event(pair_event, event, block, known_ids)
                    .await
            },
        }
    }

    async fn on_pair_created(
        &mut self,
        created: &PairCreated,
        block: &Block,
    ) -> Result<(), IndexerError> {
        let info = PairInfo::new(
            &hex_encode(created.pair.as_slice()),
            &hex_encode(created.token0.as_slice()),
            &hex_encode(created.token1.as_slice()),
        );

        if !self.registry.contains(&info.address) {
            info!(
                "New pair {} ({} / {}) at block {}",
                info.address, info.token0, info.token1, block.number
            );
            self.batch_pairs.insert(info.address.clone());
        }
        let address = self.registry.register_pair(info).info.address.clone();

        self.ensure_pair_ready(
            &address,
            Some(block.number),
            block.number,
            block_time(block.timestamp),
        )
        .await
    }

    async fn on_pair_event(
        &mut self,
        event: PairEvent,
        raw: &RawEvent,
        block: &Block,
        known_ids: &mut FxHashSet<String>,
    ) -> Result<EventOutcome, IndexerError> {
        let now = block_time(block.timestamp);
        let address = raw.address.as_str();

        self.ensure_pair_ready(address, Some(block.number), block.number, now)
            .await?;
        let Some(info) = self.registry.get(address).map(|s| s.info.clone()) else {
            return Ok(EventOutcome::Ignored);
        };

        let id = Transaction::message_id(&raw.tx_hash, raw.log_index);
        let mut tx = match &event {
            PairEvent::Swap(e) => Transaction::from_swap(id, &info, e, block.number, now),
            PairEvent::LiquidityAdded(e) => {
                Transaction::from_liquidity_added(id, &info, e, block.number, now)
            },
            PairEvent::LiquidityRemoved(e) => {
                Transaction::from_liquidity_removed(id, &info, e, block.number, now)
            },
            PairEvent::Unrecognized { .. } => return Ok(EventOutcome::Ignored),
        };
        self.attribute_usd(&mut tx, &info);

        // Post-event state always comes from the contract, never the payload
        let (reserves, total_supply) = futures::try_join!(
            self.reader.get_reserves(address, Some(block.number)),
            self.reader.get_total_supply(address, Some(block.number)),
        )
        .map_err(|e| IndexerError::state_sync(address, block.number, e))?;

        let replayed = known_ids.contains(&tx.id);
        let records_volume = tx.tx_type == TransactionType::Swap && !replayed;
        let bucket = if records_volume {
            self.load_bucket(address, now).await?
        } else {
            None
        };

        if let Some(state) = self.registry.get_mut(address) {
            if let Some(pair) = state.entity.as_mut() {
                pair.sync_state(reserves, total_supply, block.number, now);
            }
            state.is_dirty = true;

            if records_volume {
                if let Some(bucket) = bucket {
                    state.adopt_bucket(bucket);
                }
                let bucket_id = create_or_update_hourly_snapshot(
                    &mut state.volume_snapshots,
                    address,
                    tx.value_usd(),
                    now,
                );
                state.mark_bucket_dirty(bucket_id);
            }

            if !replayed {
                known_ids.insert(tx.id.clone());
                state.transactions.push(tx);
            }
        }

        self.refresh_prices(&info, block.number, now).await?;

        Ok(if replayed {
            EventOutcome::Replayed
        } else {
            EventOutcome::Recorded
        })
    }

    /// Fill the USD fields from current prices. Unknown prices leave the
    /// field unset.
    fn attribute_usd(&self, tx: &mut Transaction, info: &PairInfo) {
        let usd = |token: &str, amount: Option<U256>| -> Option<f64> {
            let decimals = self.tokens.get(token)?.decimals;
            amount_to_usd(amount?, decimals, self.token_prices.get(token).copied())
        };

        match tx.tx_type {
            TransactionType::Swap => {
                tx.amount_in_usd = tx.token_in.as_deref().and_then(|t| usd(t, tx.amount_in));
                tx.amount_out_usd = tx.token_out.as_deref().and_then(|t| usd(t, tx.amount_out));
            },
            TransactionType::AddLiquidity | TransactionType::RemoveLiquidity => {
                tx.amount_a_usd = usd(&info.token0, tx.amount_a);
                tx.amount_b_usd = usd(&info.token1, tx.amount_b);
            },
        }
    }

    /// Recompute both token prices of a pair and snapshot the ones known.
    async fn refresh_prices(
        &mut self,
        info: &PairInfo,
        block_number: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        let mut updated = Vec::with_capacity(2);

        for token in [&info.token0, &info.token1] {
            let price = {
                let pairs = self.registry.pairs_with_token(token);
                self.price_calculator.calculate_token_price(
                    token,
                    &pairs,
                    &self.tokens,
                    &self.token_prices,
                )
            };
            if let Some(price) = price {
                self.token_prices.insert(token.clone(), price);
                updated.push((token.clone(), price));
            }
        }

        self.snapshot_prices(&updated, block_number, now).await
    }

    /// Tokens without a price retry until no further token can be priced,
    /// so the result does not depend on event order within the batch.
    async fn converge_prices(
        &mut self,
        block_number: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        loop {
            let mut updated = Vec::new();

            for token in self.registry.tokens() {
                if self.token_prices.contains_key(&token) {
                    continue;
                }
                let price = {
                    let pairs = self.registry.pairs_with_token(&token);
                    self.price_calculator.calculate_token_price(
                        &token,
                        &pairs,
                        &self.tokens,
                        &self.token_prices,
                    )
                };
                if let Some(price) = price {
                    self.token_prices.insert(token.clone(), price);
                    updated.push((token, price));
                }
            }

            if updated.is_empty() {
                return Ok(());
            }
            debug!("Priced {} more tokens at block {}", updated.len(), block_number);
            self.snapshot_prices(&updated, block_number, now).await?;
        }
    }

    async fn snapshot_prices(
        &mut self,
        updated: &[(String, f64)],
        block_number: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        if updated.is_empty() {
            return Ok(());
        }

        let cutoff_1h = now - Duration::hours(1);
        let cutoff_24h = now - Duration::hours(24);
        let store = &self.store;

        let durable = try_join_all(updated.iter().map(|(token, _)| async move {
            futures::try_join!(
                store.get_price_snapshot_at_or_before(token, cutoff_1h),
                store.get_price_snapshot_at_or_before(token, cutoff_24h),
            )
        }))
        .await
        .map_err(IndexerError::Persistence)?;

        for ((token, price), (prior_1h, prior_24h)) in updated.iter().zip(durable) {
            let Some(meta) = self.tokens.get(token) else {
                continue;
            };

            let snapshot = {
                let pending = self
                    .pending_price_snapshots
                    .values()
                    .filter(|s| &s.token_address == token);
                let history = prior_1h.iter().chain(prior_24h.iter()).chain(pending);
                let changes = PriceCalculator::calculate_price_changes(*price, now, history);
                PriceCalculator::prepare_token_price_snapshot(
                    meta,
                    Some(*price),
                    changes,
                    block_number,
                    now,
                )
            };

            if let Some(snapshot) = snapshot {
                self.pending_price_snapshots
                    .insert(snapshot.id.clone(), snapshot);
            }
        }
        Ok(())
    }

    /// Full recompute of the sliding windows for every volume-dirty pair,
    /// from durable buckets plus the in-memory ones.
    async fn recompute_volumes(&mut self, as_of: DateTime<Utc>) -> Result<(), IndexerError> {
        let since = as_of - Duration::seconds(WINDOW_1Y);

        for address in self.registry.addresses() {
            let needs = self
                .registry
                .get(&address)
                .is_some_and(|s| s.is_volume_dirty && s.is_bootstrapped());
            if !needs {
                continue;
            }

            let durable = self
                .store
                .get_volume_snapshots_since(&address, VolumeInterval::Hourly, since)
                .await
                .map_err(IndexerError::Persistence)?;

            let Some(state) = self.registry.get_mut(&address) else {
                continue;
            };

            let volumes = {
                let mut buckets: FxHashMap<&str, &PairVolumeSnapshot> =
                    durable.iter().map(|b| (b.id.as_str(), b)).collect();
                // In-memory buckets are newer than their durable copies
                for bucket in &state.volume_snapshots {
                    buckets.insert(bucket.id.as_str(), bucket);
                }
                calculate_volumes_from_snapshots(buckets.into_values(), as_of)
            };

            if let Some(pair) = state.entity.as_mut() {
                pair.apply_volumes(&volumes);
            }
            state.is_dirty = true;
        }
        Ok(())
    }

    fn recompute_tvl(&mut self) {
        for state in self.registry.states_mut() {
            let Some(pair) = state.entity.as_mut() else {
                continue;
            };
            let tvl = PriceCalculator::calculate_pair_tvl(
                pair,
                self.tokens.get(&pair.token0),
                self.tokens.get(&pair.token1),
                self.token_prices.get(&pair.token0).copied(),
                self.token_prices.get(&pair.token1).copied(),
            );
            if tvl != pair.tvl_usd {
                pair.tvl_usd = tvl;
                state.is_dirty = true;
            }
        }
    }

    fn collect_write_batch(&self, next_block: u64) -> WriteBatch {
        let mut batch = WriteBatch::default();

        for address in self.registry.addresses() {
            let Some(state) = self.registry.get(&address) else {
                continue;
            };
            if state.is_dirty {
                if let Some(pair) = &state.entity {
                    batch.pairs.push(pair.clone());
                }
            }
            batch.transactions.extend(state.transactions.iter().cloned());
            batch.volume_snapshots.extend(state.dirty_buckets().cloned());
        }

        let mut tokens: Vec<&String> = self.dirty_tokens.iter().collect();
        tokens.sort();
        batch.tokens = tokens
            .into_iter()
            .filter_map(|a| self.tokens.get(a).cloned())
            .collect();

        batch.price_snapshots = self.pending_price_snapshots.values().cloned().collect();
        batch
            .price_snapshots
            .sort_by(|a, b| a.id.cmp(&b.id));

        batch.checkpoint = Some(SyncCheckpoint::new(&self.factory_address, next_block));
        batch
    }

    fn clear_dirty(&mut self) {
        for state in self.registry.states_mut() {
            state.clear_dirty();
        }
        self.dirty_tokens.clear();
        self.pending_price_snapshots.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Recorded,
    Replayed,
    Ignored,
}

async fn fetch_token<R: ContractReader>(
    reader: &R,
    address: &str,
    observed_at: DateTime<Utc>,
) -> Result<Token, IndexerError> {
    let (symbol, name, decimals, total_supply) = futures::join!(
        reader.get_symbol(address),
        reader.get_name(address),
        reader.get_decimals(address),
        reader.get_total_supply(address, None),
    );

    let symbol = symbol.map_err(|e| IndexerError::state_sync(address, 0, e))?;
    let decimals = decimals.map_err(|e| IndexerError::state_sync(address, 0, e))?;

    Ok(Token::new(
        address,
        symbol,
        name.ok().flatten(),
        decimals,
        total_supply.ok(),
        observed_at,
    ))
}
