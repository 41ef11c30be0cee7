use std::time::{Duration, Instant};

use anyhow::Context;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    db::store::Store,
    worker::{block_source::BlockSource, contract_reader::ContractReader, engine::Engine},
};

/// Interval for logging progress updates (10 seconds)
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Drives the engine from a block source, one batch at a time.
///
/// Resumes from the durable checkpoint. When the source is drained the loop
/// sleeps for the tip poll interval and asks again. Source errors re-seek to
/// the last committed block; engine errors stop the run.
pub struct Indexer<B, R, S> {
    source: B,
    engine: Engine<R, S>,
    start_block: u64,
    tip_poll_interval: Duration,
}

impl<B: BlockSource, R: ContractReader, S: Store> Indexer<B, R, S> {
    pub fn new(
        source: B,
        engine: Engine<R, S>,
        start_block: u64,
        tip_poll_interval_milliseconds: u64,
    ) -> Self {
        Self {
            source,
            engine,
            start_block,
            tip_poll_interval: Duration::from_millis(tip_poll_interval_milliseconds),
        }
    }

    pub fn engine(&self) -> &Engine<R, S> {
        &self.engine
    }

    pub async fn run(&mut self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        let mut committed = self
            .engine
            .resume_block(self.start_block)
            .await
            .context("Failed to read sync checkpoint")?;
        self.source.seek(committed);
        info!("Indexer resuming from block {}", committed);

        let mut last_progress_log = Instant::now();
        let mut batches = 0usize;
        let mut transactions = 0usize;

        loop {
            if cancellation_token.is_cancelled() {
                info!("Indexer received cancellation signal at block {}", committed);
                break;
            }

            let next = tokio::select! {
                _ = cancellation_token.cancelled() => continue,
                next = self.source.next_batch() => next,
            };

            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    // Caught up with the tip
                    tokio::select! {
                        _ = cancellation_token.cancelled() => {},
                        _ = tokio::time::sleep(self.tip_poll_interval) => {},
                    }
                    continue;
                },
                Err(e) => {
                    warn!("Block source failed at block {}: {:#}. Retrying.", committed, e);
                    self.source.seek(committed);
                    tokio::time::sleep(self.tip_poll_interval).await;
                    continue;
                },
            };

            // Persistence and strict-mode failures end the run; a restart
            // replays from the last checkpoint
            let summary = self
                .engine
                .process_batch(&batch)
                .await
                .with_context(|| format!("Failed to process batch ending at {}", batch.next_block))?;

            committed = summary.next_block;
            batches += 1;
            transactions += summary.transactions;

            if summary.skipped > 0 {
                warn!(
                    "Skipped {} events in batch ending at block {}",
                    summary.skipped, summary.next_block
                );
            }

            if last_progress_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                info!(
                    "Synced to block {} ({} batches, {} transactions, {} pairs tracked)",
                    committed,
                    batches,
                    transactions,
                    self.engine.registry().len()
                );
                last_progress_log = Instant::now();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeploymentMode, IndexerSettings, PricingSettings},
        db::memory::MemoryStore,
        worker::{
            block_source::{Block, BlockBatch, StaticBlockSource},
            contract_reader::scripted::ScriptedReader,
            decoder::Decoder,
        },
    };

    const FACTORY: &str = "0x00000000000000000000000000000000000000ff";

    fn engine(store: MemoryStore) -> Engine<ScriptedReader, MemoryStore> {
        let indexer = IndexerSettings {
            hypersync_url: "http://localhost:1".into(),
            hypersync_bearer_token: String::new(),
            rpc_url: "http://localhost:2".into(),
            factory_address: FACTORY.into(),
            start_block: 0,
            tip_poll_interval_milliseconds: 5,
            mode: DeploymentMode::Strict,
            discover_pairs_on_start: false,
            abi_dir: None,
            log_level: "info".into(),
        };
        Engine::new(
            ScriptedReader::new(),
            store,
            Decoder::builtin().unwrap(),
            &indexer,
            &PricingSettings::default(),
        )
        .unwrap()
    }

    fn batches() -> Vec<BlockBatch> {
        [10u64, 20, 30]
            .into_iter()
            .map(|n| BlockBatch {
                blocks: vec![Block {
                    number: n,
                    timestamp: 1_700_000_000 + n,
                    events: vec![],
                }],
                next_block: n + 1,
            })
            .collect()
    }

    async fn run_until_drained(
        indexer: &mut Indexer<StaticBlockSource, ScriptedReader, MemoryStore>,
    ) {
        let token = CancellationToken::new();
        let (result, _) = tokio::join!(indexer.run(token.clone()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        result.unwrap();
    }

    #[tokio::test]
    async fn test_run_commits_every_batch_and_stops_on_cancel() {
        let mut indexer = Indexer::new(
            StaticBlockSource::new(batches()),
            engine(MemoryStore::new()),
            0,
            5,
        );
        run_until_drained(&mut indexer).await;

        let store = indexer.engine().store();
        assert_eq!(store.save_calls(), 3);
        let checkpoint = store.get_sync_checkpoint(FACTORY).await.unwrap().unwrap();
        assert_eq!(checkpoint.next_block, 31);
    }

    #[tokio::test]
    async fn test_run_resumes_from_checkpoint() {
        let mut first = Indexer::new(
            StaticBlockSource::new(batches().into_iter().take(2).collect()),
            engine(MemoryStore::new()),
            0,
            5,
        );
        run_until_drained(&mut first).await;
        let store = first.engine.into_store();
        assert_eq!(store.save_calls(), 2);

        // Restart with the full history: only the unseen batch runs
        let mut second = Indexer::new(StaticBlockSource::new(batches()), engine(store), 0, 5);
        run_until_drained(&mut second).await;

        let store = second.engine().store();
        assert_eq!(store.save_calls(), 3);
        let checkpoint = store.get_sync_checkpoint(FACTORY).await.unwrap().unwrap();
        assert_eq!(checkpoint.next_block, 31);
    }
}
