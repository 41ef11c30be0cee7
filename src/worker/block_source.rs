//! Ordered block/log supply.
//!
//! [`HypersyncBlockSource`] streams logs from HyperSync, filtered by the event
//! selectors of the handled pair and factory events, and regroups them into
//! blocks. Every block header of a streamed range is requested so each range
//! ends on its newest block even when it holds no matching logs. Retries and
//! reconnects are handled by the HyperSync client and by re-opening the
//! stream; the engine never sees them.

use std::{sync::Arc, time::Duration};

#[cfg(test)]
use std::collections::VecDeque;

use alloy::primitives::{Bytes, B256, U256};
use anyhow::Context;
use hypersync_client::{
    net_types::{BlockField, LogField, LogFilter, Query},
    Client, ClientConfig, QueryResponse, SerializationFormat, StreamConfig,
};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::{config::IndexerSettings, utils::hex_encode};

/// Timeout for receiving data from the HyperSync stream (5 minutes).
/// If nothing arrives within this time, the stream is re-opened.
const STREAM_RECV_TIMEOUT: Duration = Duration::from_secs(300);

/// One contract log as delivered by the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Emitting contract, lowercase `0x` hex.
    pub address: String,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u32,
    /// Set on logs dropped by a reorg.
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub number: u64,
    /// Unix seconds.
    pub timestamp: u64,
    pub events: Vec<RawEvent>,
}

/// Consecutive blocks, in chain order, plus the block to resume from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockBatch {
    pub blocks: Vec<Block>,
    pub next_block: u64,
}

#[allow(async_fn_in_trait)]
pub trait BlockSource {
    /// Restart delivery at `block`.
    fn seek(&mut self, block: u64);

    /// Next batch in order. `None` means the source is drained for now
    /// (caught up with the tip); the caller polls again later.
    async fn next_batch(&mut self) -> anyhow::Result<Option<BlockBatch>>;
}

pub struct HypersyncBlockSource {
    client: Arc<Client>,
    filters: LogFilter,
    next_block: u64,
    stream: Option<mpsc::Receiver<anyhow::Result<QueryResponse>>>,
}

impl HypersyncBlockSource {
    pub fn new(settings: &IndexerSettings, selectors: &[B256]) -> anyhow::Result<Self> {
        let url = settings
            .hypersync_url
            .parse()
            .context("Invalid HyperSync URL")?;

        let client_config = ClientConfig {
            serialization_format: SerializationFormat::CapnProto {
                should_cache_queries: false,
            },
            http_req_timeout_millis: 120_000,
            url,
            api_token: settings.hypersync_bearer_token.clone(),
            max_num_retries: 5,
            ..Default::default()
        };

        let client =
            Arc::new(Client::new(client_config).context("Failed to create HyperSync client")?);

        let topic0: Vec<[u8; 32]> = selectors.iter().map(|s| s.0).collect();
        let filters = LogFilter::all().and_topic0(topic0)?;

        Ok(Self {
            client,
            filters,
            next_block: settings.start_block,
            stream: None,
        })
    }

    async fn open_stream(&self) -> anyhow::Result<mpsc::Receiver<anyhow::Result<QueryResponse>>> {
        let query = Query::new()
            .from_block(self.next_block)
            .where_logs(self.filters.clone())
            .select_block_fields([BlockField::Number, BlockField::Timestamp])
            .include_all_blocks()
            .select_log_fields([
                LogField::BlockNumber,
                LogField::TransactionHash,
                LogField::LogIndex,
                LogField::Address,
                LogField::Data,
                LogField::Removed,
                LogField::Topic0,
                LogField::Topic1,
                LogField::Topic2,
                LogField::Topic3,
            ]);

        debug!("Opening HyperSync stream from block {}", self.next_block);

        self.client
            .stream(query, StreamConfig::default())
            .await
            .context("Failed to open HyperSync stream")
    }

    fn convert(res: QueryResponse) -> anyhow::Result<BlockBatch> {
        let block_timestamps: FxHashMap<u64, u64> = res
            .data
            .blocks
            .iter()
            .flatten()
            .filter_map(|b| {
                let n = b.number?;
                let t = U256::from_be_slice(b.timestamp.as_ref()?).to::<u64>();
                Some((n, t))
            })
            .collect();

        let events = res
            .data
            .logs
            .into_iter()
            .flatten()
            .map(|log| -> anyhow::Result<RawEvent> {
                let block_number: u64 = log
                    .block_number
                    .context("Log without block number")?
                    .into();
                let log_index: u64 = log.log_index.context("Log without log index")?.into();
                let log_index = u32::try_from(log_index).with_context(|| {
                    format!("Log index {} out of range at block {}", log_index, block_number)
                })?;

                let topics: Vec<B256> = log
                    .topics
                    .iter()
                    .flatten()
                    .map(|t| B256::from_slice(t.as_ref()))
                    .collect();

                Ok(RawEvent {
                    address: log
                        .address
                        .as_ref()
                        .map(|a| hex_encode(a.as_ref()))
                        .unwrap_or_default(),
                    topics,
                    data: log
                        .data
                        .as_ref()
                        .map(|d| d.as_ref().to_vec())
                        .unwrap_or_default()
                        .into(),
                    block_number,
                    tx_hash: log
                        .transaction_hash
                        .as_ref()
                        .map(|h| hex_encode(h.as_ref()))
                        .unwrap_or_default(),
                    log_index,
                    removed: log.removed.unwrap_or(false),
                })
            })
            .collect::<anyhow::Result<Vec<RawEvent>>>()?;

        Ok(BlockBatch {
            blocks: group_into_blocks(events, &block_timestamps)?,
            next_block: res.next_block,
        })
    }
}

impl BlockSource for HypersyncBlockSource {
    fn seek(&mut self, block: u64) {
        self.next_block = block;
        self.stream = None;
    }

    async fn next_batch(&mut self) -> anyhow::Result<Option<BlockBatch>> {
        if self.stream.is_none() {
            self.stream = Some(self.open_stream().await?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let received = match tokio::time::timeout(STREAM_RECV_TIMEOUT, stream.recv()).await {
            Ok(received) => received,
            Err(_) => {
                warn!(
                    "HyperSync stream recv timeout after {:?}, reopening",
                    STREAM_RECV_TIMEOUT
                );
                self.stream = None;
                return Ok(None);
            },
        };

        match received {
            Some(res) => {
                let batch = Self::convert(res.context("Stream error")?)?;
                self.next_block = batch.next_block;
                Ok(Some(batch))
            },
            None => {
                // Stream drained: caught up with the tip
                self.stream = None;
                Ok(None)
            },
        }
    }
}

/// Group logs (already in chain order) into blocks, keeping log order.
///
/// The range is closed with an empty block for the newest header seen, so
/// stretches without matching logs still carry time forward for hourly
/// maintenance. A log whose block has no timestamp is an error.
pub fn group_into_blocks<I>(
    events: I,
    timestamps: &FxHashMap<u64, u64>,
) -> anyhow::Result<Vec<Block>>
where
    I: IntoIterator<Item = RawEvent>,
{
    let mut blocks: Vec<Block> = Vec::new();

    for event in events {
        match blocks.last_mut() {
            Some(block) if block.number == event.block_number => block.events.push(event),
            _ => {
                let timestamp = timestamps
                    .get(&event.block_number)
                    .copied()
                    .with_context(|| format!("No timestamp for block {}", event.block_number))?;
                blocks.push(Block {
                    number: event.block_number,
                    timestamp,
                    events: vec![event],
                });
            },
        }
    }

    if let Some((&number, &timestamp)) = timestamps.iter().max_by_key(|(n, _)| **n) {
        if blocks.last().map_or(true, |b| b.number < number) {
            blocks.push(Block {
                number,
                timestamp,
                events: vec![],
            });
        }
    }

    Ok(blocks)
}

/// Pre-recorded batches, replayed in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticBlockSource {
    batches: VecDeque<BlockBatch>,
}

#[cfg(test)]
impl StaticBlockSource {
    pub fn new(batches: Vec<BlockBatch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

#[cfg(test)]
impl BlockSource for StaticBlockSource {
    fn seek(&mut self, block: u64) {
        self.batches
            .retain(|b| b.blocks.last().map_or(true, |last| last.number >= block));
    }

    async fn next_batch(&mut self) -> anyhow::Result<Option<BlockBatch>> {
        Ok(self.batches.pop_front())
    }
}
