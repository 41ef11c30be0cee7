//! Error taxonomy for the ingestion engine.
//!
//! Derivation gaps (a price or TVL that cannot be computed yet) are not
//! errors and never show up here; they surface as `None` fields instead.

use thiserror::Error;

/// Failure to turn a raw log into a typed event.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unknown event selector {selector} for {service} contract")]
    UnknownSelector { service: &'static str, selector: String },
    #[error("malformed {method} payload: {source}")]
    Malformed {
        method: String,
        #[source]
        source: alloy::sol_types::Error,
    },
    #[error("invalid interface description: {0}")]
    InvalidInterface(String),
}

/// Top-level error raised while processing a batch.
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("decode error at block {block_number} (source {address}): {source}")]
    Decode {
        address: String,
        block_number: u64,
        #[source]
        source: DecodeError,
    },
    #[error("state sync failed for {address} at block {block_number}: {source:#}")]
    StateSync {
        address: String,
        block_number: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("persistence failed: {0:#}")]
    Persistence(#[source] anyhow::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    pub fn state_sync(address: &str, block_number: u64, source: anyhow::Error) -> Self {
        Self::StateSync {
            address: address.to_string(),
            block_number,
            source,
        }
    }
}
