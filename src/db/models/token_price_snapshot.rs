use chrono::{DateTime, Utc};

/// Point-in-time token price observation.
///
/// Identity: token + block number. Written once per price-affecting event
/// (or hourly tick) and never mutated afterwards.
///
/// Query Patterns:
///   - "Get price history for token X over 24h/7d"
///   - "Get the price of token X as of time T"
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPriceSnapshot {
    pub id: String,
    pub token_address: String,
    pub price_usd: f64,
    /// Fully-diluted valuation: total supply (decimal adjusted) × price.
    pub fdv_usd: Option<f64>,
    pub price_change_1h: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
}

impl TokenPriceSnapshot {
    pub fn snapshot_id(token_address: &str, block_number: u64) -> String {
        format!("{}:{}", token_address, block_number)
    }
}
