use alloy::primitives::U256;
use chrono::{DateTime, Utc};

/// Fungible token metadata (PostgreSQL)
///
/// Primary Key: address
/// Query Pattern: "Get token info for address X"
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub address: String,

    // On-chain metadata (immutable after first fetch)
    pub symbol: String,
    pub name: Option<String>,
    pub decimals: u8,

    // Refreshed on hourly maintenance
    pub total_supply: Option<U256>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    /// Constructor for freshly read metadata (used by the contract reader)
    pub fn new(
        address: &str,
        symbol: String,
        name: Option<String>,
        decimals: u8,
        total_supply: Option<U256>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            // Always lowercase addresses for consistent comparisons
            address: address.to_lowercase(),
            symbol,
            name,
            decimals,
            total_supply,
            created_at,
            updated_at: created_at,
        }
    }
}
