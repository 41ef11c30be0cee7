use alloy::primitives::U256;
use chrono::{DateTime, Utc};

use crate::worker::volume_calculator::WindowVolumes;

/// Identity of a trading pair as announced by the factory.
///
/// token0/token1 keep the order the factory emitted; they are never re-sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairInfo {
    pub address: String,
    pub token0: String,
    pub token1: String,
}

impl PairInfo {
    pub fn new(address: &str, token0: &str, token1: &str) -> Self {
        // Always lowercase addresses for consistent comparisons
        Self {
            address: address.to_lowercase(),
            token0: token0.to_lowercase(),
            token1: token1.to_lowercase(),
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.token0 == token || self.token1 == token
    }
}

/// Liquidity pair metadata and current state (PostgreSQL)
///
/// Primary Key: address
/// Query Pattern: "Get reserves / TVL / volume for pair X"
#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub address: String,

    // Token pair metadata (denormalized, order fixed at creation)
    pub token0: String,
    pub token1: String,
    pub token0_symbol: String,
    pub token1_symbol: String,

    // On-chain state, always taken from a contract read
    pub reserve0: U256,
    pub reserve1: U256,
    pub total_supply: U256,

    // Sliding-window volume (reference currency), recomputed from hourly buckets
    pub volume_1h: f64,
    pub volume_24h: f64,
    pub volume_7d: f64,
    pub volume_30d: f64,
    pub volume_1y: f64,

    pub tvl_usd: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Block of the last state re-sync.
    pub block_number: u64,
}

impl Pair {
    /// Bootstrap a pair from its first contract reads: zero volume and TVL,
    /// created at the block that first observed it.
    pub fn bootstrap(
        info: &PairInfo,
        token0_symbol: String,
        token1_symbol: String,
        reserves: (U256, U256),
        total_supply: U256,
        block_number: u64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            address: info.address.clone(),
            token0: info.token0.clone(),
            token1: info.token1.clone(),
            token0_symbol,
            token1_symbol,
            reserve0: reserves.0,
            reserve1: reserves.1,
            total_supply,
            volume_1h: 0.0,
            volume_24h: 0.0,
            volume_7d: 0.0,
            volume_30d: 0.0,
            volume_1y: 0.0,
            tvl_usd: 0.0,
            created_at: observed_at,
            updated_at: observed_at,
            block_number,
        }
    }

    pub fn info(&self) -> PairInfo {
        PairInfo {
            address: self.address.clone(),
            token0: self.token0.clone(),
            token1: self.token1.clone(),
        }
    }

    /// Apply a fresh authoritative read of reserves and LP supply.
    pub fn sync_state(
        &mut self,
        reserves: (U256, U256),
        total_supply: U256,
        block_number: u64,
        at: DateTime<Utc>,
    ) {
        self.reserve0 = reserves.0;
        self.reserve1 = reserves.1;
        self.total_supply = total_supply;
        self.block_number = block_number;
        self.updated_at = at;
    }

    pub fn apply_volumes(&mut self, volumes: &WindowVolumes) {
        self.volume_1h = volumes.volume_1h;
        self.volume_24h = volumes.volume_24h;
        self.volume_7d = volumes.volume_7d;
        self.volume_30d = volumes.volume_30d;
        self.volume_1y = volumes.volume_1y;
    }

    /// Reserve of `token` and of its counter-token, if `token` is in this pair.
    pub fn reserves_for(&self, token: &str) -> Option<(U256, U256, &str)> {
        if self.token0 == token {
            Some((self.reserve0, self.reserve1, &self.token1))
        } else if self.token1 == token {
            Some((self.reserve1, self.reserve0, &self.token0))
        } else {
            None
        }
    }
}
