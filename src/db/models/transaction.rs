use alloy::primitives::U256;
use chrono::{DateTime, Utc};

use crate::{
    abis::{LiquidityAdded, LiquidityRemoved, Swap},
    db::models::PairInfo,
    utils::hex_encode,
};

/// Kind of an observed pair transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    Swap,
    AddLiquidity,
    RemoveLiquidity,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Swap => "SWAP",
            TransactionType::AddLiquidity => "ADD_LIQUIDITY",
            TransactionType::RemoveLiquidity => "REMOVE_LIQUIDITY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SWAP" => Some(TransactionType::Swap),
            "ADD_LIQUIDITY" => Some(TransactionType::AddLiquidity),
            "REMOVE_LIQUIDITY" => Some(TransactionType::RemoveLiquidity),
            _ => None,
        }
    }
}

/// One swap or liquidity add/remove (PostgreSQL)
///
/// Primary Key: id (originating message id = `{tx_hash}-{log_index}`)
/// Query Patterns:
///   - "Get transactions for pair X ordered by time"
///   - "Get transactions of user Y"
///
/// Immutable once created. USD fields stay `None` while the corresponding
/// token has no known price.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub pair_address: String,
    pub tx_type: TransactionType,
    pub user: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,

    // Liquidity operations
    pub amount_a: Option<U256>,
    pub amount_b: Option<U256>,
    pub liquidity: Option<U256>,

    // Swaps
    pub amount_in: Option<U256>,
    pub amount_out: Option<U256>,
    pub token_in: Option<String>,
    pub token_out: Option<String>,

    // Reference-currency values
    pub amount_a_usd: Option<f64>,
    pub amount_b_usd: Option<f64>,
    pub amount_in_usd: Option<f64>,
    pub amount_out_usd: Option<f64>,
}

impl Transaction {
    pub fn message_id(tx_hash: &str, log_index: u32) -> String {
        format!("{}-{}", tx_hash, log_index)
    }

    fn empty(
        id: String,
        pair: &PairInfo,
        tx_type: TransactionType,
        user: String,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pair_address: pair.address.clone(),
            tx_type,
            user,
            block_number,
            timestamp,
            amount_a: None,
            amount_b: None,
            liquidity: None,
            amount_in: None,
            amount_out: None,
            token_in: None,
            token_out: None,
            amount_a_usd: None,
            amount_b_usd: None,
            amount_in_usd: None,
            amount_out_usd: None,
        }
    }

    /// Swap: the direction flag picks which side of the pair went in.
    pub fn from_swap(
        id: String,
        pair: &PairInfo,
        event: &Swap,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (token_in, token_out) = if event.zeroForOne {
            (&pair.token0, &pair.token1)
        } else {
            (&pair.token1, &pair.token0)
        };

        let mut tx = Self::empty(
            id,
            pair,
            TransactionType::Swap,
            hex_encode(event.to.as_slice()),
            block_number,
            timestamp,
        );
        tx.amount_in = Some(event.amountIn);
        tx.amount_out = Some(event.amountOut);
        tx.token_in = Some(token_in.clone());
        tx.token_out = Some(token_out.clone());
        tx
    }

    pub fn from_liquidity_added(
        id: String,
        pair: &PairInfo,
        event: &LiquidityAdded,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut tx = Self::empty(
            id,
            pair,
            TransactionType::AddLiquidity,
            hex_encode(event.provider.as_slice()),
            block_number,
            timestamp,
        );
        tx.amount_a = Some(event.amountA);
        tx.amount_b = Some(event.amountB);
        tx.liquidity = Some(event.liquidity);
        tx
    }

    pub fn from_liquidity_removed(
        id: String,
        pair: &PairInfo,
        event: &LiquidityRemoved,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut tx = Self::empty(
            id,
            pair,
            TransactionType::RemoveLiquidity,
            hex_encode(event.provider.as_slice()),
            block_number,
            timestamp,
        );
        tx.amount_a = Some(event.amountA);
        tx.amount_b = Some(event.amountB);
        tx.liquidity = Some(event.liquidity);
        tx
    }

    /// Canonical value for volume accounting: input side for swaps, both
    /// sides for liquidity events. `None` when a needed price is unknown.
    pub fn value_usd(&self) -> Option<f64> {
        match self.tx_type {
            TransactionType::Swap => self.amount_in_usd,
            TransactionType::AddLiquidity | TransactionType::RemoveLiquidity => {
                Some(self.amount_a_usd? + self.amount_b_usd?)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    fn pair() -> PairInfo {
        PairInfo::new("0x00000000000000000000000000000000000000aa", "0xA0", "0xB0")
    }

    #[test]
    fn test_swap_direction_selects_tokens() {
        let event = Swap {
            sender: Address::ZERO,
            zeroForOne: false,
            amountIn: U256::from(5u64),
            amountOut: U256::from(7u64),
            to: Address::repeat_byte(0x11),
        };
        let tx = Transaction::from_swap("h-1".into(), &pair(), &event, 10, block_zero());
        assert_eq!(tx.token_in.as_deref(), Some("0xb0"));
        assert_eq!(tx.token_out.as_deref(), Some("0xa0"));
        assert_eq!(tx.amount_in, Some(U256::from(5u64)));
        assert_eq!(tx.user, hex_encode(Address::repeat_byte(0x11).as_slice()));
        assert_eq!(tx.tx_type.as_str(), "SWAP");
    }

    #[test]
    fn test_liquidity_value_requires_both_sides() {
        let event = LiquidityAdded {
            provider: Address::ZERO,
            amountA: U256::from(1u64),
            amountB: U256::from(2u64),
            liquidity: U256::from(3u64),
        };
        let mut tx = Transaction::from_liquidity_added("h-2".into(), &pair(), &event, 1, block_zero());
        tx.amount_a_usd = Some(10.0);
        assert_eq!(tx.value_usd(), None);
        tx.amount_b_usd = Some(5.0);
        assert_eq!(tx.value_usd(), Some(15.0));
    }

    #[test]
    fn test_transaction_type_roundtrip_names() {
        for ty in [
            TransactionType::Swap,
            TransactionType::AddLiquidity,
            TransactionType::RemoveLiquidity,
        ] {
            assert_eq!(TransactionType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(TransactionType::parse("MINT"), None);
    }

    fn block_zero() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }
}
