//! Type conversion and formatting utilities.
//!
//! Functions for converting between on-chain integers (U256), decimal-adjusted
//! f64 values and the textual form used for durable storage.

use alloy::primitives::{hex, U256};
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use once_cell::sync::Lazy;

// ============================================
// Hex Encoding
// ============================================

/// Encode bytes as a lowercase hex string with 0x prefix.
pub fn hex_encode(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

// ============================================
// U256 Conversions
// ============================================

/// Convert U256 to f64 with decimal adjustment using BigDecimal for precision.
///
/// Large U256 values lose precision when cast to f64 directly, so the value
/// is scaled as a BigDecimal first and only converted at the end.
///
/// # Arguments
/// * `value` - The raw on-chain amount
/// * `decimals` - The token's decimal precision
///
/// # Returns
/// * `Some(f64)` if conversion succeeds, `None` if the result is not finite
///
/// # Example
/// ```ignore
/// let value = U256::from(1_000_000_000_000_000_000u128); // 1e18
/// let adjusted = u256_to_f64(value, 18); // Some(1.0)
/// ```
pub fn u256_to_f64(value: U256, decimals: u8) -> Option<f64> {
    // Convert U256 to BigDecimal via bytes (faster than string parsing)
    let bytes: [u8; 32] = value.to_le_bytes();
    let big_int = BigInt::from_bytes_le(num_bigint::Sign::Plus, &bytes);
    let big_value = BigDecimal::from(big_int);

    let adjusted = if decimals == 0 { big_value } else { big_value / big_pow10(decimals) };

    let result = adjusted.to_f64()?;

    if result.is_finite() {
        Some(result)
    } else {
        None
    }
}

/// Parse a base-10 integer string (as stored in NUMERIC columns) into a U256.
pub fn parse_u256(value: &str) -> anyhow::Result<U256> {
    // NUMERIC::text may carry a trailing ".0" scale for integral values
    let integral = value.split('.').next().unwrap_or(value);
    U256::from_str_radix(integral.trim(), 10)
        .map_err(|e| anyhow::anyhow!("Invalid unsigned integer {}: {}", value, e))
}

// ============================================
// Internal Helpers
// ============================================

static POW10_CACHE: Lazy<[BigDecimal; 25]> =
    Lazy::new(|| std::array::from_fn(|i| BigDecimal::from(BigInt::from(10u32).pow(i as u32))));

/// Compute 10^exp as BigDecimal.
pub(crate) fn big_pow10(exp: u8) -> BigDecimal {
    if (exp as usize) < POW10_CACHE.len() {
        POW10_CACHE[exp as usize].clone()
    } else {
        BigDecimal::from(BigInt::from(10u32).pow(exp as u32))
    }
}
