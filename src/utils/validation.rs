//! Numeric guards for derived prices and TVL.
//!
//! Reserve ratios and prices span many orders of magnitude (a micro-cap
//! against wrapped BTC, a 1-wei pool against a stablecoin), so there are no
//! plausibility bounds here. Only results that cannot be a price are
//! rejected: NaN, infinities, zero and negatives.

/// A reserve ratio usable for pricing: finite and strictly positive.
#[inline]
pub fn validate_price_ratio(ratio: f64) -> Option<f64> {
    (ratio.is_finite() && ratio > 0.0).then_some(ratio)
}

/// A USD price: finite and strictly positive. Anything else is unknown,
/// never zero.
#[inline]
pub fn validate_usd_price(price: f64) -> Option<f64> {
    (price.is_finite() && price > 0.0).then_some(price)
}

/// A USD TVL, or 0.0 ("unknown") when the sum is not a finite,
/// non-negative number.
#[inline]
pub fn validate_usd_tvl(tvl: f64) -> f64 {
    if tvl.is_finite() && tvl >= 0.0 {
        tvl
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_ratio_rejects_only_non_prices() {
        assert_eq!(validate_price_ratio(2.5), Some(2.5));
        assert_eq!(validate_price_ratio(1e13), Some(1e13));
        assert_eq!(validate_price_ratio(1e-15), Some(1e-15));
        assert_eq!(validate_price_ratio(0.0), None);
        assert_eq!(validate_price_ratio(f64::INFINITY), None);
    }

    #[test]
    fn test_usd_price_is_unknown_when_not_positive() {
        assert_eq!(validate_usd_price(1.0), Some(1.0));
        assert_eq!(validate_usd_price(2e6), Some(2e6));
        assert_eq!(validate_usd_price(-1.0), None);
        assert_eq!(validate_usd_price(0.0), None);
        assert_eq!(validate_usd_price(f64::NAN), None);
    }

    #[test]
    fn test_tvl_falls_back_to_zero() {
        assert_eq!(validate_usd_tvl(1_000.0), 1_000.0);
        assert_eq!(validate_usd_tvl(1e12), 1e12);
        assert_eq!(validate_usd_tvl(f64::NAN), 0.0);
        assert_eq!(validate_usd_tvl(-5.0), 0.0);
    }
}
