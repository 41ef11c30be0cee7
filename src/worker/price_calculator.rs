use alloy::primitives::U256;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    config::PricingSettings,
    db::models::{Pair, Token, TokenPriceSnapshot},
    utils::{u256_to_f64, validate_price_ratio, validate_usd_price, validate_usd_tvl},
};

/// Pricing tier, in strict priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriceTier {
    /// Counter-token is a reference stablecoin (priced at 1.0).
    Stable,
    /// Counter-token is a whitelisted high-liquidity asset with a known price.
    Whitelist,
    /// Counter-token is anything with a known price.
    Any,
}

const TIERS: [PriceTier; 3] = [PriceTier::Stable, PriceTier::Whitelist, PriceTier::Any];

/// Percentage price change against prior snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceChanges {
    pub change_1h: Option<f64>,
    pub change_24h: Option<f64>,
}

/// Token price oracle derived from the pair graph.
///
/// Resolves a token's reference-currency price with a tiered strategy:
/// 1. Stablecoin itself → 1.0
/// 2. Pairs against a stablecoin
/// 3. Pairs against a whitelisted reference asset
/// 4. Pairs against any token whose price is already known
///
/// Within a tier the per-pair implied prices are averaged, weighted by
/// pair TVL (weight 1 while a pair's TVL is still unknown). The first tier
/// that yields a price wins; lower tiers are not consulted.
pub struct PriceCalculator {
    stablecoins: FxHashSet<String>,
    whitelist: FxHashSet<String>,
}

impl PriceCalculator {
    pub fn new(pricing: &PricingSettings) -> Self {
        Self {
            stablecoins: pricing.stablecoins.iter().map(|a| a.to_lowercase()).collect(),
            whitelist: pricing.whitelist.iter().map(|a| a.to_lowercase()).collect(),
        }
    }

    pub fn is_stablecoin(&self, token: &str) -> bool {
        self.stablecoins.contains(token)
    }

    pub fn is_whitelisted(&self, token: &str) -> bool {
        self.whitelist.contains(token)
    }

    /// Price of `token` from the pairs it participates in.
    ///
    /// `None` means "not enough data yet", which is a normal state: the
    /// caller retries on the next relevant event or hourly tick.
    pub fn calculate_token_price(
        &self,
        token: &str,
        pairs: &[&Pair],
        tokens: &FxHashMap<String, Token>,
        prices: &FxHashMap<String, f64>,
    ) -> Option<f64> {
        if self.is_stablecoin(token) {
            return Some(1.0);
        }

        TIERS
            .iter()
            .find_map(|&tier| self.weighted_price(token, tier, pairs, tokens, prices))
    }

    fn weighted_price(
        &self,
        token: &str,
        tier: PriceTier,
        pairs: &[&Pair],
        tokens: &FxHashMap<String, Token>,
        prices: &FxHashMap<String, f64>,
    ) -> Option<f64> {
        let this_decimals = tokens.get(token)?.decimals;

        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;

        for pair in pairs {
            let Some((this_reserve, counter_reserve, counter)) = pair.reserves_for(token) else {
                continue;
            };
            if this_reserve.is_zero() || counter_reserve.is_zero() {
                continue;
            }

            let counter_price = match tier {
                PriceTier::Stable if self.is_stablecoin(counter) => 1.0,
                PriceTier::Whitelist if self.is_whitelisted(counter) => {
                    match prices.get(counter) {
                        Some(&p) => p,
                        None => continue,
                    }
                },
                PriceTier::Any => match prices.get(counter) {
                    Some(&p) => p,
                    None => continue,
                },
                _ => continue,
            };

            let Some(counter_token) = tokens.get(counter) else {
                continue;
            };

            let Some(implied) = implied_price(
                this_reserve,
                this_decimals,
                counter_reserve,
                counter_token.decimals,
                counter_price,
            ) else {
                continue;
            };

            let weight = if pair.tvl_usd > 0.0 { pair.tvl_usd } else { 1.0 };
            weighted_sum += implied * weight;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            validate_usd_price(weighted_sum / total_weight)
        } else {
            None
        }
    }

    /// Both sides of the pair valued in the reference currency.
    ///
    /// Returns 0.0 when a token's metadata or price is missing.
    pub fn calculate_pair_tvl(
        pair: &Pair,
        token0: Option<&Token>,
        token1: Option<&Token>,
        price0: Option<f64>,
        price1: Option<f64>,
    ) -> f64 {
        let (Some(token0), Some(token1), Some(price0), Some(price1)) =
            (token0, token1, price0, price1)
        else {
            return 0.0;
        };

        let side0 = amount_to_usd(pair.reserve0, token0.decimals, Some(price0));
        let side1 = amount_to_usd(pair.reserve1, token1.decimals, Some(price1));

        match (side0, side1) {
            (Some(a), Some(b)) => validate_usd_tvl(a + b),
            _ => 0.0,
        }
    }

    /// Percentage change of `current` against the closest snapshot taken at
    /// or before `as_of - 1h` and `as_of - 24h`.
    ///
    /// A window without a prior snapshot stays `None`.
    pub fn calculate_price_changes<'a, I>(
        current: f64,
        as_of: DateTime<Utc>,
        history: I,
    ) -> PriceChanges
    where
        I: IntoIterator<Item = &'a TokenPriceSnapshot>,
    {
        let cutoff_1h = as_of - Duration::hours(1);
        let cutoff_24h = as_of - Duration::hours(24);

        let mut prior_1h: Option<&TokenPriceSnapshot> = None;
        let mut prior_24h: Option<&TokenPriceSnapshot> = None;

        for snapshot in history {
            if snapshot.timestamp <= cutoff_1h && is_later(snapshot, prior_1h) {
                prior_1h = Some(snapshot);
            }
            if snapshot.timestamp <= cutoff_24h && is_later(snapshot, prior_24h) {
                prior_24h = Some(snapshot);
            }
        }

        PriceChanges {
            change_1h: prior_1h.and_then(|p| percentage_change(p.price_usd, current)),
            change_24h: prior_24h.and_then(|p| percentage_change(p.price_usd, current)),
        }
    }

    /// Compose a new immutable price snapshot. `None` when no price is known.
    pub fn prepare_token_price_snapshot(
        token: &Token,
        price: Option<f64>,
        changes: PriceChanges,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Option<TokenPriceSnapshot> {
        let price = price?;

        let fdv_usd = token
            .total_supply
            .and_then(|supply| amount_to_usd(supply, token.decimals, Some(price)));

        Some(TokenPriceSnapshot {
            id: TokenPriceSnapshot::snapshot_id(&token.address, block_number),
            token_address: token.address.clone(),
            price_usd: price,
            fdv_usd,
            price_change_1h: changes.change_1h,
            price_change_24h: changes.change_24h,
            timestamp,
            block_number,
        })
    }
}

/// `amount / 10^decimals * price`. Unknown price yields `None`, never 0.
pub fn amount_to_usd(amount: U256, decimals: u8, price: Option<f64>) -> Option<f64> {
    let price = price?;
    let value = u256_to_f64(amount, decimals)? * price;
    value.is_finite().then_some(value)
}

/// Price of one unit of "this" token implied by a pair's reserves.
fn implied_price(
    this_reserve: U256,
    this_decimals: u8,
    counter_reserve: U256,
    counter_decimals: u8,
    counter_price: f64,
) -> Option<f64> {
    let this_amount = u256_to_f64(this_reserve, this_decimals)?;
    let counter_amount = u256_to_f64(counter_reserve, counter_decimals)?;
    if this_amount <= 0.0 {
        return None;
    }

    let ratio = validate_price_ratio(counter_amount / this_amount)?;
    Some(ratio * counter_price)
}

fn is_later(candidate: &TokenPriceSnapshot, current: Option<&TokenPriceSnapshot>) -> bool {
    match current {
        None => true,
        Some(c) => {
            (candidate.timestamp, candidate.block_number) > (c.timestamp, c.block_number)
        },
    }
}

fn percentage_change(previous: f64, current: f64) -> Option<f64> {
    if previous > 0.0 && previous.is_finite() {
        Some((current - previous) / previous * 100.0)
    } else {
        None
    }
}
