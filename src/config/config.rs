use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// PostgreSQL database connection configuration.
///
/// Used for storing:
/// - Pairs and tokens
/// - Transactions
/// - Token price and pair volume snapshots
/// - Sync checkpoints
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    16
}

/// How the engine reacts to a caught per-event error.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Any caught error stops the indexer (development).
    Strict,
    /// The failing event is logged and skipped (production).
    #[default]
    Lenient,
}

impl DeploymentMode {
    pub fn is_strict(&self) -> bool {
        matches!(self, DeploymentMode::Strict)
    }
}

/// Indexer configuration.
///
/// HyperSync supplies the ordered block/log stream, the RPC endpoint serves
/// the read-only contract calls used to re-sync pair state.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexerSettings {
    pub hypersync_url: String,
    pub hypersync_bearer_token: String,
    pub rpc_url: String,
    pub factory_address: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_tip_poll_interval")]
    pub tip_poll_interval_milliseconds: u64,
    #[serde(default)]
    pub mode: DeploymentMode,
    #[serde(default = "default_discover_pairs_on_start")]
    pub discover_pairs_on_start: bool,
    /// Directory holding `pair.json` / `factory.json` interface descriptions.
    /// Compiled-in defaults are used when unset.
    #[serde(default)]
    pub abi_dir: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_tip_poll_interval() -> u64 {
    200
}

fn default_discover_pairs_on_start() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Token classification used by the tiered price calculator.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PricingSettings {
    /// Reference stablecoins, priced at parity (1.0).
    #[serde(default)]
    pub stablecoins: Vec<String>,
    /// High-liquidity reference assets used by the second pricing tier.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

impl PricingSettings {
    /// Lowercase every configured address for consistent comparisons.
    fn normalize(&mut self) {
        for addr in self.stablecoins.iter_mut().chain(self.whitelist.iter_mut()) {
            *addr = addr.to_lowercase();
        }
    }
}

/// Root application configuration.
///
/// Loaded from `config.yaml` at startup, then overridden by `PAIRFLOW__*`
/// environment variables (e.g. `PAIRFLOW__POSTGRES__PASSWORD`).
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub postgres: PostgresSettings,
    pub indexer: IndexerSettings,
    #[serde(default)]
    pub pricing: PricingSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config"))
            .add_source(Environment::with_prefix("PAIRFLOW").separator("__"))
            .build()?;

        let mut settings: Settings = s.try_deserialize()?;
        settings.indexer.factory_address = settings.indexer.factory_address.to_lowercase();
        settings.pricing.normalize();

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_deserializes_lowercase() {
        let mode: DeploymentMode = serde_json::from_str("\"strict\"").unwrap();
        assert!(mode.is_strict());
        let mode: DeploymentMode = serde_json::from_str("\"lenient\"").unwrap();
        assert!(!mode.is_strict());
        assert_eq!(DeploymentMode::default(), DeploymentMode::Lenient);
    }

    #[test]
    fn test_pricing_addresses_are_lowercased() {
        let mut pricing = PricingSettings {
            stablecoins: vec!["0xA0B86991C6218B36C1D19D4A2E9EB0CE3606EB48".to_string()],
            whitelist: vec!["0xC02AAA39B223FE8D0A0E5C4F27EAD9083C756CC2".to_string()],
        };
        pricing.normalize();
        assert_eq!(pricing.stablecoins[0], "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(pricing.whitelist[0], "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
    }
}
