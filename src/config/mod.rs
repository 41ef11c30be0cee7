#[allow(clippy::module_inception)]
mod config;

pub use config::{DeploymentMode, IndexerSettings, PostgresSettings, PricingSettings, Settings};
