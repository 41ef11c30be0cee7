pub mod abis;
pub mod config;
pub mod db;
pub mod error;
pub mod utils;
pub mod worker;

pub use config::Settings;
pub use db::PostgresClient;
pub use error::{DecodeError, IndexerError};
pub use worker::{Decoder, Engine, HypersyncBlockSource, Indexer, RpcContractReader};
