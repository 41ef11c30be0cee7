pub mod block_source;
pub mod contract_reader;
pub mod decoder;
pub mod engine;
pub mod indexer;
pub mod price_calculator;
pub mod registry;
pub mod volume_calculator;

pub use block_source::{BlockSource, HypersyncBlockSource};
pub use contract_reader::{ContractReader, RpcContractReader};
pub use decoder::Decoder;
pub use engine::{BatchSummary, Engine};
pub use indexer::Indexer;
pub use price_calculator::PriceCalculator;
pub use registry::Registry;
