pub mod checkpoint;
pub mod pair;
pub mod pair_volume_snapshot;
pub mod token;
pub mod token_price_snapshot;
pub mod transaction;

pub use checkpoint::SyncCheckpoint;
pub use pair::{Pair, PairInfo};
pub use pair_volume_snapshot::{PairVolumeSnapshot, VolumeInterval};
pub use token::Token;
pub use token_price_snapshot::TokenPriceSnapshot;
pub use transaction::{Transaction, TransactionType};
