pub mod erc20;
pub mod factory;
pub mod multicall;
pub mod pair;

pub use erc20::IERC20;
pub use factory::{IFactory, PairCreated};
pub use multicall::{Call3, IMulticall3, McResult};
pub use pair::{IPair, LiquidityAdded, LiquidityRemoved, Swap};
