use std::{future::Future, time::Duration};

use alloy::{
    eips::BlockId,
    primitives::{Address, U256},
    providers::{DynProvider, ProviderBuilder, MULTICALL3_ADDRESS},
    sol_types::SolCall,
};
use anyhow::{Context, Result};
use log::debug;
use moka::future::Cache;
use url::Url;

use crate::{
    abis::{Call3, IFactory, IMulticall3, IPair, IERC20},
    db::models::PairInfo,
    utils::hex_encode,
};

/// Read-only contract queries used to (re)sync pair and token state.
///
/// Reserve and supply reads take an optional block: `Some(n)` pins the read
/// to the state as of block `n`, `None` reads the latest state.
#[allow(async_fn_in_trait)]
pub trait ContractReader {
    async fn get_reserves(&self, pair: &str, block: Option<u64>) -> Result<(U256, U256)>;
    async fn get_total_supply(&self, address: &str, block: Option<u64>) -> Result<U256>;
    async fn get_symbol(&self, token: &str) -> Result<String>;
    async fn get_name(&self, token: &str) -> Result<Option<String>>;
    async fn get_decimals(&self, token: &str) -> Result<u8>;
    /// Every pair the factory has created, in creation order.
    async fn get_pairs(&self, factory: &str) -> Result<Vec<PairInfo>>;
}

/// Maximum attempts per RPC call
const MAX_RETRIES: u32 = 3;

/// Delay between retries (exponential backoff base)
const RETRY_DELAY_MS: u64 = 100;

/// Timeout for individual RPC calls (30 seconds)
const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Batch size for multicall requests to avoid RPC congestion/timeouts
const MULTICALL_BATCH_SIZE: usize = 100;

/// Largest decimals value accepted from a token contract
const MAX_TOKEN_DECIMALS: u8 = 36;

/// [`ContractReader`] over JSON-RPC `eth_call`.
///
/// Token symbol and decimals never change, so they are cached.
#[derive(Clone)]
pub struct RpcContractReader {
    provider: DynProvider,
    symbols: Cache<String, String>,
    decimals: Cache<String, u8>,
}

impl RpcContractReader {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let url = Url::parse(rpc_url).context("Invalid RPC URL")?;
        let provider = DynProvider::new(ProviderBuilder::new().connect_http(url));

        Ok(Self {
            provider,
            symbols: Cache::builder().max_capacity(100_000).build(),
            decimals: Cache::builder().max_capacity(100_000).build(),
        })
    }

    /// Run `call` with a timeout, retrying with exponential backoff.
    async fn call_with_retry<T, F, Fut>(&self, label: &str, target: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = alloy::contract::Result<T>>,
    {
        let mut last_error = anyhow::anyhow!("no attempt made");

        for attempt in 0..MAX_RETRIES {
            match tokio::time::timeout(RPC_CALL_TIMEOUT, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = e.into(),
                Err(_) => last_error = anyhow::anyhow!("timeout after {:?}", RPC_CALL_TIMEOUT),
            }

            if attempt < MAX_RETRIES - 1 {
                debug!("{} on {} failed (attempt {}), retrying", label, target, attempt + 1);
                let delay = Duration::from_millis(RETRY_DELAY_MS * 2_u64.pow(attempt));
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error.context(format!(
            "{} on {} failed after {} attempts",
            label, target, MAX_RETRIES
        )))
    }

    async fn aggregate(&self, calls: Vec<Call3>) -> Result<Vec<crate::abis::McResult>> {
        let multicall = IMulticall3::new(MULTICALL3_ADDRESS, &self.provider);
        let multicall = &multicall;
        self.call_with_retry("aggregate3", "multicall", || {
            let calls = calls.clone();
            async move { multicall.aggregate3(calls).call().await }
        })
        .await
    }

    async fn pair_addresses(&self, factory: Address) -> Result<Vec<Address>> {
        let contract = IFactory::new(factory, &self.provider);
        let contract = &contract;
        let length = self
            .call_with_retry("allPairsLength", &hex_encode(factory.as_slice()), || async move {
                contract.allPairsLength().call().await
            })
            .await?;
        let length: u64 = length.saturating_to();

        let mut addresses = Vec::with_capacity(length as usize);
        let indices: Vec<u64> = (0..length).collect();

        for chunk in indices.chunks(MULTICALL_BATCH_SIZE) {
            let calls = chunk
                .iter()
                .map(|&i| Call3 {
                    target: factory,
                    allowFailure: false,
                    callData: IFactory::allPairsCall {
                        index: U256::from(i),
                    }
                    .abi_encode()
                    .into(),
                })
                .collect();

            for result in self.aggregate(calls).await? {
                let address = IFactory::allPairsCall::abi_decode_returns(&result.returnData)
                    .context("Invalid allPairs return data")?;
                addresses.push(address);
            }
        }

        Ok(addresses)
    }
}

impl ContractReader for RpcContractReader {
    async fn get_reserves(&self, pair: &str, block: Option<u64>) -> Result<(U256, U256)> {
        let address: Address = pair.parse().context("Invalid pair address")?;
        let contract = IPair::new(address, &self.provider);
        let contract = &contract;

        let reserves = self
            .call_with_retry("getReserves", pair, || async move {
                let call = contract.getReserves();
                match block {
                    Some(n) => call.block(BlockId::number(n)).call().await,
                    None => call.call().await,
                }
            })
            .await?;

        Ok((reserves.reserve0, reserves.reserve1))
    }

    async fn get_total_supply(&self, address: &str, block: Option<u64>) -> Result<U256> {
        let parsed: Address = address.parse().context("Invalid contract address")?;
        let contract = IERC20::new(parsed, &self.provider);
        let contract = &contract;

        self.call_with_retry("totalSupply", address, || async move {
            let call = contract.totalSupply();
            match block {
                Some(n) => call.block(BlockId::number(n)).call().await,
                None => call.call().await,
            }
        })
        .await
    }

    async fn get_symbol(&self, token: &str) -> Result<String> {
        if let Some(symbol) = self.symbols.get(token).await {
            return Ok(symbol);
        }

        let address: Address = token.parse().context("Invalid token address")?;
        let contract = IERC20::new(address, &self.provider);
        let contract = &contract;
        let symbol = self
            .call_with_retry("symbol", token, || async move { contract.symbol().call().await })
            .await?;

        self.symbols.insert(token.to_string(), symbol.clone()).await;
        Ok(symbol)
    }

    async fn get_name(&self, token: &str) -> Result<Option<String>> {
        let address: Address = token.parse().context("Invalid token address")?;
        let contract = IERC20::new(address, &self.provider);
        let contract = &contract;

        // Name is optional metadata: a reverting or missing name() is not an error
        let name = self
            .call_with_retry("name", token, || async move { contract.name().call().await })
            .await
            .ok()
            .filter(|n| !n.is_empty());
        Ok(name)
    }

    async fn get_decimals(&self, token: &str) -> Result<u8> {
        if let Some(decimals) = self.decimals.get(token).await {
            return Ok(decimals);
        }

        let address: Address = token.parse().context("Invalid token address")?;
        let contract = IERC20::new(address, &self.provider);
        let contract = &contract;
        let decimals = self
            .call_with_retry("decimals", token, || async move { contract.decimals().call().await })
            .await?;

        if decimals > MAX_TOKEN_DECIMALS {
            anyhow::bail!("Token {} reports {} decimals", token, decimals);
        }

        self.decimals.insert(token.to_string(), decimals).await;
        Ok(decimals)
    }

    async fn get_pairs(&self, factory: &str) -> Result<Vec<PairInfo>> {
        let factory_address: Address = factory.parse().context("Invalid factory address")?;
        let pairs = self.pair_addresses(factory_address).await?;

        let mut infos = Vec::with_capacity(pairs.len());
        for chunk in pairs.chunks(MULTICALL_BATCH_SIZE / 2) {
            let mut calls = Vec::with_capacity(chunk.len() * 2);
            for &pair in chunk {
                calls.push(Call3 {
                    target: pair,
                    allowFailure: false,
                    callData: IPair::token0Call {}.abi_encode().into(),
                });
                calls.push(Call3 {
                    target: pair,
                    allowFailure: false,
                    callData: IPair::token1Call {}.abi_encode().into(),
                });
            }

            let results = self.aggregate(calls).await?;
            if results.len() != chunk.len() * 2 {
                anyhow::bail!(
                    "Multicall returned {} results for {} calls",
                    results.len(),
                    chunk.len() * 2
                );
            }

            for (pair, tokens) in chunk.iter().zip(results.chunks(2)) {
                let token0 = IPair::token0Call::abi_decode_returns(&tokens[0].returnData)
                    .context("Invalid token0 return data")?;
                let token1 = IPair::token1Call::abi_decode_returns(&tokens[1].returnData)
                    .context("Invalid token1 return data")?;

                infos.push(PairInfo::new(
                    &hex_encode(pair.as_slice()),
                    &hex_encode(token0.as_slice()),
                    &hex_encode(token1.as_slice()),
                ));
            }
        }

        debug!("Factory {} reports {} pairs", factory, infos.len());
        Ok(infos)
    }
}

#[cfg(test)]
pub mod scripted {
    //! Deterministic in-memory [`ContractReader`] for engine tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use rustc_hash::{FxHashMap, FxHashSet};

    #[derive(Default)]
    struct Inner {
        /// Per address: value effective from block (inclusive)
        reserves: FxHashMap<String, BTreeMap<u64, (U256, U256)>>,
        supplies: FxHashMap<String, BTreeMap<u64, U256>>,
        tokens: FxHashMap<String, (String, Option<String>, u8)>,
        factory_pairs: Vec<PairInfo>,
        failing: FxHashSet<String>,
        calls: FxHashMap<String, usize>,
    }

    #[derive(Default)]
    pub struct ScriptedReader {
        inner: Mutex<Inner>,
    }

    fn at_block<T: Copy>(series: Option<&BTreeMap<u64, T>>, block: Option<u64>) -> Option<T> {
        series?
            .range(..=block.unwrap_or(u64::MAX))
            .next_back()
            .map(|(_, v)| *v)
    }

    impl ScriptedReader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_reserves(&self, pair: &str, from_block: u64, reserve0: U256, reserve1: U256) {
            self.inner
                .lock()
                .unwrap()
                .reserves
                .entry(pair.to_string())
                .or_default()
                .insert(from_block, (reserve0, reserve1));
        }

        pub fn set_supply(&self, address: &str, from_block: u64, supply: U256) {
            self.inner
                .lock()
                .unwrap()
                .supplies
                .entry(address.to_string())
                .or_default()
                .insert(from_block, supply);
        }

        pub fn add_token(&self, address: &str, symbol: &str, decimals: u8) {
            self.inner.lock().unwrap().tokens.insert(
                address.to_string(),
                (symbol.to_string(), Some(format!("{} Token", symbol)), decimals),
            );
        }

        pub fn add_factory_pair(&self, info: PairInfo) {
            self.inner.lock().unwrap().factory_pairs.push(info);
        }

        /// Every subsequent read touching `address` fails.
        pub fn fail(&self, address: &str) {
            self.inner.lock().unwrap().failing.insert(address.to_string());
        }

        pub fn calls(&self, method: &str, address: &str) -> usize {
            let key = format!("{}:{}", method, address);
            self.inner.lock().unwrap().calls.get(&key).copied().unwrap_or(0)
        }

        fn record(&self, method: &str, address: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            *inner.calls.entry(format!("{}:{}", method, address)).or_default() += 1;
            if inner.failing.contains(address) {
                anyhow::bail!("{} on {} reverted", method, address);
            }
            Ok(())
        }

        fn token(&self, address: &str) -> Result<(String, Option<String>, u8)> {
            self.inner
                .lock()
                .unwrap()
                .tokens
                .get(address)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{} is not a token", address))
        }
    }

    impl ContractReader for ScriptedReader {
        async fn get_reserves(&self, pair: &str, block: Option<u64>) -> Result<(U256, U256)> {
            self.record("getReserves", pair)?;
            let inner = self.inner.lock().unwrap();
            at_block(inner.reserves.get(pair), block)
                .ok_or_else(|| anyhow::anyhow!("no reserves for {}", pair))
        }

        async fn get_total_supply(&self, address: &str, block: Option<u64>) -> Result<U256> {
            self.record("totalSupply", address)?;
            let inner = self.inner.lock().unwrap();
            at_block(inner.supplies.get(address), block)
                .ok_or_else(|| anyhow::anyhow!("no supply for {}", address))
        }

        async fn get_symbol(&self, token: &str) -> Result<String> {
            self.record("symbol", token)?;
            Ok(self.token(token)?.0)
        }

        async fn get_name(&self, token: &str) -> Result<Option<String>> {
            self.record("name", token)?;
            Ok(self.token(token)?.1)
        }

        async fn get_decimals(&self, token: &str) -> Result<u8> {
            self.record("decimals", token)?;
            Ok(self.token(token)?.2)
        }

        async fn get_pairs(&self, factory: &str) -> Result<Vec<PairInfo>> {
            self.record("getPairs", factory)?;
            Ok(self.inner.lock().unwrap().factory_pairs.clone())
        }
    }

    #[tokio::test]
    async fn test_reads_are_pinned_to_block() {
        let reader = ScriptedReader::new();
        reader.set_reserves("0xp", 10, U256::from(1u64), U256::from(2u64));
        reader.set_reserves("0xp", 20, U256::from(3u64), U256::from(4u64));

        assert!(reader.get_reserves("0xp", Some(9)).await.is_err());
        assert_eq!(
            reader.get_reserves("0xp", Some(19)).await.unwrap(),
            (U256::from(1u64), U256::from(2u64))
        );
        assert_eq!(
            reader.get_reserves("0xp", None).await.unwrap(),
            (U256::from(3u64), U256::from(4u64))
        );
        assert_eq!(reader.calls("getReserves", "0xp"), 3);
    }
}
