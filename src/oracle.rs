//! ETH/USD price and gas price lookups feeding the fee calculator.

use std::{str::FromStr, sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, I256, U256},
    providers::{DynProvider, Provider},
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    abi::AggregatorV3Interface,
    clock::Clock,
    config::Config,
    contract::read_provider,
    error::RelayResult,
};

/// 20 gwei, used when the node cannot be asked.
pub const DEFAULT_GAS_PRICE_WEI: u128 = 20_000_000_000;

pub const BASE_TRANSFER_GAS: u64 = 65_000;
pub const PERMIT_GAS: u64 = 50_000;
pub const GAS_LIMIT_BUFFER: u64 = 20_000;

/// A feed older than this is not trusted.
pub const FEED_STALENESS_SECS: i64 = 3600;

const CHAINLINK_DECIMALS: i32 = 8;

/// One provider of the ETH/USD price.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn eth_usd(&self) -> Result<f64>;
}

/// Chainlink ETH/USD aggregator read through `latestRoundData`.
pub struct ChainlinkFeed {
    feed: AggregatorV3Interface::AggregatorV3InterfaceInstance<DynProvider>,
    clock: Arc<dyn Clock>,
}

impl ChainlinkFeed {
    pub fn new(provider: DynProvider, feed: Address, clock: Arc<dyn Clock>) -> Self {
        Self {
            feed: AggregatorV3Interface::new(feed, provider),
            clock,
        }
    }
}

#[async_trait]
impl PriceSource for ChainlinkFeed {
    fn name(&self) -> &str {
        "chainlink"
    }

    async fn eth_usd(&self) -> Result<f64> {
        let round = self.feed.latestRoundData().call().await?;

        if round.answer <= I256::ZERO {
            bail!("non-positive answer {}", round.answer);
        }

        let updated_at = round.updatedAt.saturating_to::<u64>() as i64;
        let age = self.clock.now_secs() - updated_at;
        if age > FEED_STALENESS_SECS {
            bail!("price feed is stale ({}s old)", age);
        }

        let raw = round.answer.into_raw().saturating_to::<u128>() as f64;
        Ok(raw / 10f64.powi(CHAINLINK_DECIMALS))
    }
}

/// Public HTTP API answering `{"ethereum": {"usd": <price>}}`.
pub struct HttpPriceApi {
    client: reqwest::Client,
    url: String,
}

impl HttpPriceApi {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceApi {
    fn name(&self) -> &str {
        "http-api"
    }

    async fn eth_usd(&self) -> Result<f64> {
        let body: serde_json::Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        body.get("ethereum")
            .and_then(|e| e.get("usd"))
            .and_then(|p| p.as_f64())
            .ok_or_else(|| anyhow!("response has no ethereum.usd price"))
    }
}

/// Inputs the fee calculator needs.
#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn eth_usd_price(&self) -> RelayResult<f64>;

    async fn gas_price(&self) -> RelayResult<U256>;

    async fn estimate_gas_limit(&self, token: Address, amount: U256) -> RelayResult<U256>;

    async fn token_usd_price(&self, token: Address) -> RelayResult<f64>;
}

#[derive(Debug, Clone)]
pub struct OracleOptions {
    pub cache_ttl: Duration,
    pub source_timeout: Duration,
    pub fallback_price: f64,
}

impl Default for OracleOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            source_timeout: Duration::from_secs(5),
            fallback_price: 3000.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: f64,
    fetched_at_ms: i64,
}

/// Cached ETH/USD price over an ordered list of sources.
///
/// Lookups never fail: when every source fails the last cached price is used,
/// and without one the configured fallback price.
pub struct PriceOracle {
    sources: Vec<Box<dyn PriceSource>>,
    provider: Option<DynProvider>,
    clock: Arc<dyn Clock>,
    options: OracleOptions,
    cache: Mutex<Option<CachedPrice>>,
}

impl PriceOracle {
    pub fn new(
        sources: Vec<Box<dyn PriceSource>>,
        provider: Option<DynProvider>,
        clock: Arc<dyn Clock>,
        options: OracleOptions,
    ) -> Self {
        Self {
            sources,
            provider,
            clock,
            options,
            cache: Mutex::new(None),
        }
    }

    /// Chainlink feed first (when an RPC URL is set), then the HTTP API.
    /// Stub mode uses no sources and no provider.
    pub fn from_config(cfg: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let options = OracleOptions {
            cache_ttl: Duration::from_secs(cfg.price_cache_secs),
            source_timeout: Duration::from_secs(cfg.oracle_timeout_secs),
            fallback_price: cfg.fallback_eth_price,
        };

        if cfg.stub_mode {
            return Ok(Self::new(Vec::new(), None, clock, options));
        }

        let provider = cfg.rpc_url().map(|url| read_provider(&url)).transpose()?;

        let mut sources: Vec<Box<dyn PriceSource>> = Vec::new();
        if let Some(provider) = &provider {
            let feed = Address::from_str(&cfg.eth_usd_feed)
                .context("Invalid ETH_USD_FEED_ADDRESS")?;
            sources.push(Box::new(ChainlinkFeed::new(
                provider.clone(),
                feed,
                clock.clone(),
            )));
        }
        sources.push(Box::new(HttpPriceApi::new(cfg.price_api_url.clone())));

        Ok(Self::new(sources, provider, clock, options))
    }

    pub async fn get_eth_usd_price(&self) -> f64 {
        let now = self.clock.now_millis();
        let cached = *self.cache.lock();
        if let Some(c) = cached {
            if now - c.fetched_at_ms < self.options.cache_ttl.as_millis() as i64 {
                return c.price;
            }
        }

        for source in &self.sources {
            match tokio::time::timeout(self.options.source_timeout, source.eth_usd()).await {
                Ok(Ok(price)) if price.is_finite() && price > 0.0 => {
                    tracing::debug!("ETH/USD price {} from {}", price, source.name());
                    *self.cache.lock() = Some(CachedPrice {
                        price,
                        fetched_at_ms: self.clock.now_millis(),
                    });
                    return price;
                }
                Ok(Ok(price)) => {
                    tracing::warn!("Price source {} returned invalid price {}", source.name(), price);
                }
                Ok(Err(e)) => tracing::warn!("Price source {} failed: {}", source.name(), e),
                Err(_) => tracing::warn!(
                    "Price source {} timed out after {:?}",
                    source.name(),
                    self.options.source_timeout
                ),
            }
        }

        if let Some(c) = cached {
            tracing::warn!("All price sources failed, using cached price {}", c.price);
            return c.price;
        }

        tracing::warn!(
            "All price sources failed, using fallback price {}",
            self.options.fallback_price
        );
        self.options.fallback_price
    }

    /// Current gas price in wei.
    pub async fn get_gas_price(&self) -> U256 {
        let Some(provider) = &self.provider else {
            tracing::debug!("No provider configured: returning default gas price");
            return U256::from(DEFAULT_GAS_PRICE_WEI);
        };

        match tokio::time::timeout(self.options.source_timeout, provider.get_gas_price()).await {
            Ok(Ok(gas_price)) => {
                tracing::debug!("Fetched gas price: 0x{:x} ({} wei)", gas_price, gas_price);
                U256::from(gas_price)
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to fetch gas price: {}", e);
                U256::from(DEFAULT_GAS_PRICE_WEI)
            }
            Err(_) => {
                tracing::warn!("Gas price request timed out");
                U256::from(DEFAULT_GAS_PRICE_WEI)
            }
        }
    }

    /// Static heuristic, independent of call data.
    pub fn estimate_gas_limit(&self, _token: Address, _amount: U256) -> U256 {
        U256::from(BASE_TRANSFER_GAS + PERMIT_GAS + GAS_LIMIT_BUFFER)
    }

    /// Every supported token is treated as a USD stablecoin.
    pub fn get_token_usd_price(&self, _token: Address) -> f64 {
        1.0
    }
}

#[async_trait]
impl FeeOracle for PriceOracle {
    async fn eth_usd_price(&self) -> RelayResult<f64> {
        Ok(self.get_eth_usd_price().await)
    }

    async fn gas_price(&self) -> RelayResult<U256> {
        Ok(self.get_gas_price().await)
    }

    async fn estimate_gas_limit(&self, token: Address, amount: U256) -> RelayResult<U256> {
        Ok(PriceOracle::estimate_gas_limit(self, token, amount))
    }

    async fn token_usd_price(&self, token: Address) -> RelayResult<f64> {
        Ok(self.get_token_usd_price(token))
    }
}
