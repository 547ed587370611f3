use clap::Parser;
use serde::{Deserialize, Serialize};

/// Chainlink ETH/USD aggregator on Sepolia.
pub const DEFAULT_ETH_USD_FEED: &str = "0x694AA1769357215DE4FAC081bf1f309aDC325306";

pub const DEFAULT_PRICE_API_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=ethereum&vs_currencies=usd";

pub const DEFAULT_RECAPTCHA_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

// Values shipped in the deployment env template.
const PLACEHOLDERS: [&str; 3] = [
    "your_project_id",
    "your_relayer_wallet_private_key_here",
    "your_deployed_contract_address_here",
];

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "gasless-relay")]
#[command(about = "Gasless meta-transfer relay with request admission checks")]
pub struct Config {
    /// HTTP server bind address
    #[arg(long, env = "HTTP_ADDRESS", default_value = "127.0.0.1")]
    pub http_address: String,

    /// HTTP server port
    #[arg(long, env = "HTTP_PORT", default_value = "3000")]
    pub http_port: u16,

    /// Allowed CORS origins, comma separated, "*" for any
    #[arg(long, env = "HTTP_CORS", default_value = "*")]
    pub http_cors: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// JSON-RPC endpoint of the chain the relayer contract lives on
    #[arg(long, env = "CHAIN_RPC_URL")]
    pub chain_rpc_url: Option<String>,

    /// Private key of the relayer wallet paying gas
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub relayer_private_key: Option<String>,

    /// Address of the deployed relayer contract
    #[arg(long, env = "RELAYER_CONTRACT")]
    pub relayer_contract: Option<String>,

    /// Chain id used in the EIP-712 domain
    #[arg(long, env = "CHAIN_ID", default_value = "11155111")]
    pub chain_id: u64,

    /// Requests allowed per owner per minute
    #[arg(long, env = "MAX_REQUESTS_PER_MINUTE", default_value = "10")]
    pub max_requests_per_minute: u32,

    /// Gas units an owner may consume per hour before being banned
    #[arg(long, env = "MAX_GAS_PER_HOUR", default_value = "1000000")]
    pub max_gas_per_hour: u64,

    /// Seconds between rate limiter maintenance sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "300")]
    pub sweep_interval_secs: u64,

    /// Chainlink ETH/USD aggregator address
    #[arg(long, env = "ETH_USD_FEED_ADDRESS", default_value = DEFAULT_ETH_USD_FEED)]
    pub eth_usd_feed: String,

    /// Public HTTP price API used when the on-chain feed is unusable
    #[arg(long, env = "PRICE_API_URL", default_value = DEFAULT_PRICE_API_URL)]
    pub price_api_url: String,

    /// ETH/USD price used when every price source fails and nothing is cached
    #[arg(long, env = "FALLBACK_ETH_PRICE", default_value = "3000")]
    pub fallback_eth_price: f64,

    /// Seconds a fetched ETH/USD price stays fresh
    #[arg(long, env = "PRICE_CACHE_SECS", default_value = "30")]
    pub price_cache_secs: u64,

    /// Timeout applied to each price source call, in seconds
    #[arg(long, env = "ORACLE_TIMEOUT_SECS", default_value = "5")]
    pub oracle_timeout_secs: u64,

    /// Verify reCAPTCHA tokens instead of accepting every token
    #[arg(long, env = "RECAPTCHA_ENABLED", default_value_t = false)]
    pub recaptcha_enabled: bool,

    /// reCAPTCHA server secret
    #[arg(long, env = "RECAPTCHA_SECRET", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub recaptcha_secret: Option<String>,

    /// Serve from an in-memory contract instead of a chain
    #[arg(long, env = "RELAY_STUB_MODE", default_value_t = false)]
    pub stub_mode: bool,

    /// Tokens the stub contract whitelists at startup, comma separated
    #[arg(long, env = "STUB_WHITELISTED_TOKENS", default_value = "")]
    pub stub_whitelisted_tokens: String,

    /// Balance and allowance the stub contract reports for owners it has not seen
    #[arg(long, env = "STUB_DEFAULT_BALANCE", default_value = "1000000000000")]
    pub stub_default_balance: u64,
}

/// Connection parameters needed to talk to the relayer contract.
#[derive(Debug, Clone)]
pub struct ContractSettings {
    pub rpc_url: String,
    pub private_key: String,
    pub relayer_contract: String,
}

impl Config {
    pub fn get_log_level(&self) -> String {
        self.log_level.clone()
    }

    pub fn get_http_address(&self) -> String {
        self.http_address.clone()
    }

    pub fn get_http_port(&self) -> u16 {
        self.http_port
    }

    pub fn get_http_cors(&self) -> String {
        self.http_cors.clone()
    }

    /// Parse the CORS setting into a list of origins. Empty means any origin.
    pub fn get_cors_origins(&self) -> Vec<String> {
        if self.http_cors.trim() == "*" {
            return Vec::new();
        }

        self.http_cors
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Returns the relayer contract settings when all of them are present and
    /// none is still a template placeholder.
    pub fn contract_settings(&self) -> Option<ContractSettings> {
        let rpc_url = configured(&self.chain_rpc_url)?;
        let private_key = configured(&self.relayer_private_key)?;
        let relayer_contract = configured(&self.relayer_contract)?;

        Some(ContractSettings {
            rpc_url,
            private_key,
            relayer_contract,
        })
    }

    pub fn get_stub_whitelisted_tokens(&self) -> Vec<String> {
        self.stub_whitelisted_tokens
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Chain RPC URL if one is set, placeholders excluded.
    pub fn rpc_url(&self) -> Option<String> {
        configured(&self.chain_rpc_url)
    }

    /// Relayer contract address if one is set, placeholders excluded.
    pub fn relayer_contract_address(&self) -> Option<String> {
        configured(&self.relayer_contract)
    }
}

fn configured(value: &Option<String>) -> Option<String> {
    let value = value.as_ref()?.trim();
    if value.is_empty() || PLACEHOLDERS.iter().any(|p| value.contains(p)) {
        return None;
    }
    Some(value.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_address: "127.0.0.1".to_string(),
            http_port: 3000,
            http_cors: "*".to_string(),
            log_level: "info".to_string(),
            chain_rpc_url: None,
            relayer_private_key: None,
            relayer_contract: None,
            chain_id: 11_155_111,
            max_requests_per_minute: 10,
            max_gas_per_hour: 1_000_000,
            sweep_interval_secs: 300,
            eth_usd_feed: DEFAULT_ETH_USD_FEED.to_string(),
            price_api_url: DEFAULT_PRICE_API_URL.to_string(),
            fallback_eth_price: 3000.0,
            price_cache_secs: 30,
            oracle_timeout_secs: 5,
            recaptcha_enabled: false,
            recaptcha_secret: None,
            stub_mode: false,
            stub_whitelisted_tokens: String::new(),
            stub_default_balance: 1_000_000_000_000,
        }
    }
}
