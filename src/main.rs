use std::{str::FromStr, sync::Arc, time::Duration};

use alloy::primitives::Address;
use anyhow::{Context, Result};
use clap::Parser;
use gasless_relay::{
    captcha::{AlwaysAllow, CaptchaVerifier, RecaptchaVerifier},
    clock::{Clock, SystemClock},
    config::Config,
    contract::{ContractService, OnchainContractService, StubContractService},
    oracle::PriceOracle,
    rate_limiter::{spawn_sweeper, RateLimiter, RateLimiterOptions},
    server::{AppState, HttpServer},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Relayer contract address reported in stub mode when none is configured.
const STUB_CONTRACT_ADDRESS: &str = "0x0000000000000000000000000000000000001234";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments first to get log level
    let config = Config::parse();

    let log_level = config.get_log_level();
    let filter = match log_level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => {
            eprintln!("Invalid log level '{}', defaulting to 'debug'", log_level);
            "debug"
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("Starting gasless relay service");
    // Secrets are skipped during serialization.
    if let Ok(printable) = serde_json::to_string(&config) {
        tracing::debug!("Configuration: {}", printable);
    }
    tracing::info!("Log level set to: {}", filter);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (contract, contract_address): (Arc<dyn ContractService>, Option<String>) =
        if config.stub_mode {
            let address_str = config
                .relayer_contract_address()
                .unwrap_or_else(|| STUB_CONTRACT_ADDRESS.to_string());
            let address =
                Address::from_str(&address_str).context("Invalid RELAYER_CONTRACT address")?;
            tracing::warn!("Stub mode enabled: relays are recorded in memory only");
            (
                Arc::new(StubContractService::from_config(&config, address)?),
                Some(address_str),
            )
        } else {
            (
                Arc::new(OnchainContractService::from_config(&config)?),
                config.relayer_contract_address(),
            )
        };

    let captcha: Arc<dyn CaptchaVerifier> =
        match (config.recaptcha_enabled, config.recaptcha_secret.as_deref()) {
            (true, Some(secret)) if !secret.is_empty() => {
                tracing::info!("reCAPTCHA verification enabled");
                Arc::new(RecaptchaVerifier::new(secret.to_string()))
            }
            (true, _) => {
                anyhow::bail!("RECAPTCHA_ENABLED is set but RECAPTCHA_SECRET is missing");
            }
            (false, _) => {
                tracing::warn!("reCAPTCHA verification disabled");
                Arc::new(AlwaysAllow)
            }
        };

    let oracle = Arc::new(PriceOracle::from_config(&config, clock.clone())?);

    let rate_limiter = Arc::new(RateLimiter::with_clock(
        RateLimiterOptions::from_config(&config),
        clock.clone(),
    ));
    tracing::info!(
        "Rate limits: {} requests/minute, {} gas/hour",
        config.max_requests_per_minute,
        config.max_gas_per_hour
    );

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(
        rate_limiter.clone(),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
        cancel.clone(),
    );

    let mut state = AppState::new(&config, contract, rate_limiter, captcha, oracle, clock);
    if let Some(address) = contract_address {
        state = state.with_contract_address(address);
    }

    let host = config.get_http_address();
    let port = config.get_http_port();
    tracing::debug!("CORS configuration: {}", config.get_http_cors());

    let server = HttpServer::new(host, port, Arc::new(state));
    tracing::info!("✓ Gasless relay ready to accept requests");

    let result = server.start(shutdown_signal()).await;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Rate limiter sweeper ended abnormally: {}", e);
    }
    tracing::info!("Gasless relay shut down");

    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
