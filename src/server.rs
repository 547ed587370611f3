use std::{future::Future, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    captcha::CaptchaVerifier,
    clock::Clock,
    config::Config,
    contract::ContractService,
    error::{RelayError, RelayResult},
    fees::{FeeBreakdown, FeeCalculator, FeeValidation, GasEstimation, DEFAULT_TOKEN_DECIMALS},
    oracle::FeeOracle,
    pipeline::RelayPipeline,
    rate_limiter::RateLimiter,
    types::{
        CalculateFeeRequest, DataResponse, ErrorResponse, EstimateGasRequest, HealthResponse,
        RelayRequestPayload,
        RelayResponse, StatusData, TokenInfoData, TxStatusData, UsageStatsView, UserInfoData,
        ValidateFeeRequest,
    },
    validation::{is_address, is_decimal, is_tx_hash, parse_address, parse_decimal, parse_tx_hash},
};

/// Largest `tokenDecimals` accepted by the fee endpoints.
const MAX_TOKEN_DECIMALS: u8 = 36;

pub struct AppState {
    pub pipeline: RelayPipeline,
    pub contract: Arc<dyn ContractService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub fee_calculator: FeeCalculator,
    pub contract_address: Option<String>,
    pub chain_id: u64,
    pub cors_origins: Vec<String>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        cfg: &Config,
        contract: Arc<dyn ContractService>,
        rate_limiter: Arc<RateLimiter>,
        captcha: Arc<dyn CaptchaVerifier>,
        fee_oracle: Arc<dyn FeeOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline: RelayPipeline::new(contract.clone(), rate_limiter.clone(), captcha, clock),
            contract,
            rate_limiter,
            fee_calculator: FeeCalculator::new(fee_oracle),
            contract_address: cfg.relayer_contract_address(),
            chain_id: cfg.chain_id,
            cors_origins: cfg.get_cors_origins(),
            start_time: Instant::now(),
        }
    }

    /// Override the contract address reported by `/status`.
    pub fn with_contract_address(mut self, address: impl Into<String>) -> Self {
        self.contract_address = Some(address.into());
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CalculateFeeResponse {
    success: bool,
    fee_breakdown: FeeBreakdown,
}

#[derive(Deserialize)]
struct TokenQuery {
    user: Option<String>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.cors_origins);

    Router::new()
        .route("/relay", post(relay))
        .route("/status", get(status))
        .route("/token/{address}", get(token_info))
        .route("/user/{address}", get(user_info))
        .route("/tx/{hash}", get(tx_status))
        .route("/calculate-fee", post(calculate_fee))
        .route("/validate-fee", post(validate_fee))
        .route("/estimate-gas", post(estimate_gas))
        .route("/health", get(health))
        .method_not_allowed_fallback(method_not_allowed)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// First hop of `x-forwarded-for`, then `x-real-ip`, else "unknown".
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real.trim().to_string();
    }

    "unknown".to_string()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message))).into_response()
}

/// Contract and internal failures on read endpoints answer 500 with a
/// per-endpoint message; other errors keep their own mapping.
fn endpoint_failure(message: &'static str) -> impl FnOnce(RelayError) -> Response {
    move |err| match err {
        RelayError::Contract(_) | RelayError::Internal(_) => {
            tracing::error!("{}: {}", message, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(message)),
            )
                .into_response()
        }
        other => other.into_response(),
    }
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(serde_json::json!({ "error": "Method not allowed" })),
    )
        .into_response()
}

async fn relay(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<RelayRequestPayload>, JsonRejection>,
) -> RelayResult<Json<RelayResponse>> {
    let ip = client_ip(&headers);
    let Json(payload) = body.map_err(|e| {
        tracing::warn!("[/relay] Invalid request body from {}: {}", ip, e.body_text());
        RelayError::Validation(e.body_text())
    })?;

    let tx_hash = state.pipeline.relay(&payload, &ip).await?;
    Ok(Json(RelayResponse::ok(tx_hash)))
}

async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DataResponse<StatusData>>, Response> {
    let Some(contract_address) = state.contract_address.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(
                "Contract not configured. Please set RELAYER_CONTRACT environment variable.",
            )),
        )
            .into_response());
    };

    let (is_paused, limits, fee_wallet) = tokio::try_join!(
        state.contract.is_paused(),
        state.contract.get_limits(),
        state.contract.get_fee_wallet(),
    )
    .map_err(endpoint_failure("Failed to get contract status"))?;

    Ok(Json(DataResponse::new(StatusData {
        contract_address,
        chain_id: state.chain_id,
        is_paused,
        max_transfer_amount: limits.max_transfer.to_string(),
        max_fee_amount: limits.max_fee.to_string(),
        fee_wallet: fee_wallet.to_string(),
    })))
}

async fn token_info(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<DataResponse<TokenInfoData>>, Response> {
    if !is_address(&address) {
        return Err(bad_request("Invalid token address format"));
    }
    let token = parse_address("token", &address).map_err(|e| bad_request(&e))?;

    let is_whitelisted = state
        .contract
        .is_token_whitelisted(token)
        .await
        .map_err(endpoint_failure("Failed to get token information"))?;

    let mut user_balance = None;
    let mut user_allowance = None;
    if let Some(user) = query.user.filter(|u| !u.is_empty()) {
        if !is_address(&user) {
            return Err(bad_request("Invalid user address format"));
        }
        let owner = parse_address("user", &user).map_err(|e| bad_request(&e))?;

        match state.contract.get_token_info(token, owner).await {
            Ok(info) => {
                user_balance = Some(info.balance.to_string());
                user_allowance = Some(info.allowance.to_string());
            }
            Err(e) => {
                tracing::warn!(
                    token = %address,
                    user = %user,
                    error = %e,
                    "Failed to get token info for user"
                );
            }
        }
    }

    Ok(Json(DataResponse::new(TokenInfoData {
        address,
        is_whitelisted,
        user_balance,
        user_allowance,
    })))
}

async fn user_info(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DataResponse<UserInfoData>>, Response> {
    if !is_address(&address) {
        return Err(bad_request("Invalid address format"));
    }
    let owner = parse_address("address", &address).map_err(|e| bad_request(&e))?;

    let nonce = state
        .contract
        .get_user_nonce(owner)
        .await
        .map_err(endpoint_failure("Failed to get user information"))?;

    let usage_stats = state
        .rate_limiter
        .get_usage_stats(&address)
        .map(|s| UsageStatsView {
            request_count: s.request_count,
            gas_used: s.gas_used.to_string(),
            reset_time: s.reset_time,
            gas_reset_time: s.gas_reset_time,
        });

    Ok(Json(DataResponse::new(UserInfoData {
        nonce: nonce.to_string(),
        usage_stats,
        is_banned: state.rate_limiter.is_banned(&address),
    })))
}

async fn tx_status(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Json<DataResponse<TxStatusData>>, Response> {
    if !is_tx_hash(&hash) {
        return Err(bad_request("Invalid transaction hash format"));
    }
    let tx_hash = parse_tx_hash(&hash).map_err(|e| bad_request(&e))?;

    let status = state
        .contract
        .get_transaction_status(tx_hash)
        .await
        .map_err(endpoint_failure("Failed to get transaction status"))?
        .ok_or_else(|| RelayError::NotFound("Transaction not found".to_string()).into_response())?;

    Ok(Json(DataResponse::new(TxStatusData {
        hash,
        status: status.state,
        block_number: status.block_number,
        confirmations: status.confirmations,
        gas_used: status.gas_used.map(|g| g.to_string()),
    })))
}

fn token_decimals(value: Option<u8>) -> Result<u8, Response> {
    let decimals = value.unwrap_or(DEFAULT_TOKEN_DECIMALS);
    if decimals > MAX_TOKEN_DECIMALS {
        return Err(bad_request("Invalid token decimals"));
    }
    Ok(decimals)
}

fn positive_amount(field: &str, value: &str) -> Result<alloy::primitives::U256, Response> {
    if !is_decimal(value) {
        return Err(bad_request(&format!("Invalid {}", field)));
    }
    let amount = parse_decimal(field, value).map_err(|e| bad_request(&e))?;
    if amount.is_zero() {
        return Err(bad_request("Transfer amount must be greater than 0"));
    }
    Ok(amount)
}

async fn calculate_fee(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CalculateFeeRequest>, JsonRejection>,
) -> Result<Json<CalculateFeeResponse>, Response> {
    let Json(req) = body.map_err(|e| {
        tracing::warn!("[/calculate-fee] Invalid request body: {}", e.body_text());
        bad_request("Invalid request format")
    })?;

    let (Some(token_address), Some(transfer_amount)) = (req.token_address, req.transfer_amount)
    else {
        return Err(bad_request("Missing required parameters"));
    };
    if !is_address(&token_address) {
        return Err(bad_request("Invalid token address format"));
    }
    let token = parse_address("token", &token_address).map_err(|e| bad_request(&e))?;
    let amount = positive_amount("transfer amount", &transfer_amount)?;
    let decimals = token_decimals(req.token_decimals)?;

    let fee_breakdown = state
        .fee_calculator
        .calculate_required_fee(token, amount, decimals)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok(Json(CalculateFeeResponse {
        success: true,
        fee_breakdown,
    }))
}

async fn validate_fee(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ValidateFeeRequest>, JsonRejection>,
) -> Result<Json<DataResponse<FeeValidation>>, Response> {
    let Json(req) = body.map_err(|e| {
        tracing::warn!("[/validate-fee] Invalid request body: {}", e.body_text());
        bad_request("Invalid request format")
    })?;

    let (Some(transfer_amount), Some(provided_fee)) = (req.transfer_amount, req.provided_fee)
    else {
        return Err(bad_request("Missing required parameters"));
    };
    let amount = positive_amount("transfer amount", &transfer_amount)?;
    if !is_decimal(&provided_fee) {
        return Err(bad_request("Invalid provided fee"));
    }
    let provided_fee = parse_decimal("provided fee", &provided_fee).map_err(|e| bad_request(&e))?;
    let decimals = token_decimals(req.token_decimals)?;

    let validation = state
        .fee_calculator
        .validate_transfer_fee(provided_fee, amount, decimals)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok(Json(DataResponse::new(validation)))
}

async fn estimate_gas(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EstimateGasRequest>, JsonRejection>,
) -> Result<Json<DataResponse<GasEstimation>>, Response> {
    let Json(req) = body.map_err(|e| {
        tracing::warn!("[/estimate-gas] Invalid request body: {}", e.body_text());
        bad_request("Invalid request format")
    })?;

    let Some(transfer_amount) = req.transfer_amount else {
        return Err(bad_request("Missing required parameters"));
    };
    let amount = positive_amount("transfer amount", &transfer_amount)?;

    let estimation = state
        .fee_calculator
        .estimate_gas_cost(amount)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok(Json(DataResponse::new(estimation)))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        tracked_identifiers: state.rate_limiter.tracked_count(),
        banned_identifiers: state.rate_limiter.banned_count(),
    })
}

pub struct HttpServer {
    host: String,
    port: u16,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(host: String, port: u16, state: Arc<AppState>) -> Self {
        Self { host, port, state }
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!("HTTP server listening on {}", addr);

        axum::serve(listener, create_router(self.state.clone()))
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server error")?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
