use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialize `U256` values as decimal digit strings.
pub mod u256_decimal {
    use alloy::primitives::U256;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }
}

/// Meta-transfer as it arrives on the wire: addresses and integers are strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaTransferPayload {
    pub owner: String,
    pub token: String,
    pub recipient: String,
    pub amount: String,
    pub fee: String,
    pub deadline: String,
    pub nonce: String,
}

/// EIP-2612 permit as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitDataPayload {
    pub value: String,
    pub deadline: String,
    pub v: i64,
    pub r: String,
    pub s: String,
}

/// Body of `POST /relay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequestPayload {
    pub meta_transfer: MetaTransferPayload,
    pub permit_data: PermitDataPayload,
    pub signature: String,
    pub recaptcha_token: String,
}

/// Validated meta-transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTransfer {
    pub owner: Address,
    pub token: Address,
    pub recipient: Address,
    pub amount: U256,
    pub fee: U256,
    pub deadline: U256,
    pub nonce: U256,
}

impl MetaTransfer {
    /// Amount the relayer contract pulls from the owner.
    pub fn total_needed(&self) -> U256 {
        self.amount.saturating_add(self.fee)
    }
}

/// Validated EIP-2612 permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitData {
    pub value: U256,
    pub deadline: U256,
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

/// Relay request after schema validation.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub meta_transfer: MetaTransfer,
    pub permit_data: PermitData,
    pub signature: Bytes,
    pub recaptcha_token: String,
}

/// Response of `POST /relay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayResponse {
    pub fn ok(tx_hash: B256) -> Self {
        Self {
            success: true,
            tx_hash: Some(format!("0x{:x}", tx_hash)),
            error: None,
        }
    }
}

/// Error body shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Success envelope for the read endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> DataResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub contract_address: String,
    pub chain_id: u64,
    pub is_paused: bool,
    pub max_transfer_amount: String,
    pub max_fee_amount: String,
    pub fee_wallet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfoData {
    pub address: String,
    pub is_whitelisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_balance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_allowance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatsView {
    pub request_count: u32,
    pub gas_used: String,
    pub reset_time: i64,
    pub gas_reset_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoData {
    pub nonce: String,
    pub usage_stats: Option<UsageStatsView>,
    pub is_banned: bool,
}

/// On-chain state of a submitted transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStatusData {
    pub hash: String,
    pub status: TxState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
}

/// Body of `POST /calculate-fee`. Fields are optional so that missing values
/// surface as a 400 instead of a deserialization rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculateFeeRequest {
    pub token_address: Option<String>,
    pub transfer_amount: Option<String>,
    pub token_decimals: Option<u8>,
}

/// Body of `POST /validate-fee`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateFeeRequest {
    pub transfer_amount: Option<String>,
    pub provided_fee: Option<String>,
    pub token_decimals: Option<u8>,
}

/// Body of `POST /estimate-gas`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateGasRequest {
    pub transfer_amount: Option<String>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub tracked_identifiers: usize,
    pub banned_identifiers: usize,
}
