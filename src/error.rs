//! Error taxonomy for relay admission and the HTTP surface.

use alloy::primitives::U256;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::types::ErrorResponse;

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed request payload.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Request budget exhausted or owner banned. `retry_after` is in seconds.
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("captcha verification failed")]
    CaptchaFailed,

    #[error("transaction deadline expired")]
    Expired,

    /// Contract paused or otherwise refusing relays.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("token not whitelisted")]
    TokenNotAllowed,

    #[error("recipient contract not allowed")]
    RecipientNotAllowed,

    #[error("{0}")]
    LimitExceeded(String),

    #[error("invalid nonce: expected {expected}, provided {provided}")]
    InvalidNonce { expected: U256, provided: U256 },

    #[error("insufficient token balance")]
    InsufficientFunds,

    #[error("insufficient token allowance")]
    InsufficientAllowance,

    /// Deployment is missing connection parameters.
    #[error("contract service not configured")]
    NotConfigured,

    /// A contract read or write failed.
    #[error("contract call failed: {0}")]
    Contract(String),

    #[error("fee calculation failed: {0}")]
    Calculation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_)
            | RelayError::CaptchaFailed
            | RelayError::Expired
            | RelayError::InvalidSignature
            | RelayError::TokenNotAllowed
            | RelayError::RecipientNotAllowed
            | RelayError::LimitExceeded(_)
            | RelayError::InvalidNonce { .. }
            | RelayError::InsufficientFunds
            | RelayError::InsufficientAllowance => StatusCode::BAD_REQUEST,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::ServiceUnavailable(_) | RelayError::NotConfigured => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Contract(_) | RelayError::Calculation(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message returned to callers. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Validation(_) => "Invalid request format".to_string(),
            RelayError::RateLimited { .. } => "Rate limit exceeded".to_string(),
            RelayError::CaptchaFailed => "reCAPTCHA verification failed".to_string(),
            RelayError::Expired => "Transaction deadline expired".to_string(),
            RelayError::ServiceUnavailable(msg) => msg.clone(),
            RelayError::InvalidSignature => "Invalid signature".to_string(),
            RelayError::TokenNotAllowed => "Token not whitelisted".to_string(),
            RelayError::RecipientNotAllowed => "Recipient contract not allowed".to_string(),
            RelayError::LimitExceeded(msg) => msg.clone(),
            RelayError::InvalidNonce { .. } => "Invalid nonce".to_string(),
            RelayError::InsufficientFunds => "Insufficient token balance".to_string(),
            RelayError::InsufficientAllowance => "Insufficient token allowance".to_string(),
            RelayError::NotConfigured => "Contract service not configured".to_string(),
            RelayError::Calculation(_) => "Failed to calculate fees".to_string(),
            RelayError::NotFound(msg) => msg.clone(),
            RelayError::Contract(_) | RelayError::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            RelayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();
        let mut response = (status, Json(ErrorResponse::new(self.public_message()))).into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
