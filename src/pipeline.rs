//! Admission pipeline for relay requests.
//!
//! Checks run in a fixed order and the first failure ends the request. Only
//! the rate limit counter and the final submission have side effects.

use std::sync::Arc;

use alloy::primitives::{B256, U256};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    captcha::CaptchaVerifier,
    clock::Clock,
    contract::ContractService,
    error::{RelayError, RelayResult},
    rate_limiter::RateLimiter,
    types::{MetaTransfer, RelayRequestPayload},
    validation::parse_relay_request,
};

pub struct RelayPipeline {
    contract: Arc<dyn ContractService>,
    rate_limiter: Arc<RateLimiter>,
    captcha: Arc<dyn CaptchaVerifier>,
    clock: Arc<dyn Clock>,
}

fn rejected(mt: &MetaTransfer, reason: &str, err: RelayError) -> RelayError {
    tracing::warn!(
        owner = %mt.owner,
        token = %mt.token,
        amount = %mt.amount,
        reason,
        "Relay rejected"
    );
    err
}

fn read_failed<'a>(mt: &'a MetaTransfer, step: &'static str) -> impl FnOnce(&RelayError) + 'a {
    move |e| {
        tracing::error!(
            owner = %mt.owner,
            step,
            reason = %e,
            "Relay aborted: contract read failed"
        );
    }
}

impl RelayPipeline {
    pub fn new(
        contract: Arc<dyn ContractService>,
        rate_limiter: Arc<RateLimiter>,
        captcha: Arc<dyn CaptchaVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            contract,
            rate_limiter,
            captcha,
            clock,
        }
    }

    /// Validate, admit and submit one relay request. Returns the hash of the
    /// submitted transaction.
    pub async fn relay(&self, payload: &RelayRequestPayload, client_ip: &str) -> RelayResult<B256> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("relay", %request_id, client_ip);
        self.process(payload, client_ip).instrument(span).await
    }

    async fn process(&self, payload: &RelayRequestPayload, client_ip: &str) -> RelayResult<B256> {
        let request = parse_relay_request(payload).inspect_err(|e| {
            tracing::warn!(reason = %e, "Relay request failed validation");
        })?;
        let mt = &request.meta_transfer;
        let owner = format!("{:#x}", mt.owner);

        tracing::info!(
            owner = %mt.owner,
            token = %mt.token,
            recipient = %mt.recipient,
            amount = %mt.amount,
            fee = %mt.fee,
            "Relay attempt"
        );

        let permit = self.rate_limiter.try_reserve(&owner).map_err(|decision| {
            tracing::warn!(owner = %mt.owner, retry_after = ?decision.retry_after, "Rate limit hit");
            RelayError::RateLimited {
                retry_after: decision.retry_after,
            }
        })?;

        if !self
            .captcha
            .verify(&request.recaptcha_token, Some(client_ip))
            .await
        {
            tracing::warn!(owner = %mt.owner, "CAPTCHA verification failed");
            return Err(RelayError::CaptchaFailed);
        }

        permit.commit();

        let now = U256::from(self.clock.now_secs().max(0) as u64);
        if mt.deadline <= now {
            return Err(rejected(mt, "Deadline expired", RelayError::Expired));
        }

        let paused = self
            .contract
            .is_paused()
            .await
            .inspect_err(read_failed(mt, "is_paused"))?;
        if paused {
            return Err(rejected(
                mt,
                "Contract paused",
                RelayError::ServiceUnavailable("Contract is currently paused".to_string()),
            ));
        }

        if !self.contract.verify_signature(mt, &request.signature) {
            tracing::error!(
                owner = %mt.owner,
                signature = %request.signature,
                "Security violation: invalid signature"
            );
            return Err(RelayError::InvalidSignature);
        }

        let token_allowed = self
            .contract
            .is_token_whitelisted(mt.token)
            .await
            .inspect_err(read_failed(mt, "is_token_whitelisted"))?;
        if !token_allowed {
            return Err(rejected(mt, "Token not whitelisted", RelayError::TokenNotAllowed));
        }

        let recipient_allowed = self
            .contract
            .is_recipient_allowed(mt.recipient)
            .await
            .inspect_err(read_failed(mt, "is_recipient_allowed"))?;
        if !recipient_allowed {
            return Err(rejected(
                mt,
                "Recipient not allowed",
                RelayError::RecipientNotAllowed,
            ));
        }

        let limits = self
            .contract
            .get_limits()
            .await
            .inspect_err(read_failed(mt, "get_limits"))?;
        if mt.amount > limits.max_transfer {
            return Err(rejected(
                mt,
                "Amount exceeds maximum",
                RelayError::LimitExceeded("Amount exceeds maximum allowed".to_string()),
            ));
        }
        if mt.fee > limits.max_fee {
            return Err(rejected(
                mt,
                "Fee exceeds maximum",
                RelayError::LimitExceeded("Fee exceeds maximum allowed".to_string()),
            ));
        }

        let current_nonce = self
            .contract
            .get_user_nonce(mt.owner)
            .await
            .inspect_err(read_failed(mt, "get_user_nonce"))?;
        if mt.nonce != current_nonce {
            tracing::warn!(
                owner = %mt.owner,
                expected_nonce = %current_nonce,
                provided_nonce = %mt.nonce,
                "Relay rejected: invalid nonce"
            );
            return Err(RelayError::InvalidNonce {
                expected: current_nonce,
                provided: mt.nonce,
            });
        }

        let funds = self
            .contract
            .get_token_info(mt.token, mt.owner)
            .await
            .inspect_err(read_failed(mt, "get_token_info"))?;
        let total_needed = mt.total_needed();
        if funds.balance < total_needed {
            return Err(rejected(mt, "Insufficient balance", RelayError::InsufficientFunds));
        }
        if funds.allowance < total_needed {
            return Err(rejected(
                mt,
                "Insufficient allowance",
                RelayError::InsufficientAllowance,
            ));
        }

        let submitted = self
            .contract
            .execute_meta_transfer(mt, &request.permit_data, &request.signature)
            .await
            .map_err(|e| {
                tracing::error!(owner = %mt.owner, error = %e, "Meta transfer submission failed");
                RelayError::Internal(e.to_string())
            })?;

        if !self
            .rate_limiter
            .add_gas_usage(&owner, submitted.gas_limit)
        {
            tracing::warn!(
                owner = %mt.owner,
                gas = submitted.gas_limit,
                "Hourly gas budget exceeded, owner banned"
            );
        }

        tracing::info!(
            tx_hash = %format!("0x{:x}", submitted.tx_hash),
            owner = %mt.owner,
            token = %mt.token,
            amount = %mt.amount,
            "Relay submitted"
        );
        Ok(submitted.tx_hash)
    }
}
