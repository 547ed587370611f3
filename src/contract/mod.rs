//! Boundary to the on-chain relayer contract.
//!
//! Pause state, whitelists, limits, nonces and settlement all live in the
//! contract; this module only reads them and submits transactions.

mod onchain;
mod stub;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::error::RelayResult;
use crate::types::{MetaTransfer, PermitData, TxState};

pub use onchain::{read_provider, OnchainContractService};
pub use stub::StubContractService;

/// Gas added on top of the estimate when submitting a meta-transfer.
pub const EXECUTION_GAS_BUFFER: u64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractLimits {
    pub max_transfer: U256,
    pub max_fee: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBalance {
    pub balance: U256,
    /// Allowance granted to the relayer contract.
    pub allowance: U256,
}

/// A transaction handed to the network, not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedTransaction {
    pub tx_hash: B256,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStatus {
    pub state: TxState,
    pub block_number: Option<u64>,
    pub confirmations: Option<u64>,
    pub gas_used: Option<u64>,
}

#[async_trait]
pub trait ContractService: Send + Sync {
    async fn is_paused(&self) -> RelayResult<bool>;

    async fn is_token_whitelisted(&self, token: Address) -> RelayResult<bool>;

    /// Externally-owned accounts are always allowed; contracts must be on the
    /// recipient allowlist.
    async fn is_recipient_allowed(&self, recipient: Address) -> RelayResult<bool>;

    async fn get_limits(&self) -> RelayResult<ContractLimits>;

    async fn get_user_nonce(&self, owner: Address) -> RelayResult<U256>;

    async fn get_token_info(&self, token: Address, owner: Address) -> RelayResult<TokenBalance>;

    async fn get_fee_wallet(&self) -> RelayResult<Address>;

    /// EIP-712 check that `signature` was made by `meta_transfer.owner`.
    fn verify_signature(&self, meta_transfer: &MetaTransfer, signature: &[u8]) -> bool;

    /// Submit the meta-transfer and return without waiting for inclusion.
    async fn execute_meta_transfer(
        &self,
        meta_transfer: &MetaTransfer,
        permit: &PermitData,
        signature: &Bytes,
    ) -> RelayResult<SubmittedTransaction>;

    /// `None` when the chain does not know the transaction.
    async fn get_transaction_status(&self, tx_hash: B256)
        -> RelayResult<Option<TransactionStatus>>;
}
