use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
};

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::Eip712Domain;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    ContractLimits, ContractService, SubmittedTransaction, TokenBalance, TransactionStatus,
    EXECUTION_GAS_BUFFER,
};
use crate::{
    config::Config,
    eip712,
    error::{RelayError, RelayResult},
    types::{MetaTransfer, PermitData, TxState},
};

/// Gas the stub reports as the execution estimate.
pub const STUB_GAS_ESTIMATE: u64 = 135_000;

struct StubState {
    paused: bool,
    limits: ContractLimits,
    fee_wallet: Address,
    whitelisted_tokens: HashSet<Address>,
    contract_accounts: HashSet<Address>,
    allowed_recipient_contracts: HashSet<Address>,
    nonces: HashMap<Address, U256>,
    // (token, owner)
    balances: HashMap<(Address, Address), TokenBalance>,
    // reported for (token, owner) pairs with no explicit balance
    default_funds: TokenBalance,
    transactions: HashMap<B256, TransactionStatus>,
    fail_reads: bool,
    fail_submissions: bool,
    block_number: u64,
    calls: HashMap<&'static str, usize>,
}

/// In-memory relayer contract used in stub mode and tests.
///
/// Mirrors the checks the deployed contract performs on execution, so a
/// successful relay advances the owner's nonce and moves the owner's funds.
pub struct StubContractService {
    address: Address,
    domain: Eip712Domain,
    state: Mutex<StubState>,
}

impl StubContractService {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self {
            address,
            domain: eip712::relayer_domain(chain_id, address),
            state: Mutex::new(StubState {
                paused: false,
                limits: ContractLimits {
                    // 10,000 and 100 units of a 6-decimal token
                    max_transfer: U256::from(10_000_000_000u64),
                    max_fee: U256::from(100_000_000u64),
                },
                fee_wallet: Address::ZERO,
                whitelisted_tokens: HashSet::new(),
                contract_accounts: HashSet::new(),
                allowed_recipient_contracts: HashSet::new(),
                nonces: HashMap::new(),
                balances: HashMap::new(),
                default_funds: TokenBalance {
                    balance: U256::ZERO,
                    allowance: U256::ZERO,
                },
                transactions: HashMap::new(),
                fail_reads: false,
                fail_submissions: false,
                block_number: 1,
                calls: HashMap::new(),
            }),
        }
    }

    /// Stub seeded from the `stub_*` settings: whitelisted tokens and a
    /// default balance and allowance for every owner.
    pub fn from_config(config: &Config, address: Address) -> anyhow::Result<Self> {
        let stub = Self::new(config.chain_id, address);
        for token in config.get_stub_whitelisted_tokens() {
            let token = Address::from_str(&token)
                .with_context(|| format!("Invalid STUB_WHITELISTED_TOKENS entry '{}'", token))?;
            stub.whitelist_token(token);
            tracing::info!("Stub mode: whitelisted token {:#x}", token);
        }

        let funds = U256::from(config.stub_default_balance);
        stub.set_default_funds(funds, funds);
        Ok(stub)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn domain(&self) -> &Eip712Domain {
        &self.domain
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn set_limits(&self, max_transfer: U256, max_fee: U256) {
        self.state.lock().limits = ContractLimits {
            max_transfer,
            max_fee,
        };
    }

    pub fn set_fee_wallet(&self, fee_wallet: Address) {
        self.state.lock().fee_wallet = fee_wallet;
    }

    pub fn whitelist_token(&self, token: Address) {
        self.state.lock().whitelisted_tokens.insert(token);
    }

    /// Treat `account` as a contract (it has code).
    pub fn mark_contract(&self, account: Address) {
        self.state.lock().contract_accounts.insert(account);
    }

    pub fn allow_recipient_contract(&self, recipient: Address) {
        let mut state = self.state.lock();
        state.contract_accounts.insert(recipient);
        state.allowed_recipient_contracts.insert(recipient);
    }

    pub fn set_nonce(&self, owner: Address, nonce: U256) {
        self.state.lock().nonces.insert(owner, nonce);
    }

    pub fn set_token_balance(&self, token: Address, owner: Address, balance: U256, allowance: U256) {
        self.state
            .lock()
            .balances
            .insert((token, owner), TokenBalance { balance, allowance });
    }

    pub fn set_default_funds(&self, balance: U256, allowance: U256) {
        self.state.lock().default_funds = TokenBalance { balance, allowance };
    }

    /// Make nonce and token balance reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Make every subsequent submission fail.
    pub fn fail_submissions(&self, fail: bool) {
        self.state.lock().fail_submissions = fail;
    }

    /// Number of times `method` has been called.
    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn submitted_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    fn funds(state: &StubState, token: Address, owner: Address) -> TokenBalance {
        state
            .balances
            .get(&(token, owner))
            .copied()
            .unwrap_or(state.default_funds)
    }

    fn record(state: &mut StubState, method: &'static str) {
        *state.calls.entry(method).or_insert(0) += 1;
    }
}

#[async_trait]
impl ContractService for StubContractService {
    async fn is_paused(&self) -> RelayResult<bool> {
        let mut state = self.state.lock();
        Self::record(&mut state, "is_paused");
        Ok(state.paused)
    }

    async fn is_token_whitelisted(&self, token: Address) -> RelayResult<bool> {
        let mut state = self.state.lock();
        Self::record(&mut state, "is_token_whitelisted");
        Ok(state.whitelisted_tokens.contains(&token))
    }

    async fn is_recipient_allowed(&self, recipient: Address) -> RelayResult<bool> {
        let mut state = self.state.lock();
        Self::record(&mut state, "is_recipient_allowed");
        if !state.contract_accounts.contains(&recipient) {
            return Ok(true);
        }
        Ok(state.allowed_recipient_contracts.contains(&recipient))
    }

    async fn get_limits(&self) -> RelayResult<ContractLimits> {
        let mut state = self.state.lock();
        Self::record(&mut state, "get_limits");
        Ok(state.limits)
    }

    async fn get_user_nonce(&self, owner: Address) -> RelayResult<U256> {
        let mut state = self.state.lock();
        Self::record(&mut state, "get_user_nonce");
        if state.fail_reads {
            return Err(RelayError::Contract("nonces() call failed".to_string()));
        }
        Ok(state.nonces.get(&owner).copied().unwrap_or(U256::ZERO))
    }

    async fn get_token_info(&self, token: Address, owner: Address) -> RelayResult<TokenBalance> {
        let mut state = self.state.lock();
        Self::record(&mut state, "get_token_info");
        if state.fail_reads {
            return Err(RelayError::Contract("balanceOf() call failed".to_string()));
        }
        Ok(Self::funds(&state, token, owner))
    }

    async fn get_fee_wallet(&self) -> RelayResult<Address> {
        let mut state = self.state.lock();
        Self::record(&mut state, "get_fee_wallet");
        Ok(state.fee_wallet)
    }

    fn verify_signature(&self, meta_transfer: &MetaTransfer, signature: &[u8]) -> bool {
        Self::record(&mut self.state.lock(), "verify_signature");
        eip712::verify_signature(meta_transfer, signature, &self.domain)
    }

    async fn execute_meta_transfer(
        &self,
        meta_transfer: &MetaTransfer,
        _permit: &PermitData,
        _signature: &Bytes,
    ) -> RelayResult<SubmittedTransaction> {
        let mut state = self.state.lock();
        Self::record(&mut state, "execute_meta_transfer");

        if state.fail_submissions {
            return Err(RelayError::Contract("execution reverted".to_string()));
        }
        if state.paused {
            return Err(RelayError::Contract("execution reverted: paused".to_string()));
        }

        let owner = meta_transfer.owner;
        let expected = state.nonces.get(&owner).copied().unwrap_or(U256::ZERO);
        if meta_transfer.nonce != expected {
            return Err(RelayError::Contract(
                "execution reverted: invalid nonce".to_string(),
            ));
        }

        let total = meta_transfer.total_needed();
        let key = (meta_transfer.token, owner);
        let funds = Self::funds(&state, meta_transfer.token, owner);
        if funds.balance < total || funds.allowance < total {
            return Err(RelayError::Contract(
                "execution reverted: insufficient funds".to_string(),
            ));
        }

        state.balances.insert(
            key,
            TokenBalance {
                balance: funds.balance - total,
                allowance: funds.allowance - total,
            },
        );
        state.nonces.insert(owner, expected + U256::from(1u8));

        state.block_number += 1;
        let tx_hash = keccak256(Uuid::new_v4().as_bytes());
        let block_number = state.block_number;
        state.transactions.insert(
            tx_hash,
            TransactionStatus {
                state: TxState::Confirmed,
                block_number: Some(block_number),
                confirmations: None,
                gas_used: Some(STUB_GAS_ESTIMATE),
            },
        );
        tracing::info!("Stub mode: recorded transaction 0x{:x}", tx_hash);

        Ok(SubmittedTransaction {
            tx_hash,
            gas_limit: STUB_GAS_ESTIMATE + EXECUTION_GAS_BUFFER,
        })
    }

    async fn get_transaction_status(
        &self,
        tx_hash: B256,
    ) -> RelayResult<Option<TransactionStatus>> {
        let mut state = self.state.lock();
        Self::record(&mut state, "get_transaction_status");
        let head = state.block_number;
        Ok(state.transactions.get(&tx_hash).map(|tx| TransactionStatus {
            confirmations: tx.block_number.map(|b| head - b + 1),
            ..tx.clone()
        }))
    }
}
