use std::str::FromStr;

use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    transports::http::reqwest::Url,
};
use alloy_sol_types::Eip712Domain;
use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{
    ContractLimits, ContractService, SubmittedTransaction, TokenBalance, TransactionStatus,
    EXECUTION_GAS_BUFFER,
};
use crate::{
    abi::{self, IGaslessRelayer, IERC20},
    config::Config,
    eip712,
    error::{RelayError, RelayResult},
    types::{MetaTransfer, PermitData, TxState},
};

/// Build a read-only provider for `rpc_url`.
pub fn read_provider(rpc_url: &str) -> Result<DynProvider> {
    let url = Url::parse(rpc_url).context("Invalid RPC URL")?;
    Ok(ProviderBuilder::new().connect_http(url).erased())
}

struct Connected {
    provider: DynProvider,
    relayer: Address,
}

/// Contract service backed by a JSON-RPC node and the relayer wallet.
pub struct OnchainContractService {
    connected: Option<Connected>,
    domain: Eip712Domain,
}

fn contract_error<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> RelayError {
    move |e| {
        tracing::error!("{}: {}", what, e);
        RelayError::Contract(format!("{}: {}", what, e))
    }
}

impl OnchainContractService {
    /// Connect using the configured RPC URL, relayer key and contract.
    /// Missing settings yield a service whose calls fail with `NotConfigured`;
    /// malformed settings are an error.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let verifying_contract = cfg
            .relayer_contract_address()
            .map(|a| Address::from_str(&a))
            .transpose()
            .context("Invalid RELAYER_CONTRACT address")?
            .unwrap_or(Address::ZERO);
        let domain = eip712::relayer_domain(cfg.chain_id, verifying_contract);

        let Some(settings) = cfg.contract_settings() else {
            tracing::warn!("Contract service not configured; relay endpoints will answer 503");
            return Ok(Self {
                connected: None,
                domain,
            });
        };

        let signer = settings
            .private_key
            .parse::<PrivateKeySigner>()
            .context("Failed to parse relayer private key")?;
        tracing::info!("Relayer address: 0x{:x}", signer.address());

        let url = Url::parse(&settings.rpc_url).context("Invalid CHAIN_RPC_URL")?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        Ok(Self {
            connected: Some(Connected {
                provider,
                relayer: verifying_contract,
            }),
            domain,
        })
    }

    fn connected(&self) -> RelayResult<&Connected> {
        self.connected.as_ref().ok_or(RelayError::NotConfigured)
    }

    fn relayer(&self) -> RelayResult<IGaslessRelayer::IGaslessRelayerInstance<DynProvider>> {
        let c = self.connected()?;
        Ok(IGaslessRelayer::new(c.relayer, c.provider.clone()))
    }
}

#[async_trait]
impl ContractService for OnchainContractService {
    async fn is_paused(&self) -> RelayResult<bool> {
        self.relayer()?
            .paused()
            .call()
            .await
            .map_err(contract_error("Failed to check contract pause status"))
    }

    async fn is_token_whitelisted(&self, token: Address) -> RelayResult<bool> {
        self.relayer()?
            .isTokenWhitelisted(token)
            .call()
            .await
            .map_err(contract_error("Failed to check token whitelist"))
    }

    async fn is_recipient_allowed(&self, recipient: Address) -> RelayResult<bool> {
        let c = self.connected()?;
        let code = c
            .provider
            .get_code_at(recipient)
            .await
            .map_err(contract_error("Failed to read recipient code"))?;
        if code.is_empty() {
            return Ok(true);
        }

        self.relayer()?
            .isRecipientContractAllowed(recipient)
            .call()
            .await
            .map_err(contract_error("Failed to check recipient allowance"))
    }

    async fn get_limits(&self) -> RelayResult<ContractLimits> {
        let relayer = self.relayer()?;
        let max_transfer_call = relayer.maxTransferAmount();
        let max_fee_call = relayer.maxFeeAmount();
        let (max_transfer, max_fee) = tokio::try_join!(
            async { max_transfer_call.call().await },
            async { max_fee_call.call().await },
        )
        .map_err(contract_error("Failed to get contract limits"))?;

        Ok(ContractLimits {
            max_transfer,
            max_fee,
        })
    }

    async fn get_user_nonce(&self, owner: Address) -> RelayResult<U256> {
        self.relayer()?
            .getNonce(owner)
            .call()
            .await
            .map_err(contract_error("Failed to get user nonce"))
    }

    async fn get_token_info(&self, token: Address, owner: Address) -> RelayResult<TokenBalance> {
        let c = self.connected()?;
        let erc20 = IERC20::new(token, c.provider.clone());
        let balance_call = erc20.balanceOf(owner);
        let allowance_call = erc20.allowance(owner, c.relayer);
        let (balance, allowance) = tokio::try_join!(
            async { balance_call.call().await },
            async { allowance_call.call().await },
        )
        .map_err(contract_error("Failed to get token information"))?;

        Ok(TokenBalance { balance, allowance })
    }

    async fn get_fee_wallet(&self) -> RelayResult<Address> {
        self.relayer()?
            .feeWallet()
            .call()
            .await
            .map_err(contract_error("Failed to get fee wallet address"))
    }

    fn verify_signature(&self, meta_transfer: &MetaTransfer, signature: &[u8]) -> bool {
        eip712::verify_signature(meta_transfer, signature, &self.domain)
    }

    async fn execute_meta_transfer(
        &self,
        meta_transfer: &MetaTransfer,
        permit: &PermitData,
        signature: &Bytes,
    ) -> RelayResult<SubmittedTransaction> {
        let relayer = self.relayer()?;
        let call = relayer.executeMetaTransfer(
            abi::MetaTransfer::from(meta_transfer),
            abi::PermitData::from(permit),
            signature.clone(),
        );

        let estimate = call
            .estimate_gas()
            .await
            .map_err(contract_error("Meta transfer gas estimation failed"))?;
        let gas_limit = estimate.saturating_add(EXECUTION_GAS_BUFFER);
        tracing::debug!(
            "Gas estimate {} for owner 0x{:x}, submitting with limit {}",
            estimate,
            meta_transfer.owner,
            gas_limit
        );

        let pending = call
            .gas(gas_limit)
            .send()
            .await
            .map_err(contract_error("Failed to execute meta transfer"))?;
        let tx_hash = *pending.tx_hash();
        tracing::info!("Transaction submitted: 0x{:x}", tx_hash);

        Ok(SubmittedTransaction { tx_hash, gas_limit })
    }

    async fn get_transaction_status(
        &self,
        tx_hash: B256,
    ) -> RelayResult<Option<TransactionStatus>> {
        let c = self.connected()?;
        let (tx, receipt) = tokio::try_join!(
            c.provider.get_transaction_by_hash(tx_hash),
            c.provider.get_transaction_receipt(tx_hash),
        )
        .map_err(contract_error("Failed to get transaction status"))?;

        if tx.is_none() {
            return Ok(None);
        }

        let Some(receipt) = receipt else {
            return Ok(Some(TransactionStatus {
                state: TxState::Pending,
                block_number: None,
                confirmations: None,
                gas_used: None,
            }));
        };

        let head = c
            .provider
            .get_block_number()
            .await
            .map_err(contract_error("Failed to get block number"))?;
        let confirmations = receipt
            .block_number
            .map(|b| head.saturating_sub(b) + 1);

        Ok(Some(TransactionStatus {
            state: if receipt.status() {
                TxState::Confirmed
            } else {
                TxState::Failed
            },
            block_number: receipt.block_number,
            confirmations,
            gas_used: Some(receipt.gas_used),
        }))
    }
}
