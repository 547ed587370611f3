//! EIP-712 hashing and signer recovery for meta-transfers.

use alloy::primitives::{Address, Signature, B256, U256};
use alloy_sol_types::{Eip712Domain, SolStruct};

use crate::abi;
use crate::types::MetaTransfer;

pub const DOMAIN_NAME: &str = "GaslessRelayer";
pub const DOMAIN_VERSION: &str = "1";

/// Signing domain of the relayer contract.
pub fn relayer_domain(chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain {
        name: Some(DOMAIN_NAME.into()),
        version: Some(DOMAIN_VERSION.into()),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(verifying_contract),
        salt: None,
    }
}

/// The digest an owner signs to authorize `meta_transfer`.
pub fn signing_hash(meta_transfer: &MetaTransfer, domain: &Eip712Domain) -> B256 {
    abi::MetaTransfer::from(meta_transfer).eip712_signing_hash(domain)
}

/// Recover the address that produced `signature` over `meta_transfer`.
pub fn recover_signer(
    meta_transfer: &MetaTransfer,
    signature: &[u8],
    domain: &Eip712Domain,
) -> Option<Address> {
    let sig = match Signature::try_from(signature) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::debug!("Failed to decode signature: {}", e);
            return None;
        }
    };
    let digest = signing_hash(meta_transfer, domain);
    match sig.recover_address_from_prehash(&digest) {
        Ok(addr) => Some(addr),
        Err(e) => {
            tracing::debug!("Failed to recover signer: {}", e);
            None
        }
    }
}

/// True when `signature` was produced by `meta_transfer.owner`.
pub fn verify_signature(
    meta_transfer: &MetaTransfer,
    signature: &[u8],
    domain: &Eip712Domain,
) -> bool {
    // Address equality is byte equality, so checksum casing never matters.
    recover_signer(meta_transfer, signature, domain) == Some(meta_transfer.owner)
}
