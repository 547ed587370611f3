//! Schema validation for inbound payloads.
//!
//! Addresses must be `0x` + 40 hex digits, hashes `0x` + 64, integers plain
//! decimal digits fitting in 256 bits.

use std::str::FromStr;

use alloy::hex;
use alloy::primitives::{Address, Bytes, B256, U256};

use crate::error::{RelayError, RelayResult};
use crate::types::{MetaTransfer, PermitData, RelayRequest, RelayRequestPayload};

fn is_prefixed_hex(value: &str, digits: Option<usize>) -> bool {
    let Some(body) = value.strip_prefix("0x") else {
        return false;
    };
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }
    digits.map_or(true, |n| body.len() == n)
}

/// `0x` followed by exactly 40 hex digits.
pub fn is_address(value: &str) -> bool {
    is_prefixed_hex(value, Some(40))
}

/// `0x` followed by exactly 64 hex digits.
pub fn is_tx_hash(value: &str) -> bool {
    is_prefixed_hex(value, Some(64))
}

pub fn is_decimal(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

pub fn parse_address(field: &str, value: &str) -> Result<Address, String> {
    if !is_address(value) {
        return Err(format!("Invalid {} address", field));
    }
    Address::from_str(value).map_err(|e| format!("Invalid {} address: {}", field, e))
}

pub fn parse_decimal(field: &str, value: &str) -> Result<U256, String> {
    if !is_decimal(value) {
        return Err(format!("Invalid {}", field));
    }
    U256::from_str_radix(value, 10).map_err(|_| format!("Invalid {}: out of range", field))
}

pub fn parse_tx_hash(value: &str) -> Result<B256, String> {
    if !is_tx_hash(value) {
        return Err("Invalid transaction hash format".to_string());
    }
    B256::from_str(value).map_err(|e| format!("Invalid transaction hash: {}", e))
}

fn parse_word(field: &str, value: &str) -> Result<B256, String> {
    if !is_prefixed_hex(value, Some(64)) {
        return Err(format!("Invalid {} signature", field));
    }
    B256::from_str(value).map_err(|e| format!("Invalid {} signature: {}", field, e))
}

fn parse_signature(value: &str) -> Result<Bytes, String> {
    if !is_prefixed_hex(value, None) {
        return Err("Invalid signature".to_string());
    }
    // Odd-length hex passes the pattern but cannot be decoded; reject it here.
    hex::decode(&value[2..])
        .map(Bytes::from)
        .map_err(|e| format!("Invalid signature: {}", e))
}

fn collect<T>(errors: &mut Vec<String>, result: Result<T, String>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(e);
            None
        }
    }
}

/// Validate every field of a relay payload, collecting all problems.
pub fn parse_relay_request(payload: &RelayRequestPayload) -> RelayResult<RelayRequest> {
    let mut errors = Vec::new();

    let mt = &payload.meta_transfer;
    let owner = collect(&mut errors, parse_address("owner", &mt.owner));
    let token = collect(&mut errors, parse_address("token", &mt.token));
    let recipient = collect(&mut errors, parse_address("recipient", &mt.recipient));
    let amount = collect(&mut errors, parse_decimal("amount", &mt.amount).and_then(|a| {
        if a.is_zero() {
            Err("Invalid amount: must be greater than zero".to_string())
        } else {
            Ok(a)
        }
    }));
    let fee = collect(&mut errors, parse_decimal("fee", &mt.fee));
    let deadline = collect(&mut errors, parse_decimal("deadline", &mt.deadline));
    let nonce = collect(&mut errors, parse_decimal("nonce", &mt.nonce));

    let pd = &payload.permit_data;
    let value = collect(&mut errors, parse_decimal("permit value", &pd.value));
    let permit_deadline = collect(&mut errors, parse_decimal("permit deadline", &pd.deadline));
    let v = collect(&mut errors, match pd.v {
        27 | 28 => Ok(pd.v as u8),
        other => Err(format!("Invalid permit v: {}", other)),
    });
    let r = collect(&mut errors, parse_word("r", &pd.r));
    let s = collect(&mut errors, parse_word("s", &pd.s));

    let signature = collect(&mut errors, parse_signature(&payload.signature));
    let recaptcha_ok = collect(&mut errors, if payload.recaptcha_token.is_empty() {
        Err("reCAPTCHA token required".to_string())
    } else {
        Ok(())
    });

    match (
        owner,
        token,
        recipient,
        amount,
        fee,
        deadline,
        nonce,
        value,
        permit_deadline,
        v,
        r,
        s,
        signature,
        recaptcha_ok,
    ) {
        (
            Some(owner),
            Some(token),
            Some(recipient),
            Some(amount),
            Some(fee),
            Some(deadline),
            Some(nonce),
            Some(value),
            Some(permit_deadline),
            Some(v),
            Some(r),
            Some(s),
            Some(signature),
            Some(()),
        ) => Ok(RelayRequest {
            meta_transfer: MetaTransfer {
                owner,
                token,
                recipient,
                amount,
                fee,
                deadline,
                nonce,
            },
            permit_data: PermitData {
                value,
                deadline: permit_deadline,
                v,
                r,
                s,
            },
            signature,
            recaptcha_token: payload.recaptcha_token.clone(),
        }),
        _ => Err(RelayError::Validation(errors.join("; "))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetaTransferPayload, PermitDataPayload};

    const ADDR: &str = "0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8b6";
    const WORD: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn payload() -> RelayRequestPayload {
        RelayRequestPayload {
            meta_transfer: MetaTransferPayload {
                owner: ADDR.to_string(),
                token: ADDR.to_string(),
                recipient: ADDR.to_string(),
                amount: "1000000".to_string(),
                fee: "10000".to_string(),
                deadline: "1900000000".to_string(),
                nonce: "0".to_string(),
            },
            permit_data: PermitDataPayload {
                value: "1010000".to_string(),
                deadline: "1900000000".to_string(),
                v: 27,
                r: WORD.to_string(),
                s: WORD.to_string(),
            },
            signature: format!("0x{}", "ab".repeat(65)),
            recaptcha_token: "token".to_string(),
        }
    }

    #[test]
    fn test_hex_patterns() {
        assert!(is_address(ADDR));
        assert!(!is_address("742d35Cc6634C0532925a3b8D4C9db96C4b4d8b6"));
        assert!(!is_address("0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8b"));
        assert!(!is_address("0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8bZ"));
        assert!(is_tx_hash(WORD));
        assert!(!is_tx_hash(ADDR));
        assert!(is_decimal("0"));
        assert!(!is_decimal(""));
        assert!(!is_decimal("-1"));
        assert!(!is_decimal("1e6"));
    }

    #[test]
    fn test_valid_payload_parses() {
        let req = parse_relay_request(&payload()).unwrap();
        assert_eq!(req.meta_transfer.amount, U256::from(1_000_000u64));
        assert_eq!(req.meta_transfer.total_needed(), U256::from(1_010_000u64));
        assert_eq!(req.permit_data.v, 27);
        assert_eq!(req.signature.len(), 65);
    }

    #[test]
    fn test_zero_amount_rejected() {
        let mut p = payload();
        p.meta_transfer.amount = "0".to_string();
        assert!(matches!(
            parse_relay_request(&p),
            Err(RelayError::Validation(_))
        ));
    }

    #[test]
    fn test_overflowing_integer_rejected() {
        let mut p = payload();
        p.meta_transfer.nonce = "9".repeat(100);
        let err = parse_relay_request(&p).unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    #[test]
    fn test_bad_v_and_signature_reported_together() {
        let mut p = payload();
        p.permit_data.v = 29;
        p.signature = "0xabc".to_string();
        match parse_relay_request(&p) {
            Err(RelayError::Validation(msg)) => {
                assert!(msg.contains("permit v"));
                assert!(msg.contains("signature"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_empty_recaptcha_token_rejected() {
        let mut p = payload();
        p.recaptcha_token.clear();
        assert!(parse_relay_request(&p).is_err());
    }
}
