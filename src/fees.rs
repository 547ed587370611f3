use std::sync::Arc;

use alloy::primitives::{Address, U256};
use serde::Serialize;

use crate::{
    error::{RelayError, RelayResult},
    oracle::FeeOracle,
    types::u256_decimal,
};

pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;

/// Percentage fee, as numerator over denominator (1%).
const PERCENTAGE_FEE_NUMERATOR: u64 = 1;
const PERCENTAGE_FEE_DENOMINATOR: u64 = 100;

const WEI_PER_ETH: f64 = 1e18;

/// Required fee for one transfer. Token-unit fields are what gets settled;
/// USD fields are for display and may not add up exactly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    pub gas_cost_usd: f64,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub gas_cost_token_units: U256,
    pub percentage_fee_usd: f64,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub percentage_fee_token_units: U256,
    pub total_fee_usd: f64,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub total_fee_token_units: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimation {
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub gas_limit: U256,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub gas_price: U256,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub gas_cost_wei: U256,
    pub gas_cost_eth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeValidation {
    pub is_valid: bool,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub required_fee: U256,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub shortfall: U256,
    pub breakdown: FeeBreakdown,
}

pub struct FeeCalculator {
    oracle: Arc<dyn FeeOracle>,
}

fn to_f64(value: U256) -> f64 {
    f64::from(value)
}

/// Floor of a non-negative finite `value` as an integer.
fn floor_to_u256(value: f64) -> RelayResult<U256> {
    let floored = value.floor();
    if !floored.is_finite() || floored < 0.0 {
        return Err(RelayError::Calculation(format!("Invalid fee amount {}", value)));
    }
    U256::try_from(floored)
        .map_err(|_| RelayError::Calculation(format!("Fee amount {} out of range", value)))
}

fn calculation_failed(what: &'static str) -> impl FnOnce(RelayError) -> RelayError {
    move |e| {
        tracing::error!("{}: {}", what, e);
        RelayError::Calculation(what.to_string())
    }
}

impl FeeCalculator {
    pub fn new(oracle: Arc<dyn FeeOracle>) -> Self {
        Self { oracle }
    }

    /// Gas cost converted to token units at the token's USD price, plus 1% of
    /// `transfer_amount`.
    pub async fn calculate_required_fee(
        &self,
        token: Address,
        transfer_amount: U256,
        token_decimals: u8,
    ) -> RelayResult<FeeBreakdown> {
        let (eth_usd, gas_price, gas_limit, token_usd) = tokio::try_join!(
            self.oracle.eth_usd_price(),
            self.oracle.gas_price(),
            self.oracle.estimate_gas_limit(token, transfer_amount),
            self.oracle.token_usd_price(token),
        )
        .map_err(calculation_failed("Failed to calculate fees"))?;
        if !token_usd.is_finite() || token_usd <= 0.0 {
            return Err(RelayError::Calculation(format!(
                "Invalid token price {}",
                token_usd
            )));
        }

        let gas_cost_wei = gas_limit
            .checked_mul(gas_price)
            .ok_or_else(|| RelayError::Calculation("Gas cost overflow".to_string()))?;
        let gas_cost_usd = to_f64(gas_cost_wei) / WEI_PER_ETH * eth_usd;

        let scale = 10f64.powi(i32::from(token_decimals));
        let gas_cost_token_units = floor_to_u256(gas_cost_usd / token_usd * scale)?;

        let percentage_fee_token_units = transfer_amount
            .checked_mul(U256::from(PERCENTAGE_FEE_NUMERATOR))
            .ok_or_else(|| RelayError::Calculation("Transfer amount overflow".to_string()))?
            / U256::from(PERCENTAGE_FEE_DENOMINATOR);
        let percentage_fee_usd = to_f64(percentage_fee_token_units) / scale * token_usd;

        Ok(FeeBreakdown {
            gas_cost_usd,
            gas_cost_token_units,
            percentage_fee_usd,
            percentage_fee_token_units,
            total_fee_usd: gas_cost_usd + percentage_fee_usd,
            total_fee_token_units: gas_cost_token_units.saturating_add(percentage_fee_token_units),
        })
    }

    pub async fn estimate_gas_cost(&self, transfer_amount: U256) -> RelayResult<GasEstimation> {
        let (gas_price, gas_limit) = tokio::try_join!(
            self.oracle.gas_price(),
            self.oracle.estimate_gas_limit(Address::ZERO, transfer_amount),
        )
        .map_err(calculation_failed("Failed to estimate gas cost"))?;

        let gas_cost_wei = gas_limit
            .checked_mul(gas_price)
            .ok_or_else(|| RelayError::Calculation("Gas cost overflow".to_string()))?;

        Ok(GasEstimation {
            gas_limit,
            gas_price,
            gas_cost_wei,
            gas_cost_eth: to_f64(gas_cost_wei) / WEI_PER_ETH,
        })
    }

    /// Compare `provided_fee` against the fee required for `transfer_amount`.
    pub async fn validate_transfer_fee(
        &self,
        provided_fee: U256,
        transfer_amount: U256,
        token_decimals: u8,
    ) -> RelayResult<FeeValidation> {
        let breakdown = self
            .calculate_required_fee(Address::ZERO, transfer_amount, token_decimals)
            .await?;
        let required_fee = breakdown.total_fee_token_units;

        Ok(FeeValidation {
            is_valid: provided_fee >= required_fee,
            required_fee,
            shortfall: required_fee.saturating_sub(provided_fee),
            breakdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedOracle {
        eth_usd: f64,
        gas_price: U256,
        gas_limit: U256,
        token_usd: f64,
    }

    #[async_trait]
    impl FeeOracle for FixedOracle {
        async fn eth_usd_price(&self) -> RelayResult<f64> {
            Ok(self.eth_usd)
        }

        async fn gas_price(&self) -> RelayResult<U256> {
            Ok(self.gas_price)
        }

        async fn estimate_gas_limit(&self, _token: Address, _amount: U256) -> RelayResult<U256> {
            Ok(self.gas_limit)
        }

        async fn token_usd_price(&self, _token: Address) -> RelayResult<f64> {
            Ok(self.token_usd)
        }
    }

    struct BrokenOracle;

    #[async_trait]
    impl FeeOracle for BrokenOracle {
        async fn eth_usd_price(&self) -> RelayResult<f64> {
            Ok(3000.0)
        }

        async fn gas_price(&self) -> RelayResult<U256> {
            Err(RelayError::Internal("node down".to_string()))
        }

        async fn estimate_gas_limit(&self, _token: Address, _amount: U256) -> RelayResult<U256> {
            Ok(U256::from(135_000u64))
        }

        async fn token_usd_price(&self, _token: Address) -> RelayResult<f64> {
            Ok(1.0)
        }
    }

    fn calculator() -> FeeCalculator {
        // 135,000 gas at 20 gwei = 0.0027 ETH = $5.40 at $2000
        FeeCalculator::new(Arc::new(FixedOracle {
            eth_usd: 2000.0,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: U256::from(135_000u64),
            token_usd: 1.0,
        }))
    }

    #[tokio::test]
    async fn test_required_fee_breakdown() {
        let fee = calculator()
            .calculate_required_fee(Address::ZERO, U256::from(1_000_000u64), 6)
            .await
            .unwrap();

        assert!((fee.gas_cost_usd - 5.4).abs() < 1e-9);
        // floor of 5.4 * 10^6, allowing for float representation
        assert!(
            fee.gas_cost_token_units == U256::from(5_400_000u64)
                || fee.gas_cost_token_units == U256::from(5_399_999u64)
        );
        assert_eq!(fee.percentage_fee_token_units, U256::from(10_000u64));
        assert!((fee.percentage_fee_usd - 0.01).abs() < 1e-12);
        assert_eq!(
            fee.total_fee_token_units,
            fee.gas_cost_token_units + fee.percentage_fee_token_units
        );
    }

    #[tokio::test]
    async fn test_percentage_fee_scales_with_amount() {
        let calc = calculator();
        let pct = |fee: FeeBreakdown| fee.percentage_fee_token_units;

        for a in [50u64, 150, 1_000_000, 123_456_789] {
            let single = pct(calc
                .calculate_required_fee(Address::ZERO, U256::from(a), 6)
                .await
                .unwrap());
            let double = pct(calc
                .calculate_required_fee(Address::ZERO, U256::from(2 * a), 6)
                .await
                .unwrap());
            assert!(double >= single * U256::from(2u8), "amount {}", a);
        }

        // Floor boundaries: 1% of 50 rounds to 0, of 100 is 1, of 150 is 1, of 300 is 3.
        let at = |a: u64| {
            let calc = &calc;
            async move {
                calc.calculate_required_fee(Address::ZERO, U256::from(a), 6)
                    .await
                    .unwrap()
                    .percentage_fee_token_units
            }
        };
        assert_eq!(at(50).await, U256::ZERO);
        assert_eq!(at(100).await, U256::from(1u8));
        assert_eq!(at(150).await, U256::from(1u8));
        assert_eq!(at(300).await, U256::from(3u8));
        assert_eq!(at(2_000_000).await, U256::from(2u8) * at(1_000_000).await);
    }

    #[tokio::test]
    async fn test_oracle_failure_is_calculation_error() {
        let calc = FeeCalculator::new(Arc::new(BrokenOracle));
        let err = calc
            .calculate_required_fee(Address::ZERO, U256::from(1_000_000u64), 6)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Calculation(_)));

        let err = calc.estimate_gas_cost(U256::from(1u8)).await.unwrap_err();
        assert!(matches!(err, RelayError::Calculation(_)));
    }

    #[tokio::test]
    async fn test_gas_cost_estimation() {
        let estimate = calculator()
            .estimate_gas_cost(U256::from(1_000_000u64))
            .await
            .unwrap();
        assert_eq!(estimate.gas_cost_wei, U256::from(2_700_000_000_000_000u64));
        assert!((estimate.gas_cost_eth - 0.0027).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_validate_transfer_fee() {
        let calc = calculator();
        let low = calc
            .validate_transfer_fee(U256::from(10_000u64), U256::from(1_000_000u64), 6)
            .await
            .unwrap();
        assert!(!low.is_valid);
        assert_eq!(low.shortfall, low.required_fee - U256::from(10_000u64));

        let enough = calc
            .validate_transfer_fee(U256::from(6_000_000u64), U256::from(1_000_000u64), 6)
            .await
            .unwrap();
        assert!(enough.is_valid);
        assert_eq!(enough.shortfall, U256::ZERO);
    }

    #[tokio::test]
    async fn test_high_decimal_fee_exceeds_u128() {
        // 135,000 gas at 1000 gwei = 0.135 ETH = $405 at $3000
        let calc = FeeCalculator::new(Arc::new(FixedOracle {
            eth_usd: 3000.0,
            gas_price: U256::from(1_000_000_000_000u64),
            gas_limit: U256::from(135_000u64),
            token_usd: 1.0,
        }));
        let fee = calc
            .calculate_required_fee(Address::ZERO, U256::from(1_000_000u64), 36)
            .await
            .unwrap();

        assert!((fee.gas_cost_usd - 405.0).abs() < 1e-9);
        assert!(fee.gas_cost_token_units > U256::from(u128::MAX));
        let ratio = to_f64(fee.gas_cost_token_units) / 4.05e38;
        assert!((ratio - 1.0).abs() < 1e-9, "ratio {}", ratio);
        assert_eq!(
            fee.total_fee_token_units,
            fee.gas_cost_token_units + fee.percentage_fee_token_units
        );

        // 1% of 10^40 is 10^38 units, i.e. $100 at 36 decimals
        let fee = calc
            .calculate_required_fee(Address::ZERO, U256::from(10u8).pow(U256::from(40u8)), 36)
            .await
            .unwrap();
        assert_eq!(
            fee.percentage_fee_token_units,
            U256::from(10u8).pow(U256::from(38u8))
        );
        assert!((fee.percentage_fee_usd - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_gas_cost_priced_through_token_usd() {
        // $5.40 of gas at $2 per token is 2.7 tokens
        let calc = FeeCalculator::new(Arc::new(FixedOracle {
            eth_usd: 2000.0,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: U256::from(135_000u64),
            token_usd: 2.0,
        }));
        let fee = calc
            .calculate_required_fee(Address::ZERO, U256::from(1_000_000u64), 6)
            .await
            .unwrap();
        assert!(
            fee.gas_cost_token_units == U256::from(2_700_000u64)
                || fee.gas_cost_token_units == U256::from(2_699_999u64)
        );
        assert!((fee.percentage_fee_usd - 0.02).abs() < 1e-12);

        let broken = FeeCalculator::new(Arc::new(FixedOracle {
            eth_usd: 2000.0,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: U256::from(135_000u64),
            token_usd: 0.0,
        }));
        let err = broken
            .calculate_required_fee(Address::ZERO, U256::from(1_000_000u64), 6)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Calculation(_)));
    }

    #[test]
    fn test_breakdown_serializes_token_units_as_strings() {
        let fee = FeeBreakdown {
            gas_cost_usd: 1.5,
            gas_cost_token_units: U256::from(1_500_000u64),
            percentage_fee_usd: 0.01,
            percentage_fee_token_units: U256::from(10_000u64),
            total_fee_usd: 1.51,
            total_fee_token_units: U256::from(1_510_000u64),
        };
        let json = serde_json::to_value(&fee).unwrap();
        assert_eq!(json["gasCostTokenUnits"], "1500000");
        assert_eq!(json["totalFeeTokenUnits"], "1510000");
        assert_eq!(json["gasCostUsd"], 1.5);
    }
}
