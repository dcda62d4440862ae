//! Fee estimation and the bump policy for replacement attempts

use crate::chain::{ChainClient, EthChainClient};
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::sync::Arc;
use tracing::debug;

/// Fee parameters of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// The value the fee ceiling applies to
    pub fn cap_value(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }
}

/// Source of market fee estimates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn estimate(&self) -> TxmResult<GasPrice>;
}

/// Reads fees from the chain and adds a safety buffer
pub struct ChainFeeEstimator {
    provider: Arc<EthChainClient>,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl ChainFeeEstimator {
    pub fn new(provider: Arc<EthChainClient>, gas_price_buffer_percent: u64) -> Self {
        Self {
            provider,
            gas_price_buffer_percent,
        }
    }
}

#[async_trait]
impl FeeEstimator for ChainFeeEstimator {
    async fn estimate(&self) -> TxmResult<GasPrice> {
        let gas_price = self.provider.get_gas_price().await?;

        let buffered = match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        };

        debug!("Gas price for chain {}: {:?}", self.provider.chain_id(), buffered);
        Ok(buffered)
    }
}

/// Fee limits applied on top of market estimates
#[derive(Debug, Clone)]
pub struct FeePolicy {
    bump_percent: u64,
    bump_min: U256,
    min_price: U256,
    max_price: U256,
}

impl FeePolicy {
    pub fn new(bump_percent: u64, bump_min: U256, min_price: U256, max_price: U256) -> Self {
        Self {
            bump_percent,
            bump_min,
            min_price,
            max_price,
        }
    }

    pub fn from_config(config: &TxmConfig) -> Self {
        Self::new(
            config.bump_percent,
            config.bump_min_wei(),
            config.min_gas_price_wei(),
            config.max_gas_price_wei(),
        )
    }

    /// Fee for a first attempt: the estimate clamped into `[min, max]`
    pub fn initial(&self, estimate: GasPrice) -> GasPrice {
        match estimate {
            GasPrice::Legacy(price) => GasPrice::Legacy(self.clamp(price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee_per_gas = self.clamp(max_fee_per_gas);
                GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: min(max_priority_fee_per_gas, max_fee_per_gas),
                }
            }
        }
    }

    /// Fee for a replacement attempt.
    ///
    /// The result is at least `prior * (100 + bump_percent) / 100` (rounded up) and at
    /// least `prior + bump_min`, raised to the market estimate when that is higher. It
    /// is capped at the ceiling only while the cap still satisfies the minimum
    /// increase; otherwise the bump is refused with `FeeCeilingReached`.
    pub fn bump(&self, prior: &GasPrice, market: Option<&GasPrice>) -> TxmResult<GasPrice> {
        match prior {
            GasPrice::Legacy(price) => {
                let required = self.required(*price);
                let mut bumped = max(required, *price + self.bump_min);
                if let Some(GasPrice::Legacy(market_price)) = market {
                    bumped = max(bumped, *market_price);
                }
                Ok(GasPrice::Legacy(self.cap(bumped, required, *price)?))
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_required = self.required(*max_fee_per_gas);
                let tip_required = self.required(*max_priority_fee_per_gas);
                let mut fee = max(fee_required, *max_fee_per_gas + self.bump_min);
                let mut tip = max(tip_required, *max_priority_fee_per_gas + self.bump_min);
                if let Some(GasPrice::Eip1559 {
                    max_fee_per_gas: market_fee,
                    max_priority_fee_per_gas: market_tip,
                }) = market
                {
                    fee = max(fee, *market_fee);
                    tip = max(tip, *market_tip);
                }

                let fee = self.cap(fee, fee_required, *max_fee_per_gas)?;
                let tip = min(tip, fee);
                if tip < tip_required {
                    return Err(self.ceiling_error(*max_fee_per_gas));
                }

                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: fee,
                    max_priority_fee_per_gas: tip,
                })
            }
        }
    }

    fn clamp(&self, value: U256) -> U256 {
        min(max(value, self.min_price), self.max_price)
    }

    /// Smallest acceptable replacement value, strictly above `prior`
    fn required(&self, prior: U256) -> U256 {
        let scaled = (prior * U256::from(100 + self.bump_percent) + U256::from(99)) / 100;
        max(scaled, prior + 1)
    }

    fn cap(&self, bumped: U256, required: U256, prior: U256) -> TxmResult<U256> {
        if bumped <= self.max_price {
            Ok(bumped)
        } else if self.max_price >= required {
            Ok(self.max_price)
        } else {
            Err(self.ceiling_error(prior))
        }
    }

    fn ceiling_error(&self, prior: U256) -> TxmError {
        TxmError::FeeCeilingReached {
            prior: prior.to_string(),
            ceiling: self.max_price.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_price: u64) -> FeePolicy {
        FeePolicy::new(10, U256::zero(), U256::from(1), U256::from(max_price))
    }

    #[test]
    fn initial_fee_is_clamped() {
        let policy = FeePolicy::new(10, U256::zero(), U256::from(50), U256::from(500));
        assert_eq!(
            policy.initial(GasPrice::Legacy(U256::from(10))),
            GasPrice::Legacy(U256::from(50))
        );
        assert_eq!(
            policy.initial(GasPrice::Legacy(U256::from(900))),
            GasPrice::Legacy(U256::from(500))
        );

        let capped = policy.initial(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(800),
            max_priority_fee_per_gas: U256::from(700),
        });
        assert_eq!(
            capped,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(500),
                max_priority_fee_per_gas: U256::from(500),
            }
        );
    }

    #[test]
    fn legacy_bump_meets_minimum_multiplier() {
        let bumped = policy(10_000)
            .bump(&GasPrice::Legacy(U256::from(1_000)), None)
            .unwrap();
        assert_eq!(bumped, GasPrice::Legacy(U256::from(1_100)));

        // rounds up so the result never falls below prior * 1.1
        let bumped = policy(10_000)
            .bump(&GasPrice::Legacy(U256::from(15)), None)
            .unwrap();
        assert_eq!(bumped, GasPrice::Legacy(U256::from(17)));
    }

    #[test]
    fn bump_follows_higher_market_and_min_increment() {
        let policy = FeePolicy::new(10, U256::from(500), U256::from(1), U256::from(100_000));
        let bumped = policy.bump(&GasPrice::Legacy(U256::from(1_000)), None).unwrap();
        assert_eq!(bumped, GasPrice::Legacy(U256::from(1_500)));

        let market = GasPrice::Legacy(U256::from(4_000));
        let bumped = policy
            .bump(&GasPrice::Legacy(U256::from(1_000)), Some(&market))
            .unwrap();
        assert_eq!(bumped, GasPrice::Legacy(U256::from(4_000)));
    }

    #[test]
    fn bump_is_capped_when_cap_still_satisfies_minimum() {
        let bumped = policy(1_150)
            .bump(&GasPrice::Legacy(U256::from(1_000)), Some(&GasPrice::Legacy(U256::from(2_000))))
            .unwrap();
        assert_eq!(bumped, GasPrice::Legacy(U256::from(1_150)));
    }

    #[test]
    fn bump_refused_at_ceiling() {
        let err = policy(1_000)
            .bump(&GasPrice::Legacy(U256::from(1_000)), None)
            .unwrap_err();
        assert!(err.is_policy_limited());

        let err = policy(1_050)
            .bump(&GasPrice::Legacy(U256::from(1_000)), None)
            .unwrap_err();
        assert!(err.is_policy_limited());
    }

    #[test]
    fn eip1559_bump_raises_fee_and_tip() {
        let prior = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(2_000),
            max_priority_fee_per_gas: U256::from(100),
        };
        let bumped = policy(10_000).bump(&prior, None).unwrap();
        assert_eq!(
            bumped,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(2_200),
                max_priority_fee_per_gas: U256::from(110),
            }
        );
    }
}
