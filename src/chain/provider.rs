//! Chain client with multi-RPC support and automatic failover

use super::{
    classify_submit_error, ChainClient, ChainReceipt, RetryReason, SimulationOutcome,
    SubmitOutcome,
};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{TxmError, TxmResult};
use crate::txm::GasPrice;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct EthChainClient {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EthChainClient {
    /// Create a new chain client
    pub fn new(config: ChainConfig) -> TxmResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxmError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn connection_error(&self, message: impl ToString) -> TxmError {
        TxmError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> TxmResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    return Ok(block.as_u64());
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> TxmResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                // Arbitrum prices L1 data into the legacy gas price
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| TxmError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> TxmResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| TxmError::GasEstimation(e.to_string()))?
            .ok_or_else(|| TxmError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| TxmError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = self
            .http()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
            .unwrap_or_else(|_| U256::from(2_000_000_000u64)); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok((max_fee, priority_fee))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

#[async_trait]
impl ChainClient for EthChainClient {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn current_nonce(&self, address: Address) -> TxmResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(address, Some(BlockNumber::Latest.into()))
                .await
            {
                Ok(nonce) => return Ok(nonce.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get nonce for {:?} from chain {}: {}",
                        address, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to return a nonce"))
    }

    async fn submit(&self, raw: Bytes) -> SubmitOutcome {
        let send_timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let result = timeout(send_timeout, self.http().send_raw_transaction(raw)).await;

        match result {
            Ok(Ok(pending_tx)) => {
                debug!("Transaction sent: {:?}", pending_tx.tx_hash());
                SubmitOutcome::Accepted
            }
            Ok(Err(e)) => {
                let outcome = classify_submit_error(&e.to_string());
                if matches!(outcome, SubmitOutcome::Retryable(RetryReason::Unavailable(_))) {
                    self.failover();
                }
                outcome
            }
            Err(_) => {
                warn!("Transaction send timeout on chain {}", self.config.chain_id);
                SubmitOutcome::Retryable(RetryReason::Timeout)
            }
        }
    }

    async fn receipt(&self, tx_hash: H256) -> TxmResult<Option<ChainReceipt>> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))?;

        Ok(receipt.and_then(|r| match (r.block_number, r.block_hash) {
            (Some(block_number), Some(block_hash)) => Some(ChainReceipt {
                tx_hash,
                block_number: block_number.as_u64(),
                block_hash,
                success: r.status == Some(1u64.into()),
            }),
            // Pending receipts carry no block
            _ => None,
        }))
    }

    async fn block_height(&self) -> TxmResult<u64> {
        self.get_block_number().await
    }

    async fn simulate(&self, tx: &TypedTransaction) -> TxmResult<SimulationOutcome> {
        match self.http().call(tx, None).await {
            Ok(_) => Ok(SimulationOutcome::Success),
            Err(e) => {
                let message = e.to_string();
                if message.to_lowercase().contains("revert") {
                    Ok(SimulationOutcome::Reverted(message))
                } else {
                    Err(self.connection_error(message))
                }
            }
        }
    }
}
