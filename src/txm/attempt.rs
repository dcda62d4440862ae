//! Builds signed attempts: fee selection, optional forwarding, signing

use super::forwarder::{route, ForwarderRegistry};
use super::gas::{FeeEstimator, FeePolicy, GasPrice};
use super::models::{Attempt, AttemptState, Transaction};
use crate::error::TxmResult;
use crate::keys::KeyStore;

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest, H256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct AttemptBuilder {
    chain_id: u64,
    keys: Arc<dyn KeyStore>,
    estimator: Arc<dyn FeeEstimator>,
    policy: FeePolicy,
    forwarders: Option<Arc<dyn ForwarderRegistry>>,
}

impl AttemptBuilder {
    pub fn new(
        chain_id: u64,
        keys: Arc<dyn KeyStore>,
        estimator: Arc<dyn FeeEstimator>,
        policy: FeePolicy,
        forwarders: Option<Arc<dyn ForwarderRegistry>>,
    ) -> Self {
        Self {
            chain_id,
            keys,
            estimator,
            policy,
            forwarders,
        }
    }

    /// First attempt for `tx` at `nonce`, priced from a fresh estimate
    pub async fn new_attempt(&self, tx: &Transaction, nonce: u64) -> TxmResult<Attempt> {
        let estimate = self.estimator.estimate().await?;
        let gas_price = self.policy.initial(estimate);
        self.sign(tx, nonce, gas_price).await
    }

    /// Replacement for `prior` with a bumped fee and the same nonce. Fails with
    /// `FeeCeilingReached` when no acceptable bump fits under the ceiling.
    pub async fn bump_attempt(&self, tx: &Transaction, prior: &Attempt) -> TxmResult<Attempt> {
        let market = match self.estimator.estimate().await {
            Ok(estimate) => Some(estimate),
            Err(e) => {
                warn!("Fee estimate unavailable for bump of {}: {}", tx.id, e);
                None
            }
        };

        let gas_price = self.policy.bump(&prior.gas_price, market.as_ref())?;
        debug!(
            "Bumping {} nonce {}: {} -> {} wei",
            tx.id,
            prior.nonce,
            prior.gas_price.cap_value(),
            gas_price.cap_value()
        );
        self.sign(tx, prior.nonce, gas_price).await
    }

    /// Unsigned transaction for an attempt
    pub fn typed_transaction(&self, tx: &Transaction, nonce: u64, gas_price: &GasPrice) -> TypedTransaction {
        let (to, data) = route(self.forwarders.as_deref(), tx.from, tx.to, &tx.data);

        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(tx.from)
                .to(to)
                .value(tx.value)
                .data(data)
                .nonce(nonce)
                .gas(tx.gas_limit)
                .gas_price(*price)
                .chain_id(self.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(tx.from)
                .to(to)
                .value(tx.value)
                .data(data)
                .nonce(nonce)
                .gas(tx.gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(self.chain_id)
                .into(),
        }
    }

    async fn sign(&self, tx: &Transaction, nonce: u64, gas_price: GasPrice) -> TxmResult<Attempt> {
        let typed = self.typed_transaction(tx, nonce, &gas_price);
        let signed_raw = self.keys.sign(tx.from, &typed).await?;
        let hash = H256::from(keccak256(&signed_raw));

        Ok(Attempt {
            id: Uuid::new_v4(),
            tx_id: tx.id,
            nonce,
            gas_price,
            gas_limit: tx.gas_limit,
            hash,
            signed_raw,
            state: AttemptState::InFlight,
            created_at: Utc::now(),
            broadcast_at: None,
        })
    }
}
