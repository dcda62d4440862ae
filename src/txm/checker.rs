//! Validation that runs before a transaction may consume a nonce

use super::forwarder::{route, ForwarderRegistry};
use super::models::Transaction;
use crate::chain::{ChainClient, SimulationOutcome};
use crate::error::TxmResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::TransactionRequest;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckVerdict {
    Accept,
    Reject(String),
}

/// Pre-broadcast check. An error means the check could not run and is retried
/// later; only `Reject` is terminal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransmitChecker: Send + Sync {
    async fn check(&self, tx: &Transaction) -> TxmResult<CheckVerdict>;
}

/// Accepts everything
pub struct NoChecker;

#[async_trait]
impl TransmitChecker for NoChecker {
    async fn check(&self, _tx: &Transaction) -> TxmResult<CheckVerdict> {
        Ok(CheckVerdict::Accept)
    }
}

/// Rejects transactions whose call reverts in an `eth_call`
pub struct SimulateChecker {
    chain: Arc<dyn ChainClient>,
    forwarders: Option<Arc<dyn ForwarderRegistry>>,
}

impl SimulateChecker {
    pub fn new(chain: Arc<dyn ChainClient>, forwarders: Option<Arc<dyn ForwarderRegistry>>) -> Self {
        Self { chain, forwarders }
    }
}

#[async_trait]
impl TransmitChecker for SimulateChecker {
    async fn check(&self, tx: &Transaction) -> TxmResult<CheckVerdict> {
        let (to, data) = route(self.forwarders.as_deref(), tx.from, tx.to, &tx.data);
        let call: TypedTransaction = TransactionRequest::new()
            .from(tx.from)
            .to(to)
            .value(tx.value)
            .data(data)
            .gas(tx.gas_limit)
            .into();

        match self.chain.simulate(&call).await? {
            SimulationOutcome::Success => Ok(CheckVerdict::Accept),
            SimulationOutcome::Reverted(reason) => {
                debug!("Simulation of {} reverted: {}", tx.id, reason);
                Ok(CheckVerdict::Reject(format!("simulation reverted: {}", reason)))
            }
        }
    }
}
