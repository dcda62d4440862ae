//! Chain module - the capabilities the transaction manager needs from an EVM node
//!
//! This module provides:
//! - The `ChainClient` contract consumed by the broadcaster, confirmer and resender
//! - Classification of submission errors into accepted / retryable / rejected
//! - An ethers-based client with multi-RPC failover
//! - A head tracker publishing new block heights

pub mod classify;
pub mod finality;
pub mod head;
pub mod provider;

pub use classify::classify_submit_error;
pub use head::HeadTracker;
pub use provider::EthChainClient;

use crate::error::TxmResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};
use std::fmt;

/// Receipt as observed on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
}

/// Outcome of handing a signed attempt to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted into the mempool, or already known
    Accepted,
    /// Outcome unknown or temporarily refused; never terminal
    Retryable(RetryReason),
    /// The chain will never accept this payload
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    NonceTooLow,
    Underpriced,
    Timeout,
    Unavailable(String),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientFunds,
    InvalidTransaction(String),
    Reverted(String),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::NonceTooLow => write!(f, "nonce too low"),
            RetryReason::Underpriced => write!(f, "underpriced"),
            RetryReason::Timeout => write!(f, "timeout"),
            RetryReason::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            RetryReason::Unknown(msg) => write!(f, "unknown: {}", msg),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientFunds => write!(f, "insufficient funds"),
            RejectReason::InvalidTransaction(msg) => write!(f, "invalid transaction: {}", msg),
            RejectReason::Reverted(msg) => write!(f, "reverted: {}", msg),
        }
    }
}

/// Result of a pre-broadcast `eth_call`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationOutcome {
    Success,
    Reverted(String),
}

/// Abstract capabilities of the chain RPC client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Count of mined transactions sent by `address`
    async fn current_nonce(&self, address: Address) -> TxmResult<u64>;

    async fn submit(&self, raw: Bytes) -> SubmitOutcome;

    async fn receipt(&self, tx_hash: H256) -> TxmResult<Option<ChainReceipt>>;

    async fn block_height(&self) -> TxmResult<u64>;

    async fn simulate(&self, tx: &TypedTransaction) -> TxmResult<SimulationOutcome>;
}
