//! Error types for the transaction manager

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the transaction manager
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Idempotency key {key} already used for a different payload (transaction {existing})")]
    IdempotencyConflict { key: String, existing: Uuid },

    #[error("Nonce conflict for {address}: expected cursor {expected}, found {found:?}")]
    NonceConflict {
        address: String,
        expected: u64,
        found: Option<u64>,
    },

    #[error("Nonce cursor for {address} is not initialized")]
    NonceCursorMissing { address: String },

    #[error("Nonce sync failed for {address}: {message}")]
    NonceSync { address: String, message: String },

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Unknown sending key {0}")]
    UnknownKey(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Fee ceiling reached: prior fee {prior} wei, ceiling {ceiling} wei")]
    FeeCeilingReached { prior: String, ceiling: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: Uuid },

    #[error("Invalid state transition for {tx_id} from {from} to {to}")]
    InvalidStateTransition { tx_id: Uuid, from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxmError::Database(_)
                | TxmError::ChainConnection { .. }
                | TxmError::GasEstimation(_)
                | TxmError::NonceSync { .. }
        )
    }

    /// Fee policy refused the operation; conditions may improve on their own
    pub fn is_policy_limited(&self) -> bool {
        matches!(self, TxmError::FeeCeilingReached { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxmError::NonceConflict { .. }
                | TxmError::NonceSync { .. }
                | TxmError::Signing(_)
                | TxmError::FeeCeilingReached { .. }
        )
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;
