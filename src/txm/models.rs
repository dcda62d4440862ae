//! Transactions, attempts and receipts as persisted by the store

use super::gas::GasPrice;
use crate::error::{TxmError, TxmResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a transaction intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    InFlight,
    Confirmed,
    Finalized,
    FatalError,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::InFlight => "in_flight",
            TxState::Confirmed => "confirmed",
            TxState::Finalized => "finalized",
            TxState::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = TxmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(TxState::Unstarted),
            "in_flight" => Ok(TxState::InFlight),
            "confirmed" => Ok(TxState::Confirmed),
            "finalized" => Ok(TxState::Finalized),
            "fatal_error" => Ok(TxState::FatalError),
            other => Err(TxmError::Store(format!("unknown transaction state {}", other))),
        }
    }
}

/// Lifecycle of a single broadcast attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    InFlight,
    Confirmed,
    Replaced,
    Errored,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::InFlight => "in_flight",
            AttemptState::Confirmed => "confirmed",
            AttemptState::Replaced => "replaced",
            AttemptState::Errored => "errored",
        }
    }

    /// The attempt the confirmer is tracking
    pub fn is_current(&self) -> bool {
        matches!(self, AttemptState::InFlight | AttemptState::Confirmed)
    }
}

impl FromStr for AttemptState {
    type Err = TxmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(AttemptState::InFlight),
            "confirmed" => Ok(AttemptState::Confirmed),
            "replaced" => Ok(AttemptState::Replaced),
            "errored" => Ok(AttemptState::Errored),
            other => Err(TxmError::Store(format!("unknown attempt state {}", other))),
        }
    }
}

/// A submission request from a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub from: Address,
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
    pub gas_limit: u64,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewTransaction {
    /// Fingerprint used to tell a replay from a conflicting reuse of an idempotency key
    pub fn payload_hash(&self) -> [u8; 32] {
        let mut value = [0u8; 32];
        self.value.to_big_endian(&mut value);

        let mut hasher = Keccak256::new();
        hasher.update(self.from.as_bytes());
        hasher.update(self.to.as_bytes());
        hasher.update(value);
        hasher.update(self.gas_limit.to_be_bytes());
        hasher.update(&self.data);
        hasher.finalize().into()
    }
}

/// A transaction intent owned by the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub idempotency_key: Option<String>,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    #[serde(skip)]
    pub payload_hash: [u8; 32],
    pub nonce: Option<u64>,
    pub state: TxState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn from_new(new: &NewTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key: new.idempotency_key.clone(),
            from: new.from,
            to: new.to,
            value: new.value,
            data: new.data.clone(),
            gas_limit: new.gas_limit,
            payload_hash: new.payload_hash(),
            nonce: None,
            state: TxState::Unstarted,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One signed broadcast of a transaction at a given fee
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub id: Uuid,
    pub tx_id: Uuid,
    pub nonce: u64,
    pub gas_price: GasPrice,
    pub gas_limit: u64,
    pub hash: H256,
    #[serde(skip)]
    pub signed_raw: Bytes,
    pub state: AttemptState,
    pub created_at: DateTime<Utc>,
    pub broadcast_at: Option<DateTime<Utc>>,
}

impl Attempt {
    /// Time since the attempt was first handed to the chain (or built)
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.broadcast_at.unwrap_or(self.created_at)
    }
}

/// On-chain inclusion of an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub tx_id: Uuid,
    pub attempt_id: Uuid,
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
}

/// A transaction the confirmer follows, with its attempts in creation order
#[derive(Debug, Clone)]
pub struct TrackedTransaction {
    pub tx: Transaction,
    pub attempts: Vec<Attempt>,
    pub receipt: Option<Receipt>,
}

impl TrackedTransaction {
    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.iter().rev().find(|a| a.state.is_current())
    }
}

/// A current attempt that was persisted but never handed to the chain
#[derive(Debug, Clone)]
pub struct PendingBroadcast {
    pub tx: Transaction,
    pub attempt: Attempt,
    /// Earlier attempts exist; the nonce may already be live on chain
    pub replacement: bool,
}

/// Result of reconciling a nonce cursor with the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSyncOutcome {
    pub previous: Option<u64>,
    pub current: u64,
    /// In-flight transactions whose nonce slot was consumed elsewhere
    pub lost: Vec<Uuid>,
}

/// Transaction counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub unstarted: u64,
    pub in_flight: u64,
    pub confirmed: u64,
    pub finalized: u64,
    pub fatal_error: u64,
}

impl StateCounts {
    pub fn add(&mut self, state: TxState, n: u64) {
        match state {
            TxState::Unstarted => self.unstarted += n,
            TxState::InFlight => self.in_flight += n,
            TxState::Confirmed => self.confirmed += n,
            TxState::Finalized => self.finalized += n,
            TxState::FatalError => self.fatal_error += n,
        }
    }
}

/// Reject a transition the lifecycle does not allow
pub fn ensure_state(tx: &Transaction, allowed: &[TxState], to: TxState) -> TxmResult<()> {
    if allowed.contains(&tx.state) {
        Ok(())
    } else {
        Err(TxmError::InvalidStateTransition {
            tx_id: tx.id,
            from: tx.state.to_string(),
            to: to.to_string(),
        })
    }
}
