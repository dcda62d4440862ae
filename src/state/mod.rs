//! Durable transaction store
//!
//! Handles:
//! - Idempotent enqueue of transaction intents
//! - Atomic nonce assignment together with the first attempt
//! - Attempt replacement, receipts and reorg reverts
//! - Nonce cursors per sending key
//!
//! Every method is a single atomic update; callers never observe a partially
//! applied change.

#[cfg(test)]
pub(crate) mod conformance;
mod memory;
mod postgres;

pub use memory::InMemoryTxStore;
pub use postgres::PgTxStore;

use crate::error::TxmResult;
use crate::txm::models::{
    Attempt, NewTransaction, NonceSyncOutcome, PendingBroadcast, Receipt, StateCounts,
    TrackedTransaction, Transaction, TxState,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use uuid::Uuid;

#[async_trait]
pub trait TxStore: Send + Sync {
    /// Insert an intent. Re-inserting an idempotency key with the same payload
    /// returns the existing row and `false`; a different payload is an
    /// `IdempotencyConflict`.
    async fn create_transaction(&self, new: &NewTransaction) -> TxmResult<(Transaction, bool)>;

    async fn transaction(&self, id: Uuid) -> TxmResult<Option<Transaction>>;

    /// Oldest unstarted transaction for a sender
    async fn next_unstarted(&self, from: Address) -> TxmResult<Option<Transaction>>;

    async fn nonce_cursor(&self, from: Address) -> TxmResult<Option<u64>>;

    /// Set the cursor only if none exists yet; returns the stored value
    async fn seed_nonce_cursor(&self, from: Address, nonce: u64) -> TxmResult<u64>;

    /// Reconcile the cursor with the chain nonce. Advances (never decreases) the
    /// cursor; in-flight transactions with a nonce in `[cursor, chain_nonce)`
    /// become fatal because their slot was consumed elsewhere.
    async fn sync_nonce_cursor(&self, from: Address, chain_nonce: u64)
        -> TxmResult<NonceSyncOutcome>;

    /// Assign `attempt.nonce` to an unstarted transaction, insert the attempt as
    /// current and advance the cursor past it. Fails with `NonceConflict` unless
    /// the cursor equals `attempt.nonce`.
    async fn commit_first_attempt(&self, tx_id: Uuid, attempt: &Attempt) -> TxmResult<()>;

    /// Record that an attempt was handed to the chain
    async fn mark_broadcast(&self, attempt_id: Uuid, at: DateTime<Utc>) -> TxmResult<()>;

    /// In-flight transactions whose current attempt was never broadcast, by nonce
    async fn unbroadcast_in_flight(&self, from: Address) -> TxmResult<Vec<PendingBroadcast>>;

    /// Move a transaction to `fatal_error` and error its attempts. With
    /// `release_nonce`, the nonce is cleared and the cursor rolled back when it
    /// was the most recently assigned one.
    async fn mark_fatal(&self, tx_id: Uuid, reason: &str, release_nonce: bool) -> TxmResult<()>;

    /// In-flight and confirmed transactions of a sender, by nonce
    async fn tracked_transactions(&self, from: Address) -> TxmResult<Vec<TrackedTransaction>>;

    /// Retire `replaced` and make `attempt` the current attempt
    async fn replace_attempt(&self, tx_id: Uuid, replaced: Uuid, attempt: &Attempt) -> TxmResult<()>;

    /// Store the winning receipt, mark its attempt confirmed and every other
    /// live attempt replaced, and move the transaction to `state`
    async fn record_receipt(&self, receipt: &Receipt, state: TxState) -> TxmResult<()>;

    /// Drop the receipt of a reorged transaction and return it to in-flight
    async fn revert_receipt(&self, tx_id: Uuid) -> TxmResult<()>;

    /// Current attempts of in-flight transactions last broadcast before `cutoff`
    async fn stale_attempts(&self, cutoff: DateTime<Utc>, limit: usize) -> TxmResult<Vec<Attempt>>;

    async fn state_counts(&self) -> TxmResult<StateCounts>;

    async fn health_check(&self) -> TxmResult<()>;
}
