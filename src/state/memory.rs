//! In-process store for development and tests
//!
//! All tables sit behind one mutex, so every trait method is atomic. Nothing
//! survives a restart.

use super::TxStore;
use crate::error::{TxmError, TxmResult};
use crate::txm::models::{
    ensure_state, Attempt, AttemptState, NewTransaction, NonceSyncOutcome, PendingBroadcast,
    Receipt, StateCounts, TrackedTransaction, Transaction, TxState,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    transactions: HashMap<Uuid, Transaction>,
    /// Insertion order of transactions
    order: Vec<Uuid>,
    by_idempotency_key: HashMap<String, Uuid>,
    /// Attempts in creation order
    attempts: Vec<Attempt>,
    /// Receipts keyed by attempt
    receipts: HashMap<Uuid, Receipt>,
    cursors: HashMap<Address, u64>,
}

impl Tables {
    fn tx_mut(&mut self, id: Uuid) -> TxmResult<&mut Transaction> {
        self.transactions
            .get_mut(&id)
            .ok_or(TxmError::TransactionNotFound { tx_id: id })
    }

    fn attempts_of(&self, tx_id: Uuid) -> impl Iterator<Item = &Attempt> {
        self.attempts.iter().filter(move |a| a.tx_id == tx_id)
    }

    fn current_attempt(&self, tx_id: Uuid) -> Option<&Attempt> {
        self.attempts_of(tx_id).filter(|a| a.state.is_current()).last()
    }

    fn receipt_of(&self, tx_id: Uuid) -> Option<&Receipt> {
        self.receipts.values().find(|r| r.tx_id == tx_id)
    }

    fn txs_of(&self, from: Address) -> impl Iterator<Item = &Transaction> {
        self.order
            .iter()
            .filter_map(|id| self.transactions.get(id))
            .filter(move |tx| tx.from == from)
    }

    fn set_attempt_states(&mut self, tx_id: Uuid, f: impl Fn(&Attempt) -> Option<AttemptState>) {
        for attempt in self.attempts.iter_mut().filter(|a| a.tx_id == tx_id) {
            if let Some(state) = f(attempt) {
                attempt.state = state;
            }
        }
    }
}

/// Store backed by process memory
#[derive(Default)]
pub struct InMemoryTxStore {
    tables: Mutex<Tables>,
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TxStore for InMemoryTxStore {
    async fn create_transaction(&self, new: &NewTransaction) -> TxmResult<(Transaction, bool)> {
        let mut t = self.tables.lock().await;

        if let Some(key) = &new.idempotency_key {
            if let Some(id) = t.by_idempotency_key.get(key) {
                let existing = t.transactions[id].clone();
                if existing.payload_hash == new.payload_hash() {
                    return Ok((existing, false));
                }
                return Err(TxmError::IdempotencyConflict {
                    key: key.clone(),
                    existing: existing.id,
                });
            }
        }

        let tx = Transaction::from_new(new, Utc::now());
        if let Some(key) = &tx.idempotency_key {
            t.by_idempotency_key.insert(key.clone(), tx.id);
        }
        t.order.push(tx.id);
        t.transactions.insert(tx.id, tx.clone());
        Ok((tx, true))
    }

    async fn transaction(&self, id: Uuid) -> TxmResult<Option<Transaction>> {
        Ok(self.tables.lock().await.transactions.get(&id).cloned())
    }

    async fn next_unstarted(&self, from: Address) -> TxmResult<Option<Transaction>> {
        let t = self.tables.lock().await;
        let next = t.txs_of(from).find(|tx| tx.state == TxState::Unstarted).cloned();
        Ok(next)
    }

    async fn nonce_cursor(&self, from: Address) -> TxmResult<Option<u64>> {
        Ok(self.tables.lock().await.cursors.get(&from).copied())
    }

    async fn seed_nonce_cursor(&self, from: Address, nonce: u64) -> TxmResult<u64> {
        let mut t = self.tables.lock().await;
        Ok(*t.cursors.entry(from).or_insert(nonce))
    }

    async fn sync_nonce_cursor(
        &self,
        from: Address,
        chain_nonce: u64,
    ) -> TxmResult<NonceSyncOutcome> {
        let mut t = self.tables.lock().await;
        let previous = t.cursors.get(&from).copied();

        let cursor = match previous {
            None => {
                t.cursors.insert(from, chain_nonce);
                return Ok(NonceSyncOutcome {
                    previous,
                    current: chain_nonce,
                    lost: Vec::new(),
                });
            }
            Some(cursor) if chain_nonce > cursor => cursor,
            Some(cursor) => {
                return Ok(NonceSyncOutcome {
                    previous,
                    current: cursor,
                    lost: Vec::new(),
                });
            }
        };

        let lost: Vec<Uuid> = t
            .txs_of(from)
            .filter(|tx| tx.state == TxState::InFlight)
            .filter(|tx| matches!(tx.nonce, Some(n) if n >= cursor && n < chain_nonce))
            .map(|tx| tx.id)
            .collect();

        let now = Utc::now();
        for id in &lost {
            let tx = t.tx_mut(*id)?;
            tx.state = TxState::FatalError;
            tx.error = Some(format!(
                "nonce {} consumed outside this node",
                tx.nonce.unwrap_or_default()
            ));
            tx.updated_at = now;
            t.set_attempt_states(*id, |a| a.state.is_current().then_some(AttemptState::Errored));
        }

        t.cursors.insert(from, chain_nonce);
        Ok(NonceSyncOutcome {
            previous,
            current: chain_nonce,
            lost,
        })
    }

    async fn commit_first_attempt(&self, tx_id: Uuid, attempt: &Attempt) -> TxmResult<()> {
        let mut t = self.tables.lock().await;

        let from = {
            let tx = t.tx_mut(tx_id)?;
            ensure_state(tx, &[TxState::Unstarted], TxState::InFlight)?;
            tx.from
        };

        let cursor = t.cursors.get(&from).copied();
        if cursor != Some(attempt.nonce) {
            return Err(TxmError::NonceConflict {
                address: format!("{:?}", from),
                expected: attempt.nonce,
                found: cursor,
            });
        }

        let tx = t.tx_mut(tx_id)?;
        tx.nonce = Some(attempt.nonce);
        tx.state = TxState::InFlight;
        tx.updated_at = Utc::now();

        let mut attempt = attempt.clone();
        attempt.tx_id = tx_id;
        attempt.state = AttemptState::InFlight;
        t.attempts.push(attempt);
        t.cursors.insert(from, cursor.unwrap_or_default() + 1);
        Ok(())
    }

    async fn mark_broadcast(&self, attempt_id: Uuid, at: DateTime<Utc>) -> TxmResult<()> {
        let mut t = self.tables.lock().await;
        let attempt = t
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or_else(|| TxmError::Store(format!("attempt {} not found", attempt_id)))?;
        attempt.broadcast_at.get_or_insert(at);
        Ok(())
    }

    async fn unbroadcast_in_flight(
        &self,
        from: Address,
    ) -> TxmResult<Vec<PendingBroadcast>> {
        let t = self.tables.lock().await;
        let mut pending: Vec<PendingBroadcast> = t
            .txs_of(from)
            .filter(|tx| tx.state == TxState::InFlight)
            .filter_map(|tx| {
                t.current_attempt(tx.id)
                    .filter(|a| a.broadcast_at.is_none())
                    .map(|a| PendingBroadcast {
                        tx: tx.clone(),
                        attempt: a.clone(),
                        replacement: t.attempts_of(tx.id).count() > 1,
                    })
            })
            .collect();
        pending.sort_by_key(|p| p.tx.nonce);
        Ok(pending)
    }

    async fn mark_fatal(&self, tx_id: Uuid, reason: &str, release_nonce: bool) -> TxmResult<()> {
        let mut t = self.tables.lock().await;

        let (from, nonce, was_in_flight) = {
            let tx = t.tx_mut(tx_id)?;
            ensure_state(tx, &[TxState::Unstarted, TxState::InFlight], TxState::FatalError)?;
            (tx.from, tx.nonce, tx.state == TxState::InFlight)
        };

        let mut clear_nonce = false;
        if release_nonce && was_in_flight {
            if let Some(n) = nonce {
                if t.cursors.get(&from) == Some(&(n + 1)) {
                    t.cursors.insert(from, n);
                    clear_nonce = true;
                } else {
                    warn!("Nonce {} of {} is not the latest; keeping it assigned", n, tx_id);
                }
            }
        }

        let tx = t.tx_mut(tx_id)?;
        tx.state = TxState::FatalError;
        tx.error = Some(reason.to_string());
        tx.updated_at = Utc::now();
        if clear_nonce {
            tx.nonce = None;
        }

        t.set_attempt_states(tx_id, |a| {
            (a.state != AttemptState::Replaced).then_some(AttemptState::Errored)
        });
        Ok(())
    }

    async fn tracked_transactions(&self, from: Address) -> TxmResult<Vec<TrackedTransaction>> {
        let t = self.tables.lock().await;
        let mut tracked: Vec<TrackedTransaction> = t
            .txs_of(from)
            .filter(|tx| matches!(tx.state, TxState::InFlight | TxState::Confirmed))
            .map(|tx| TrackedTransaction {
                tx: tx.clone(),
                attempts: t.attempts_of(tx.id).cloned().collect(),
                receipt: t.receipt_of(tx.id).cloned(),
            })
            .collect();
        tracked.sort_by_key(|tt| tt.tx.nonce);
        Ok(tracked)
    }

    async fn replace_attempt(
        &self,
        tx_id: Uuid,
        replaced: Uuid,
        attempt: &Attempt,
    ) -> TxmResult<()> {
        let mut t = self.tables.lock().await;

        let nonce = {
            let tx = t.tx_mut(tx_id)?;
            ensure_state(tx, &[TxState::InFlight], TxState::InFlight)?;
            tx.nonce
        };
        if nonce != Some(attempt.nonce) {
            return Err(TxmError::Store(format!(
                "replacement attempt nonce {} does not match transaction nonce {:?}",
                attempt.nonce, nonce
            )));
        }
        if t.current_attempt(tx_id).map(|a| a.id) != Some(replaced) {
            return Err(TxmError::Store(format!(
                "attempt {} is not the current attempt of {}",
                replaced, tx_id
            )));
        }

        t.set_attempt_states(tx_id, |a| (a.id == replaced).then_some(AttemptState::Replaced));
        let mut attempt = attempt.clone();
        attempt.tx_id = tx_id;
        attempt.state = AttemptState::InFlight;
        t.attempts.push(attempt);
        Ok(())
    }

    async fn record_receipt(&self, receipt: &Receipt, state: TxState) -> TxmResult<()> {
        let mut t = self.tables.lock().await;

        if !matches!(state, TxState::Confirmed | TxState::Finalized) {
            return Err(TxmError::Store(format!("cannot record a receipt as {}", state)));
        }
        {
            let tx = t.tx_mut(receipt.tx_id)?;
            ensure_state(tx, &[TxState::InFlight, TxState::Confirmed], state)?;
            tx.state = state;
            tx.updated_at = Utc::now();
        }

        t.receipts.retain(|_, r| r.tx_id != receipt.tx_id);
        t.receipts.insert(receipt.attempt_id, receipt.clone());

        let winner = receipt.attempt_id;
        t.set_attempt_states(receipt.tx_id, |a| {
            if a.id == winner {
                Some(AttemptState::Confirmed)
            } else if a.state.is_current() {
                Some(AttemptState::Replaced)
            } else {
                None
            }
        });
        Ok(())
    }

    async fn revert_receipt(&self, tx_id: Uuid) -> TxmResult<()> {
        let mut t = self.tables.lock().await;
        {
            let tx = t.tx_mut(tx_id)?;
            ensure_state(tx, &[TxState::Confirmed], TxState::InFlight)?;
            tx.state = TxState::InFlight;
            tx.updated_at = Utc::now();
        }
        t.receipts.retain(|_, r| r.tx_id != tx_id);
        t.set_attempt_states(tx_id, |a| {
            (a.state == AttemptState::Confirmed).then_some(AttemptState::InFlight)
        });
        Ok(())
    }

    async fn stale_attempts(&self, cutoff: DateTime<Utc>, limit: usize) -> TxmResult<Vec<Attempt>> {
        let t = self.tables.lock().await;
        let mut stale: Vec<Attempt> = t
            .order
            .iter()
            .filter_map(|id| t.transactions.get(id))
            .filter(|tx| tx.state == TxState::InFlight)
            .filter_map(|tx| t.current_attempt(tx.id))
            .filter(|a| a.broadcast_at.unwrap_or(a.created_at) < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|a| a.broadcast_at.unwrap_or(a.created_at));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn state_counts(&self) -> TxmResult<StateCounts> {
        let t = self.tables.lock().await;
        let mut counts = StateCounts::default();
        for tx in t.transactions.values() {
            counts.add(tx.state, 1);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> TxmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
impl InMemoryTxStore {
    /// All attempts of a transaction in creation order
    pub async fn attempts_for(&self, tx_id: Uuid) -> Vec<Attempt> {
        self.tables.lock().await.attempts_of(tx_id).cloned().collect()
    }

    pub async fn receipt_for(&self, tx_id: Uuid) -> Option<Receipt> {
        self.tables.lock().await.receipt_of(tx_id).cloned()
    }

    /// Overwrite a cursor, bypassing the monotonic update rules
    pub async fn force_nonce_cursor(&self, from: Address, nonce: u64) {
        self.tables.lock().await.cursors.insert(from, nonce);
    }

    /// Shift the timestamps of a transaction's attempts into the past
    pub async fn backdate_attempts(&self, tx_id: Uuid, by: chrono::Duration) {
        let mut t = self.tables.lock().await;
        for attempt in t.attempts.iter_mut().filter(|a| a.tx_id == tx_id) {
            attempt.created_at = attempt.created_at - by;
            attempt.broadcast_at = attempt.broadcast_at.map(|at| at - by);
        }
    }
}

#[cfg(test)]
#[async_trait]
impl super::conformance::CursorOverride for InMemoryTxStore {
    async fn overwrite_cursor(&self, from: Address, nonce: u64) {
        self.force_nonce_cursor(from, nonce).await;
    }
}
