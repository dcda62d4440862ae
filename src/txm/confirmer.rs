//! Tracks in-flight transactions to inclusion and finality
//!
//! Runs on every new head (interval as fallback). Per tracked transaction:
//! - Receipt found: confirmed, or finalized once deep enough
//! - Receipt gone after confirmation: reorg, back to in-flight
//! - No receipt past the stuck threshold: bumped replacement attempt
//! - Nonce consumed with no receipt for `finality_depth` blocks: fatal

use super::attempt::AttemptBuilder;
use super::locks::KeyLocks;
use super::models::{AttemptState, Receipt, TrackedTransaction, TxState};
use crate::chain::{ChainClient, ChainReceipt, SubmitOutcome};
use crate::error::TxmResult;
use crate::events::{EventNotifier, TxStateChange};
use crate::state::TxStore;

use chrono::Utc;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Confirmer {
    store: Arc<dyn TxStore>,
    chain: Arc<dyn ChainClient>,
    builder: Arc<AttemptBuilder>,
    notifier: Arc<dyn EventNotifier>,
    locks: Arc<KeyLocks>,
    keys: Vec<Address>,
    finality_depth: u64,
    stuck_threshold: chrono::Duration,
    poll_interval: Duration,
    /// Head at which an in-flight transaction's nonce was first seen consumed
    /// with no receipt of ours, with the sending key
    consumed_since: Mutex<HashMap<Uuid, (Address, u64)>>,
}

impl Confirmer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TxStore>,
        chain: Arc<dyn ChainClient>,
        builder: Arc<AttemptBuilder>,
        notifier: Arc<dyn EventNotifier>,
        locks: Arc<KeyLocks>,
        keys: Vec<Address>,
        finality_depth: u64,
        stuck_threshold: chrono::Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            chain,
            builder,
            notifier,
            locks,
            keys,
            finality_depth,
            stuck_threshold,
            poll_interval,
            consumed_since: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, mut heads: watch::Receiver<u64>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Confirmer started for {} keys (finality depth {})",
            self.keys.len(),
            self.finality_depth
        );
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = heads.changed() => {
                    if changed.is_err() {
                        // head tracker gone; the interval keeps us going
                        debug!("Head channel closed");
                    }
                }
                _ = shutdown.changed() => break,
            }

            let observed = *heads.borrow_and_update();
            let head = match observed {
                0 => match self.chain.block_height().await {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("Confirmer could not read the chain head: {}", e);
                        continue;
                    }
                },
                h => h,
            };

            self.process(head).await;

            if *shutdown.borrow() {
                break;
            }
        }

        info!("Confirmer stopped");
    }

    /// One pass over every key at chain head `head`
    pub async fn process(&self, head: u64) {
        for from in &self.keys {
            if let Err(e) = self.process_key(*from, head).await {
                error!("Confirmer pass for {:?} failed: {}", from, e);
            }
        }
    }

    pub async fn process_key(&self, from: Address, head: u64) -> TxmResult<()> {
        // serializes check-then-bump with the broadcaster for this key
        let _guard = self.locks.lock(from).await;

        let tracked = self.store.tracked_transactions(from).await?;
        let mut chain_nonce = None;

        for tt in &tracked {
            if let Err(e) = self.check_transaction(tt, head, &mut chain_nonce).await {
                warn!("Could not check {} (nonce {:?}): {}", tt.tx.id, tt.tx.nonce, e);
            }
        }

        // forget transactions of this key that are no longer tracked
        self.consumed_since
            .lock()
            .await
            .retain(|id, (owner, _)| *owner != from || tracked.iter().any(|tt| tt.tx.id == *id));
        Ok(())
    }

    async fn check_transaction(
        &self,
        tt: &TrackedTransaction,
        head: u64,
        chain_nonce: &mut Option<u64>,
    ) -> TxmResult<()> {
        match self.find_receipt(tt).await? {
            Some((attempt_id, receipt)) => self.handle_included(tt, attempt_id, receipt, head).await,
            None if tt.tx.state == TxState::Confirmed => self.handle_reorg(tt).await,
            None => self.handle_pending(tt, head, chain_nonce).await,
        }
    }

    /// Earliest-included receipt among the non-errored attempts, ties broken
    /// by attempt creation order
    async fn find_receipt(&self, tt: &TrackedTransaction) -> TxmResult<Option<(Uuid, ChainReceipt)>> {
        let mut found = Vec::new();
        for attempt in tt.attempts.iter().filter(|a| a.state != AttemptState::Errored) {
            if let Some(receipt) = self.chain.receipt(attempt.hash).await? {
                found.push((attempt.created_at, attempt.id, receipt));
            }
        }

        if found.len() > 1 {
            warn!("{} attempts of {} appear mined", found.len(), tt.tx.id);
        }

        Ok(found
            .into_iter()
            .min_by_key(|(created_at, _, r)| (r.block_number, *created_at))
            .map(|(_, id, r)| (id, r)))
    }

    async fn handle_included(
        &self,
        tt: &TrackedTransaction,
        attempt_id: Uuid,
        receipt: ChainReceipt,
        head: u64,
    ) -> TxmResult<()> {
        self.consumed_since.lock().await.remove(&tt.tx.id);

        let depth = head.saturating_sub(receipt.block_number);
        let target = if depth >= self.finality_depth {
            TxState::Finalized
        } else {
            TxState::Confirmed
        };

        let unchanged = target == tt.tx.state
            && tt.receipt.as_ref().map_or(false, |r| {
                r.attempt_id == attempt_id && r.block_hash == receipt.block_hash
            });
        if unchanged {
            return Ok(());
        }

        if !receipt.success {
            warn!(
                "Transaction {} reverted on chain in block {}",
                tt.tx.id, receipt.block_number
            );
        }

        let record = Receipt {
            tx_id: tt.tx.id,
            attempt_id,
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            block_hash: receipt.block_hash,
            success: receipt.success,
        };
        self.store.record_receipt(&record, target).await?;

        if tt.tx.state == TxState::InFlight {
            let latency = (Utc::now() - tt.tx.created_at).num_milliseconds() as f64 / 1000.0;
            crate::metrics::record_tx_confirmed(tt.tx.from, latency);
        }
        if target == TxState::Finalized {
            crate::metrics::record_tx_finalized(tt.tx.from);
        }

        if target != tt.tx.state {
            info!(
                "Transaction {} {} in block {} (depth {})",
                tt.tx.id, target, receipt.block_number, depth
            );
            self.notify(tt, tt.tx.state, target);
        } else {
            debug!(
                "Receipt of {} moved to block {} ({:?})",
                tt.tx.id, receipt.block_number, receipt.block_hash
            );
        }
        Ok(())
    }

    async fn handle_reorg(&self, tt: &TrackedTransaction) -> TxmResult<()> {
        warn!(
            "Receipt of {} disappeared (was block {:?}); back to in-flight",
            tt.tx.id,
            tt.receipt.as_ref().map(|r| r.block_number)
        );
        self.store.revert_receipt(tt.tx.id).await?;
        crate::metrics::record_tx_reorged(tt.tx.from);
        self.notify(tt, TxState::Confirmed, TxState::InFlight);
        Ok(())
    }

    async fn handle_pending(
        &self,
        tt: &TrackedTransaction,
        head: u64,
        chain_nonce: &mut Option<u64>,
    ) -> TxmResult<()> {
        let Some(current) = tt.current_attempt() else {
            return Ok(());
        };

        let mined_nonce = match *chain_nonce {
            Some(n) => n,
            None => {
                let n = self.chain.current_nonce(tt.tx.from).await?;
                *chain_nonce = Some(n);
                n
            }
        };

        if mined_nonce > current.nonce {
            // our nonce is used but none of our attempts has a receipt yet
            let (_, first_seen) = *self
                .consumed_since
                .lock()
                .await
                .entry(tt.tx.id)
                .or_insert((tt.tx.from, head));

            if head.saturating_sub(first_seen) >= self.finality_depth {
                error!(
                    "Nonce {} of {} consumed by another transaction",
                    current.nonce, tt.tx.id
                );
                self.store
                    .mark_fatal(tt.tx.id, "nonce consumed by another transaction", false)
                    .await?;
                self.consumed_since.lock().await.remove(&tt.tx.id);
                crate::metrics::record_tx_fatal(tt.tx.from, "nonce_lost");
                self.notify(tt, TxState::InFlight, TxState::FatalError);
            }
            return Ok(());
        }
        self.consumed_since.lock().await.remove(&tt.tx.id);

        if current.age(Utc::now()) < self.stuck_threshold {
            return Ok(());
        }

        let replacement = match self.builder.bump_attempt(&tt.tx, current).await {
            Ok(attempt) => attempt,
            Err(e) if e.is_policy_limited() => {
                warn!(
                    "Transaction {} stuck at nonce {}: {}",
                    tt.tx.id, current.nonce, e
                );
                crate::metrics::record_tx_stuck(tt.tx.from);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.store
            .replace_attempt(tt.tx.id, current.id, &replacement)
            .await?;
        crate::metrics::record_tx_bumped(tt.tx.from);

        match self.chain.submit(replacement.signed_raw.clone()).await {
            SubmitOutcome::Accepted => info!(
                "Replaced {} at nonce {} with {:?}",
                tt.tx.id, replacement.nonce, replacement.hash
            ),
            SubmitOutcome::Retryable(reason) => warn!(
                "Replacement of {} inconclusive: {}",
                tt.tx.id, reason
            ),
            SubmitOutcome::Rejected(reason) => warn!(
                "Replacement of {} rejected: {}; earlier attempts still tracked",
                tt.tx.id, reason
            ),
        }
        self.store.mark_broadcast(replacement.id, Utc::now()).await?;
        Ok(())
    }

    fn notify(&self, tt: &TrackedTransaction, old: TxState, new: TxState) {
        self.notifier
            .notify(TxStateChange::new(tt.tx.id, tt.tx.from, old, new));
    }
}
