//! Per-key broadcaster: the only component that assigns nonces
//!
//! For each unstarted transaction, in enqueue order:
//! 1. Pre-broadcast check (a rejection never consumes a nonce)
//! 2. Atomic nonce assignment together with the first attempt
//! 3. Submission, with the outcome classified as accepted, retryable or rejected

use super::attempt::AttemptBuilder;
use super::checker::{CheckVerdict, TransmitChecker};
use super::locks::KeyLocks;
use super::models::{Attempt, Transaction, TxState};
use super::nonce::NonceSyncer;
use crate::chain::{ChainClient, RetryReason, SubmitOutcome};
use crate::error::{TxmError, TxmResult};
use crate::events::{EventNotifier, TxStateChange};
use crate::state::TxStore;

use chrono::Utc;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// What handling one transaction led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Nothing left to do
    Idle,
    Progressed,
    /// The chain reported "nonce too low"; reconcile before continuing
    NeedsSync,
}

pub struct Broadcaster {
    from: Address,
    store: Arc<dyn TxStore>,
    chain: Arc<dyn ChainClient>,
    builder: Arc<AttemptBuilder>,
    checker: Arc<dyn TransmitChecker>,
    notifier: Arc<dyn EventNotifier>,
    locks: Arc<KeyLocks>,
    syncer: Option<Arc<NonceSyncer>>,
    wake: Arc<Notify>,
    poll_interval: Duration,
}

impl Broadcaster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from: Address,
        store: Arc<dyn TxStore>,
        chain: Arc<dyn ChainClient>,
        builder: Arc<AttemptBuilder>,
        checker: Arc<dyn TransmitChecker>,
        notifier: Arc<dyn EventNotifier>,
        locks: Arc<KeyLocks>,
        syncer: Option<Arc<NonceSyncer>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            from,
            store,
            chain,
            builder,
            checker,
            notifier,
            locks,
            syncer,
            wake: Arc::new(Notify::new()),
            poll_interval,
        }
    }

    /// Signal a new intent for this key
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Main loop. Interrupted attempts are resumed first; new nonces are only
    /// assigned once that has succeeded.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Broadcaster started for {:?}", self.from);
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut resumed = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }

            if !resumed {
                match self.resume_unbroadcast().await {
                    Ok(_) => resumed = true,
                    Err(e) => {
                        error!("Failed to resume broadcasts for {:?}: {}", self.from, e);
                        continue;
                    }
                }
            }

            self.process_unstarted(&shutdown).await;

            if *shutdown.borrow() {
                break;
            }
        }

        info!("Broadcaster stopped for {:?}", self.from);
    }

    /// Submit current attempts that were persisted but never handed to the
    /// chain, in nonce order. Returns how many were submitted.
    ///
    /// Only first attempts get first-attempt outcome handling. A replacement
    /// shares its nonce with earlier attempts that may already be live, so it
    /// is submitted and recorded but never ends the transaction.
    pub async fn resume_unbroadcast(&self) -> TxmResult<usize> {
        let mut needs_sync = false;
        let count = {
            let _guard = self.locks.lock(self.from).await;
            let pending = self.store.unbroadcast_in_flight(self.from).await?;

            for p in &pending {
                info!(
                    "Resuming broadcast of {} at nonce {} for {:?}{}",
                    p.tx.id,
                    p.attempt.nonce,
                    self.from,
                    if p.replacement { " (replacement)" } else { "" }
                );
                if p.replacement {
                    self.submit_replacement(&p.tx, &p.attempt).await?;
                } else if self.submit_first(&p.tx, &p.attempt).await? == Step::NeedsSync {
                    needs_sync = true;
                }
            }
            pending.len()
        };

        if needs_sync {
            self.sync_nonce().await;
        }
        Ok(count)
    }

    /// Drain unstarted transactions until none remain, an error occurs or
    /// shutdown is requested
    pub async fn process_unstarted(&self, shutdown: &watch::Receiver<bool>) {
        loop {
            match self.process_next().await {
                Ok(Step::Idle) => break,
                Ok(Step::Progressed) => {}
                Ok(Step::NeedsSync) => self.sync_nonce().await,
                Err(e) if e.should_alert() => {
                    error!("Broadcasts for {:?} halted, needs attention: {}", self.from, e);
                    break;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Broadcast for {:?} deferred: {}", self.from, e);
                    break;
                }
                Err(e) => {
                    error!("Broadcast for {:?} failed: {}", self.from, e);
                    break;
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }
    }

    async fn process_next(&self) -> TxmResult<Step> {
        let _guard = self.locks.lock(self.from).await;

        let Some(tx) = self.store.next_unstarted(self.from).await? else {
            return Ok(Step::Idle);
        };

        if let CheckVerdict::Reject(reason) = self.checker.check(&tx).await? {
            warn!("Transaction {} rejected before broadcast: {}", tx.id, reason);
            self.store.mark_fatal(tx.id, &reason, false).await?;
            crate::metrics::record_tx_fatal(self.from, "checker");
            self.notify(&tx, TxState::Unstarted, TxState::FatalError);
            return Ok(Step::Progressed);
        }

        let nonce = self
            .store
            .nonce_cursor(self.from)
            .await?
            .ok_or_else(|| TxmError::NonceCursorMissing {
                address: format!("{:?}", self.from),
            })?;

        let attempt = self.builder.new_attempt(&tx, nonce).await?;
        self.store.commit_first_attempt(tx.id, &attempt).await?;
        self.notify(&tx, TxState::Unstarted, TxState::InFlight);
        debug!("Assigned nonce {} to {}", nonce, tx.id);

        self.submit_first(&tx, &attempt).await
    }

    /// Submit a first attempt while holding the key's exclusive section
    async fn submit_first(&self, tx: &Transaction, attempt: &Attempt) -> TxmResult<Step> {
        let outcome = self.chain.submit(attempt.signed_raw.clone()).await;

        match outcome {
            SubmitOutcome::Accepted => {
                self.store.mark_broadcast(attempt.id, Utc::now()).await?;
                crate::metrics::record_tx_broadcast(self.from);
                info!(
                    "Broadcast {} nonce {} as {:?}",
                    tx.id, attempt.nonce, attempt.hash
                );
                Ok(Step::Progressed)
            }
            SubmitOutcome::Retryable(RetryReason::NonceTooLow) => {
                self.store.mark_broadcast(attempt.id, Utc::now()).await?;
                warn!(
                    "Nonce {} of {} reported too low; syncing {:?}",
                    attempt.nonce, tx.id, self.from
                );
                Ok(Step::NeedsSync)
            }
            SubmitOutcome::Retryable(reason) => {
                self.store.mark_broadcast(attempt.id, Utc::now()).await?;
                warn!(
                    "Submission of {} nonce {} inconclusive ({}); left in flight",
                    tx.id, attempt.nonce, reason
                );
                Ok(Step::Progressed)
            }
            SubmitOutcome::Rejected(reason) => {
                error!("Transaction {} rejected by the chain: {}", tx.id, reason);
                self.store
                    .mark_fatal(tx.id, &reason.to_string(), true)
                    .await?;
                crate::metrics::record_tx_fatal(self.from, "rejected");
                self.notify(tx, TxState::InFlight, TxState::FatalError);
                Ok(Step::Progressed)
            }
        }
    }

    /// Submit a replacement attempt; every outcome leaves the transaction in
    /// flight with its earlier attempts still tracked
    async fn submit_replacement(&self, tx: &Transaction, attempt: &Attempt) -> TxmResult<()> {
        match self.chain.submit(attempt.signed_raw.clone()).await {
            SubmitOutcome::Accepted => debug!(
                "Resumed replacement {:?} of {} at nonce {}",
                attempt.hash, tx.id, attempt.nonce
            ),
            SubmitOutcome::Retryable(reason) => warn!(
                "Resumed replacement of {} inconclusive: {}",
                tx.id, reason
            ),
            SubmitOutcome::Rejected(reason) => warn!(
                "Resumed replacement of {} rejected: {}; earlier attempts still tracked",
                tx.id, reason
            ),
        }
        self.store.mark_broadcast(attempt.id, Utc::now()).await
    }

    async fn sync_nonce(&self) {
        let Some(syncer) = &self.syncer else {
            warn!("Nonce auto-sync disabled; not reconciling {:?}", self.from);
            return;
        };
        if let Err(e) = syncer.sync(self.from).await {
            error!("On-demand nonce sync for {:?} failed: {}", self.from, e);
        }
    }

    fn notify(&self, tx: &Transaction, old: TxState, new: TxState) {
        self.notifier
            .notify(TxStateChange::new(tx.id, self.from, old, new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::RejectReason;
    use crate::txm::testing::Harness;
    use async_trait::async_trait;

    /// Refuses any payload equal to `b"doomed"`
    struct PayloadChecker;

    #[async_trait]
    impl TransmitChecker for PayloadChecker {
        async fn check(&self, tx: &Transaction) -> TxmResult<CheckVerdict> {
            if &tx.data[..] == b"doomed" {
                Ok(CheckVerdict::Reject("simulation reverted".to_string()))
            } else {
                Ok(CheckVerdict::Accept)
            }
        }
    }

    #[tokio::test]
    async fn test_nonces_follow_enqueue_order_without_gaps() {
        let mut h = Harness::new();
        h.chain.set_nonce(h.from, 5);

        let a = h.enqueue("a").await;
        let b = h.enqueue("b").await;
        let c = h.enqueue("c").await;
        h.broadcast().await;

        let nonces: Vec<_> = [
            h.tx(a.id).await,
            h.tx(b.id).await,
            h.tx(c.id).await,
        ]
        .iter()
        .map(|tx| {
            assert_eq!(tx.state, TxState::InFlight);
            tx.nonce
        })
        .collect();
        assert_eq!(nonces, vec![Some(5), Some(6), Some(7)]);
        assert_eq!(h.store.nonce_cursor(h.from).await.unwrap(), Some(8));

        let attempts = h.attempts(a.id).await;
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].broadcast_at.is_some());
        assert_eq!(h.chain.submissions().len(), 3);

        let changes = h.drain_events();
        assert_eq!(changes.len(), 3);
        assert!(changes
            .iter()
            .all(|c| c.old == TxState::Unstarted && c.new == TxState::InFlight));
    }

    #[tokio::test]
    async fn test_checker_rejection_consumes_no_nonce() {
        let h = Harness::with_checker(Arc::new(PayloadChecker));

        let doomed = h.enqueue("doomed").await;
        let ok = h.enqueue("ok").await;
        h.broadcast().await;

        let doomed = h.tx(doomed.id).await;
        assert_eq!(doomed.state, TxState::FatalError);
        assert_eq!(doomed.nonce, None);
        assert_eq!(doomed.error.as_deref(), Some("simulation reverted"));
        assert!(h.attempts(doomed.id).await.is_empty());

        assert_eq!(h.tx(ok.id).await.nonce, Some(0));
        assert_eq!(h.store.nonce_cursor(h.from).await.unwrap(), Some(1));
        assert_eq!(h.chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_definite_rejection_releases_nonce() {
        let h = Harness::new();
        h.chain
            .script_submit(SubmitOutcome::Rejected(RejectReason::InsufficientFunds));

        let a = h.enqueue("a").await;
        let b = h.enqueue("b").await;
        h.broadcast().await;

        let a = h.tx(a.id).await;
        assert_eq!(a.state, TxState::FatalError);
        assert_eq!(a.nonce, None);

        let b = h.tx(b.id).await;
        assert_eq!(b.state, TxState::InFlight);
        assert_eq!(b.nonce, Some(0));
        assert_eq!(h.store.nonce_cursor(h.from).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_ambiguous_failure_stays_in_flight() {
        let h = Harness::new();
        h.chain
            .script_submit(SubmitOutcome::Retryable(RetryReason::Timeout));

        let a = h.enqueue("a").await;
        h.broadcast().await;

        let a = h.tx(a.id).await;
        assert_eq!(a.state, TxState::InFlight);
        assert_eq!(a.nonce, Some(0));
        assert!(h.attempts(a.id).await[0].broadcast_at.is_some());
        assert_eq!(h.chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_broadcast_is_submitted_once_on_restart() {
        let h = Harness::new();
        h.syncer.sync(h.from).await.unwrap();

        // nonce and attempt persisted, then the process died before submitting
        let a = h.enqueue("a").await;
        let attempt = h.builder.new_attempt(&a, 0).await.unwrap();
        h.store.commit_first_attempt(a.id, &attempt).await.unwrap();
        let b = h.enqueue("b").await;

        assert_eq!(h.broadcaster.resume_unbroadcast().await.unwrap(), 1);
        assert_eq!(h.broadcaster.resume_unbroadcast().await.unwrap(), 0);
        let (_tx, rx) = watch::channel(false);
        h.broadcaster.process_unstarted(&rx).await;

        let hashes = h.chain.submitted_hashes();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], attempt.hash);
        assert_eq!(h.tx(a.id).await.nonce, Some(0));
        assert_eq!(h.tx(b.id).await.nonce, Some(1));
        assert_eq!(h.attempts(a.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_nonce_too_low_resyncs_before_next_assignment() {
        let h = Harness::new();
        h.syncer.sync(h.from).await.unwrap();
        // the key was used elsewhere after startup
        h.chain.set_nonce(h.from, 3);
        h.chain
            .script_submit(SubmitOutcome::Retryable(RetryReason::NonceTooLow));

        let a = h.enqueue("a").await;
        let b = h.enqueue("b").await;
        let (_tx, rx) = watch::channel(false);
        h.broadcaster.process_unstarted(&rx).await;

        let a = h.tx(a.id).await;
        assert_eq!(a.state, TxState::InFlight);
        assert_eq!(a.nonce, Some(0));
        assert_eq!(h.tx(b.id).await.nonce, Some(3));
        assert_eq!(h.store.nonce_cursor(h.from).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_interrupted_replacement_never_releases_nonce() {
        let h = Harness::new();
        let a = h.enqueue("a").await;
        h.broadcast().await;
        let a = h.tx(a.id).await;
        let first = h.attempts(a.id).await.remove(0);

        // bumped attempt persisted, then the process died before submitting
        let replacement = h.builder.bump_attempt(&a, &first).await.unwrap();
        h.store
            .replace_attempt(a.id, first.id, &replacement)
            .await
            .unwrap();
        h.chain
            .script_submit(SubmitOutcome::Rejected(RejectReason::InsufficientFunds));

        assert_eq!(h.broadcaster.resume_unbroadcast().await.unwrap(), 1);

        let a = h.tx(a.id).await;
        assert_eq!(a.state, TxState::InFlight);
        assert_eq!(a.nonce, Some(0));
        assert_eq!(h.store.nonce_cursor(h.from).await.unwrap(), Some(1));
        let attempts = h.attempts(a.id).await;
        assert_eq!(attempts.len(), 2);
        assert!(attempts
            .iter()
            .find(|at| at.id == replacement.id)
            .unwrap()
            .broadcast_at
            .is_some());

        // the earlier attempt lands and the slot is never handed out again
        h.chain.mine(first.hash, 10);
        let b = h.enqueue("b").await;
        let (_tx, rx) = watch::channel(false);
        h.broadcaster.process_unstarted(&rx).await;
        assert_eq!(h.tx(b.id).await.nonce, Some(1));
    }
}
