//! Re-submits unchanged attempts that have been in flight too long, in case
//! peers dropped them silently

use crate::chain::{ChainClient, SubmitOutcome};
use crate::error::TxmResult;
use crate::state::TxStore;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Resender {
    store: Arc<dyn TxStore>,
    chain: Arc<dyn ChainClient>,
    resend_after: chrono::Duration,
    interval: Duration,
    batch_size: usize,
}

impl Resender {
    pub fn new(
        store: Arc<dyn TxStore>,
        chain: Arc<dyn ChainClient>,
        resend_after: chrono::Duration,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            chain,
            resend_after,
            interval,
            batch_size,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Resender started (after {}s, every {:?})",
            self.resend_after.num_seconds(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.resend_stale().await {
                warn!("Resend pass failed: {}", e);
            }
        }

        info!("Resender stopped");
    }

    /// Re-submit every stale current attempt once. Returns how many were sent.
    pub async fn resend_stale(&self) -> TxmResult<usize> {
        let cutoff = Utc::now() - self.resend_after;
        let stale = self.store.stale_attempts(cutoff, self.batch_size).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        info!("Resending {} stale attempts", stale.len());
        for attempt in &stale {
            match self.chain.submit(attempt.signed_raw.clone()).await {
                SubmitOutcome::Accepted => {
                    debug!("Resent {:?} (nonce {})", attempt.hash, attempt.nonce)
                }
                SubmitOutcome::Retryable(reason) => {
                    debug!("Resend of {:?} inconclusive: {}", attempt.hash, reason)
                }
                // typically already included
                SubmitOutcome::Rejected(reason) => {
                    debug!("Resend of {:?} rejected: {}", attempt.hash, reason)
                }
            }
            crate::metrics::record_tx_resent();
        }

        Ok(stale.len())
    }
}
