//! New-block signal for the confirmer, driven by HTTP polling

use super::ChainClient;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Polls the chain head and publishes every increase
pub struct HeadTracker {
    chain: Arc<dyn ChainClient>,
    poll_interval: Duration,
    head_tx: watch::Sender<u64>,
}

impl HeadTracker {
    pub fn new(chain: Arc<dyn ChainClient>, poll_interval: Duration) -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            chain,
            poll_interval,
            head_tx,
        }
    }

    /// Receiver that wakes on every new head
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }

    /// Poll once, returning the new head if it moved forward
    pub async fn poll(&self) -> Option<u64> {
        let current = match self.chain.block_height().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to get block number: {}", e);
                return None;
            }
        };

        let last = *self.head_tx.borrow();
        if current <= last {
            return None;
        }

        debug!("Chain {}: new head {}", self.chain.chain_id(), current);
        crate::metrics::record_block_height(self.chain.chain_id(), current);
        self.head_tx.send_replace(current);
        Some(current)
    }

    /// Polling loop until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Head tracker started for chain {} ({:?} interval)",
            self.chain.chain_id(),
            self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Head tracker stopped");
    }
}
