//! Reconciles nonce cursors with the chain
//!
//! Handles:
//! - Startup sync per sending key (fail-closed)
//! - On-demand sync after an ambiguous "nonce too low"
//! - Failing in-flight transactions whose nonce slot was consumed elsewhere

use super::locks::KeyLocks;
use super::models::{NonceSyncOutcome, TxState};
use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};
use crate::events::{EventNotifier, TxStateChange};
use crate::state::TxStore;

use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct NonceSyncer {
    store: Arc<dyn TxStore>,
    chain: Arc<dyn ChainClient>,
    notifier: Arc<dyn EventNotifier>,
    locks: Arc<KeyLocks>,
}

impl NonceSyncer {
    pub fn new(
        store: Arc<dyn TxStore>,
        chain: Arc<dyn ChainClient>,
        notifier: Arc<dyn EventNotifier>,
        locks: Arc<KeyLocks>,
    ) -> Self {
        Self {
            store,
            chain,
            notifier,
            locks,
        }
    }

    /// Bring the cursor of `from` up to the chain nonce. Takes the key's
    /// exclusive section, so it never interleaves with nonce assignment.
    pub async fn sync(&self, from: Address) -> TxmResult<NonceSyncOutcome> {
        let _guard = self.locks.lock(from).await;

        let chain_nonce = self
            .chain
            .current_nonce(from)
            .await
            .map_err(|e| TxmError::NonceSync {
                address: format!("{:?}", from),
                message: e.to_string(),
            })?;

        let outcome = self.store.sync_nonce_cursor(from, chain_nonce).await?;

        match outcome.previous {
            None => info!("Initialized nonce cursor for {:?} at {}", from, outcome.current),
            Some(previous) if previous < outcome.current => warn!(
                "Nonce cursor for {:?} advanced {} -> {} (sent outside this node)",
                from, previous, outcome.current
            ),
            Some(previous) => debug!(
                "Nonce cursor for {:?} at {} (chain {})",
                from, previous, chain_nonce
            ),
        }

        for tx_id in &outcome.lost {
            warn!("Transaction {} lost its nonce slot", tx_id);
            crate::metrics::record_tx_fatal(from, "nonce_lost");
            self.notifier.notify(TxStateChange::new(
                *tx_id,
                from,
                TxState::InFlight,
                TxState::FatalError,
            ));
        }

        Ok(outcome)
    }
}
