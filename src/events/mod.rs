//! Transaction state change notifications
//!
//! Fire-and-forget: publishing never blocks a worker and never fails the
//! operation that caused the change.

use crate::txm::models::TxState;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// A transaction moved between lifecycle states
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxStateChange {
    pub tx_id: Uuid,
    pub from: Address,
    pub old: TxState,
    pub new: TxState,
    pub at: DateTime<Utc>,
}

impl TxStateChange {
    pub fn new(tx_id: Uuid, from: Address, old: TxState, new: TxState) -> Self {
        Self {
            tx_id,
            from,
            old,
            new,
            at: Utc::now(),
        }
    }
}

/// Sink for state change events
#[cfg_attr(test, mockall::automock)]
pub trait EventNotifier: Send + Sync {
    fn notify(&self, change: TxStateChange);
}

/// Publishes events on a tokio broadcast channel
pub struct BroadcastNotifier {
    sender: broadcast::Sender<TxStateChange>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxStateChange> {
        self.sender.subscribe()
    }
}

impl EventNotifier for BroadcastNotifier {
    fn notify(&self, change: TxStateChange) {
        trace!("{} {} -> {}", change.tx_id, change.old, change.new);
        // no subscribers is fine
        let _ = self.sender.send(change);
    }
}
