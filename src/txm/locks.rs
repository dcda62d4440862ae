//! Per-key exclusive sections

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per sending key, created on first use
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Keys never contend with each other.
    pub async fn lock(&self, key: Address) -> OwnedMutexGuard<()> {
        // clone out of the map so no shard lock is held across the await
        let lock = self.locks.entry(key).or_default().clone();
        lock.lock_owned().await
    }
}
