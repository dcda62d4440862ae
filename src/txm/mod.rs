//! Transaction manager core
//!
//! `Txm` is composed once from an explicit set of collaborators and owns the
//! worker tasks:
//! - One broadcaster per sending key (new-intent signal + interval)
//! - The head tracker and the confirmer (new-head signal + interval)
//! - The resender, when enabled (interval)
//!
//! Workers share nothing but the store and the per-key lock table.

pub mod attempt;
pub mod broadcaster;
pub mod checker;
pub mod confirmer;
pub mod forwarder;
pub mod gas;
pub mod locks;
pub mod models;
pub mod nonce;
pub mod resender;

#[cfg(test)]
pub mod testing;

pub use checker::{NoChecker, SimulateChecker, TransmitChecker};
pub use forwarder::{ForwarderRegistry, StaticForwarders};
pub use gas::{ChainFeeEstimator, FeeEstimator, FeePolicy, GasPrice};
pub use models::{NewTransaction, StateCounts, Transaction, TxState};

use attempt::AttemptBuilder;
use broadcaster::Broadcaster;
use confirmer::Confirmer;
use locks::KeyLocks;
use nonce::NonceSyncer;
use resender::Resender;

use crate::chain::{ChainClient, HeadTracker};
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};
use crate::events::EventNotifier;
use crate::keys::KeyStore;
use crate::state::TxStore;

use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything the manager depends on, wired once at startup
pub struct Collaborators {
    pub store: Arc<dyn TxStore>,
    pub chain: Arc<dyn ChainClient>,
    pub keys: Arc<dyn KeyStore>,
    pub fees: Arc<dyn FeeEstimator>,
    pub notifier: Arc<dyn EventNotifier>,
    pub checker: Arc<dyn TransmitChecker>,
    pub forwarders: Option<Arc<dyn ForwarderRegistry>>,
}

pub struct Txm {
    store: Arc<dyn TxStore>,
    chain: Arc<dyn ChainClient>,
    keys: Vec<Address>,
    syncer: Option<Arc<NonceSyncer>>,
    broadcasters: HashMap<Address, Arc<Broadcaster>>,
    head_tracker: Arc<HeadTracker>,
    confirmer: Arc<Confirmer>,
    resender: Option<Arc<Resender>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Txm {
    pub fn new(c: Collaborators, config: &TxmConfig) -> Self {
        let keys = c.keys.enabled_addresses();
        let locks = Arc::new(KeyLocks::new());
        let forwarders = if config.use_forwarders { c.forwarders } else { None };

        let builder = Arc::new(AttemptBuilder::new(
            c.chain.chain_id(),
            c.keys.clone(),
            c.fees.clone(),
            FeePolicy::from_config(config),
            forwarders,
        ));

        let syncer = config.nonce_auto_sync.then(|| {
            Arc::new(NonceSyncer::new(
                c.store.clone(),
                c.chain.clone(),
                c.notifier.clone(),
                locks.clone(),
            ))
        });

        let broadcasters = keys
            .iter()
            .map(|from| {
                let broadcaster = Broadcaster::new(
                    *from,
                    c.store.clone(),
                    c.chain.clone(),
                    builder.clone(),
                    c.checker.clone(),
                    c.notifier.clone(),
                    locks.clone(),
                    syncer.clone(),
                    config.broadcaster_poll_interval(),
                );
                (*from, Arc::new(broadcaster))
            })
            .collect();

        let head_tracker = Arc::new(HeadTracker::new(c.chain.clone(), config.head_poll_interval()));

        let confirmer = Arc::new(Confirmer::new(
            c.store.clone(),
            c.chain.clone(),
            builder,
            c.notifier.clone(),
            locks,
            keys.clone(),
            config.finality_depth(),
            config.stuck_threshold(),
            config.confirmer_poll_interval(),
        ));

        let resender = config.resend_after().map(|after| {
            Arc::new(Resender::new(
                c.store.clone(),
                c.chain.clone(),
                after,
                config.resend_interval(),
                config.resend_batch_size,
            ))
        });

        let (shutdown, _) = watch::channel(false);

        Self {
            store: c.store,
            chain: c.chain,
            keys,
            syncer,
            broadcasters,
            head_tracker,
            confirmer,
            resender,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Reconcile every key's nonce cursor with the chain, then spawn the
    /// workers. Fails without spawning anything if any key cannot be synced.
    pub async fn start(&self) -> TxmResult<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(TxmError::Internal("transaction manager already started".to_string()));
        }

        for from in &self.keys {
            self.prepare_key(*from).await?;
        }

        let shutdown = self.shutdown.subscribe();

        tasks.push(tokio::spawn({
            let tracker = self.head_tracker.clone();
            let shutdown = shutdown.clone();
            async move { tracker.run(shutdown).await }
        }));

        for broadcaster in self.broadcasters.values() {
            let broadcaster = broadcaster.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { broadcaster.run(shutdown).await }));
        }

        tasks.push(tokio::spawn({
            let confirmer = self.confirmer.clone();
            let heads = self.head_tracker.subscribe();
            let shutdown = shutdown.clone();
            async move { confirmer.run(heads, shutdown).await }
        }));

        if let Some(resender) = &self.resender {
            let resender = resender.clone();
            tasks.push(tokio::spawn(async move { resender.run(shutdown).await }));
        }

        info!(
            "Transaction manager started: {} keys, resender {}",
            self.keys.len(),
            if self.resender.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    async fn prepare_key(&self, from: Address) -> TxmResult<()> {
        match &self.syncer {
            Some(syncer) => {
                syncer.sync(from).await?;
            }
            None => {
                if self.store.nonce_cursor(from).await?.is_none() {
                    let chain_nonce = self.chain.current_nonce(from).await.map_err(|e| {
                        TxmError::NonceSync {
                            address: format!("{:?}", from),
                            message: e.to_string(),
                        }
                    })?;
                    let cursor = self.store.seed_nonce_cursor(from, chain_nonce).await?;
                    info!("Seeded nonce cursor for {:?} at {}", from, cursor);
                }
            }
        }
        Ok(())
    }

    /// Signal shutdown and wait for every worker to finish its current iteration
    pub async fn stop(&self) {
        info!("Transaction manager shutdown initiated");
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Transaction manager stopped");
    }

    /// Durably enqueue an intent and wake its key's broadcaster. Returns the
    /// stored transaction and whether it was newly created.
    pub async fn create_transaction(&self, new: NewTransaction) -> TxmResult<(Transaction, bool)> {
        let broadcaster = self
            .broadcasters
            .get(&new.from)
            .ok_or_else(|| TxmError::UnknownKey(format!("{:?}", new.from)))?;
        if new.gas_limit == 0 {
            return Err(TxmError::InvalidRequest("gas_limit must be positive".to_string()));
        }

        let (tx, created) = self.store.create_transaction(&new).await?;
        if created {
            crate::metrics::record_tx_created(tx.from);
            debug!("Enqueued {} for {:?}", tx.id, tx.from);
        } else {
            debug!("Idempotent replay of {:?} -> {}", tx.idempotency_key, tx.id);
        }

        broadcaster.wake();
        Ok((tx, created))
    }

    pub async fn transaction(&self, id: Uuid) -> TxmResult<Option<Transaction>> {
        self.store.transaction(id).await
    }

    pub async fn state_counts(&self) -> TxmResult<StateCounts> {
        self.store.state_counts().await
    }

    /// Store and chain both reachable
    pub async fn ready(&self) -> TxmResult<()> {
        self.store.health_check().await?;
        self.chain.block_height().await?;
        Ok(())
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    pub fn keys(&self) -> &[Address] {
        &self.keys
    }
}
