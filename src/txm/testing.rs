//! Stateful fakes and a wired-up component set for lifecycle tests

use super::attempt::AttemptBuilder;
use super::broadcaster::Broadcaster;
use super::checker::{NoChecker, TransmitChecker};
use super::confirmer::Confirmer;
use super::gas::{FeeEstimator, FeePolicy, GasPrice};
use super::locks::KeyLocks;
use super::models::{Attempt, NewTransaction, Transaction};
use super::nonce::NonceSyncer;
use super::resender::Resender;
use super::Collaborators;
use crate::chain::{ChainClient, ChainReceipt, SimulationOutcome, SubmitOutcome};
use crate::config::TxmConfig;
use crate::error::TxmResult;
use crate::events::{BroadcastNotifier, TxStateChange};
use crate::keys::{KeyStore, LocalKeyStore};
use crate::state::{InMemoryTxStore, TxStore};

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::Rlp;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const CHAIN_ID: u64 = 31337;

// anvil development key 0
const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

#[derive(Default)]
struct ChainState {
    head: u64,
    nonces: HashMap<Address, u64>,
    submissions: Vec<Bytes>,
    receipts: HashMap<H256, ChainReceipt>,
    scripted: VecDeque<SubmitOutcome>,
}

/// In-memory chain: records submissions, mines on request
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn set_nonce(&self, from: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(from, nonce);
    }

    /// Outcome for the next submission; unscripted submissions are accepted
    pub fn script_submit(&self, outcome: SubmitOutcome) {
        self.state.lock().unwrap().scripted.push_back(outcome);
    }

    pub fn submissions(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Hashes of every submission, in order, duplicates included
    pub fn submitted_hashes(&self) -> Vec<H256> {
        self.submissions()
            .iter()
            .map(|raw| H256::from(keccak256(raw)))
            .collect()
    }

    /// Include a submitted transaction in `block` and advance its sender's nonce
    pub fn mine(&self, hash: H256, block: u64) {
        let mut state = self.state.lock().unwrap();
        let raw = state
            .submissions
            .iter()
            .find(|raw| H256::from(keccak256(raw)) == hash)
            .cloned()
            .expect("mined transaction was never submitted");

        let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(&raw)).unwrap();
        let from = signature.recover(tx.sighash()).unwrap();
        let nonce = tx.nonce().unwrap().as_u64();

        let mined = state.nonces.entry(from).or_default();
        *mined = (*mined).max(nonce + 1);
        state.receipts.insert(
            hash,
            ChainReceipt {
                tx_hash: hash,
                block_number: block,
                block_hash: H256::from_low_u64_be(block),
                success: true,
            },
        );
    }

    /// Remove an inclusion, as a reorg would
    pub fn unmine(&self, hash: H256) {
        self.state.lock().unwrap().receipts.remove(&hash);
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    async fn current_nonce(&self, address: Address) -> TxmResult<u64> {
        Ok(self.state.lock().unwrap().nonces.get(&address).copied().unwrap_or(0))
    }

    async fn submit(&self, raw: Bytes) -> SubmitOutcome {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(raw);
        state.scripted.pop_front().unwrap_or(SubmitOutcome::Accepted)
    }

    async fn receipt(&self, tx_hash: H256) -> TxmResult<Option<ChainReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }

    async fn block_height(&self) -> TxmResult<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn simulate(&self, _tx: &TypedTransaction) -> TxmResult<SimulationOutcome> {
        Ok(SimulationOutcome::Success)
    }
}

/// Fee market the test can move
pub struct FixedFees {
    price: Mutex<GasPrice>,
}

impl FixedFees {
    pub fn new(price: GasPrice) -> Self {
        Self {
            price: Mutex::new(price),
        }
    }

    pub fn set(&self, price: GasPrice) {
        *self.price.lock().unwrap() = price;
    }
}

#[async_trait]
impl FeeEstimator for FixedFees {
    async fn estimate(&self) -> TxmResult<GasPrice> {
        Ok(*self.price.lock().unwrap())
    }
}

pub fn test_config() -> TxmConfig {
    TxmConfig {
        finality_depth: Some(3),
        bump_percent: 10,
        bump_min_gwei: 0,
        min_gas_price_gwei: 1,
        max_gas_price_gwei: 500,
        stuck_threshold_secs: 60,
        broadcaster_poll_ms: 20,
        confirmer_poll_ms: 20,
        head_poll_ms: 20,
        resend_after_secs: 300,
        ..TxmConfig::default()
    }
}

/// Real components over the in-memory store and the fake chain, driven by
/// hand instead of by worker loops
pub struct Harness {
    pub from: Address,
    pub store: Arc<InMemoryTxStore>,
    pub chain: Arc<FakeChain>,
    pub fees: Arc<FixedFees>,
    pub keys: Arc<LocalKeyStore>,
    pub notifier: Arc<BroadcastNotifier>,
    pub events: broadcast::Receiver<TxStateChange>,
    pub builder: Arc<AttemptBuilder>,
    pub broadcaster: Broadcaster,
    pub confirmer: Confirmer,
    pub resender: Resender,
    pub syncer: Arc<NonceSyncer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_checker(Arc::new(NoChecker))
    }

    pub fn with_checker(checker: Arc<dyn TransmitChecker>) -> Self {
        let config = test_config();
        let wallet: LocalWallet = DEV_KEY.parse().unwrap();
        let keys = Arc::new(LocalKeyStore::new(vec![wallet], CHAIN_ID));
        let from = keys.enabled_addresses()[0];

        let store = Arc::new(InMemoryTxStore::new());
        let chain = Arc::new(FakeChain::new());
        let fees = Arc::new(FixedFees::new(GasPrice::Legacy(gwei(10))));
        let notifier = Arc::new(BroadcastNotifier::new(256));
        let events = notifier.subscribe();
        let locks = Arc::new(KeyLocks::new());

        let builder = Arc::new(AttemptBuilder::new(
            CHAIN_ID,
            keys.clone(),
            fees.clone(),
            FeePolicy::from_config(&config),
            None,
        ));
        let syncer = Arc::new(NonceSyncer::new(
            store.clone(),
            chain.clone(),
            notifier.clone(),
            locks.clone(),
        ));
        let broadcaster = Broadcaster::new(
            from,
            store.clone(),
            chain.clone(),
            builder.clone(),
            checker,
            notifier.clone(),
            locks.clone(),
            Some(syncer.clone()),
            Duration::from_millis(20),
        );
        let confirmer = Confirmer::new(
            store.clone(),
            chain.clone(),
            builder.clone(),
            notifier.clone(),
            locks,
            vec![from],
            config.finality_depth(),
            config.stuck_threshold(),
            Duration::from_millis(20),
        );
        let resender = Resender::new(
            store.clone(),
            chain.clone(),
            chrono::Duration::seconds(config.resend_after_secs as i64),
            Duration::from_millis(20),
            100,
        );

        Self {
            from,
            store,
            chain,
            fees,
            keys,
            notifier,
            events,
            builder,
            broadcaster,
            confirmer,
            resender,
            syncer,
        }
    }

    pub fn intent(&self, key: &str) -> NewTransaction {
        NewTransaction {
            from: self.from,
            to: Address::repeat_byte(0x42),
            value: U256::zero(),
            data: Bytes::from(key.as_bytes().to_vec()),
            gas_limit: 100_000,
            idempotency_key: Some(key.to_string()),
        }
    }

    pub async fn enqueue(&self, key: &str) -> Transaction {
        self.store.create_transaction(&self.intent(key)).await.unwrap().0
    }

    /// Startup sync followed by one broadcaster pass
    pub async fn broadcast(&self) {
        self.syncer.sync(self.from).await.unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        self.broadcaster.resume_unbroadcast().await.unwrap();
        self.broadcaster.process_unstarted(&rx).await;
    }

    pub async fn tx(&self, id: uuid::Uuid) -> Transaction {
        self.store.transaction(id).await.unwrap().unwrap()
    }

    pub async fn attempts(&self, id: uuid::Uuid) -> Vec<Attempt> {
        self.store.attempts_for(id).await
    }

    /// Collaborators for a full `Txm` over this harness's store, chain and keys
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            chain: self.chain.clone(),
            keys: self.keys.clone(),
            fees: self.fees.clone(),
            notifier: self.notifier.clone(),
            checker: Arc::new(NoChecker),
            forwarders: None,
        }
    }

    pub fn drain_events(&mut self) -> Vec<TxStateChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.events.try_recv() {
            changes.push(change);
        }
        changes
    }
}
