//! Behavior every `TxStore` backend must share
//!
//! Each check works on a fresh random sender and unique idempotency keys, so
//! the suite can run against a database that already holds other rows.

use super::TxStore;
use crate::error::TxmError;
use crate::txm::gas::GasPrice;
use crate::txm::models::{Attempt, AttemptState, NewTransaction, Receipt, Transaction, TxState};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, Bytes, H256, U256};
use uuid::Uuid;

/// Test-only write access to a nonce cursor, bypassing the monotonic rules
#[async_trait]
pub trait CursorOverride {
    async fn overwrite_cursor(&self, from: Address, nonce: u64);
}

fn intent(from: Address, data: &'static [u8]) -> NewTransaction {
    NewTransaction {
        from,
        to: Address::repeat_byte(0xbb),
        value: U256::from(7),
        data: Bytes::from_static(data),
        gas_limit: 50_000,
        idempotency_key: Some(Uuid::new_v4().to_string()),
    }
}

fn attempt_for(tx_id: Uuid, nonce: u64, gwei: u64) -> Attempt {
    Attempt {
        id: Uuid::new_v4(),
        tx_id,
        nonce,
        gas_price: GasPrice::Legacy(U256::from(gwei) * U256::exp10(9)),
        gas_limit: 50_000,
        hash: H256::random(),
        signed_raw: Bytes::from_static(b"raw"),
        state: AttemptState::InFlight,
        created_at: Utc::now(),
        broadcast_at: None,
    }
}

async fn enqueue(store: &dyn TxStore, from: Address) -> Transaction {
    store.create_transaction(&intent(from, b"")).await.unwrap().0
}

/// Enqueue and commit a first attempt at the current cursor
async fn in_flight(store: &dyn TxStore, from: Address) -> (Transaction, Attempt) {
    let tx = enqueue(store, from).await;
    let nonce = store.nonce_cursor(from).await.unwrap().unwrap();
    let attempt = attempt_for(tx.id, nonce, 1);
    store.commit_first_attempt(tx.id, &attempt).await.unwrap();
    (tx, attempt)
}

async fn state_of(store: &dyn TxStore, id: Uuid) -> TxState {
    store.transaction(id).await.unwrap().unwrap().state
}

async fn tracked_attempts(store: &dyn TxStore, from: Address, id: Uuid) -> Vec<Attempt> {
    store
        .tracked_transactions(from)
        .await
        .unwrap()
        .into_iter()
        .find(|tt| tt.tx.id == id)
        .map(|tt| tt.attempts)
        .unwrap_or_default()
}

pub async fn idempotent_create(store: &dyn TxStore) {
    let new = intent(Address::random(), b"a");
    let (first, created) = store.create_transaction(&new).await.unwrap();
    assert!(created);
    assert_eq!(first.state, TxState::Unstarted);

    let (again, created) = store.create_transaction(&new).await.unwrap();
    assert!(!created);
    assert_eq!(again.id, first.id);
    assert_eq!(again.value, U256::from(7));

    let mut changed = new.clone();
    changed.data = Bytes::from_static(b"b");
    let err = store.create_transaction(&changed).await.unwrap_err();
    assert!(matches!(err, TxmError::IdempotencyConflict { existing, .. } if existing == first.id));
}

pub async fn commit_requires_matching_cursor(store: &dyn TxStore) {
    let from = Address::random();
    let tx = enqueue(store, from).await;

    let err = store
        .commit_first_attempt(tx.id, &attempt_for(tx.id, 0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, TxmError::NonceConflict { found: None, .. }));

    assert_eq!(store.seed_nonce_cursor(from, 5).await.unwrap(), 5);
    // seeding never overwrites
    assert_eq!(store.seed_nonce_cursor(from, 9).await.unwrap(), 5);

    let err = store
        .commit_first_attempt(tx.id, &attempt_for(tx.id, 4, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, TxmError::NonceConflict { found: Some(5), .. }));
    assert_eq!(state_of(store, tx.id).await, TxState::Unstarted);
    assert_eq!(store.next_unstarted(from).await.unwrap().map(|t| t.id), Some(tx.id));

    let attempt = attempt_for(tx.id, 5, 1);
    store.commit_first_attempt(tx.id, &attempt).await.unwrap();
    let stored = store.transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TxState::InFlight);
    assert_eq!(stored.nonce, Some(5));
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(6));
    assert!(store.next_unstarted(from).await.unwrap().is_none());

    let pending = store.unbroadcast_in_flight(from).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt.id, attempt.id);
    assert!(!pending[0].replacement);

    store.mark_broadcast(attempt.id, Utc::now()).await.unwrap();
    assert!(store.unbroadcast_in_flight(from).await.unwrap().is_empty());
}

pub async fn sync_cursor_with_chain<S: TxStore + CursorOverride>(store: &S) {
    let fresh = Address::random();
    let outcome = store.sync_nonce_cursor(fresh, 9).await.unwrap();
    assert_eq!(outcome.previous, None);
    assert_eq!(outcome.current, 9);
    assert!(outcome.lost.is_empty());

    let from = Address::random();
    store.seed_nonce_cursor(from, 0).await.unwrap();
    let (a, _) = in_flight(store, from).await;
    let (b, _) = in_flight(store, from).await;
    let (c, _) = in_flight(store, from).await;

    // chain behind the store: nothing changes
    let outcome = store.sync_nonce_cursor(from, 1).await.unwrap();
    assert_eq!(outcome.previous, Some(3));
    assert_eq!(outcome.current, 3);
    assert!(outcome.lost.is_empty());

    // cursor written back behind our own assigned nonces
    store.overwrite_cursor(from, 1).await;
    let mut outcome = store.sync_nonce_cursor(from, 3).await.unwrap();
    outcome.lost.sort();
    let mut expected = vec![b.id, c.id];
    expected.sort();
    assert_eq!(outcome.previous, Some(1));
    assert_eq!(outcome.current, 3);
    assert_eq!(outcome.lost, expected);

    assert_eq!(state_of(store, a.id).await, TxState::InFlight);
    assert_eq!(state_of(store, b.id).await, TxState::FatalError);
    assert_eq!(state_of(store, c.id).await, TxState::FatalError);
    let tracked = store.tracked_transactions(from).await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].tx.id, a.id);

    // the cursor never decreases
    let outcome = store.sync_nonce_cursor(from, 2).await.unwrap();
    assert_eq!(outcome.current, 3);
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(3));

    let outcome = store.sync_nonce_cursor(from, 8).await.unwrap();
    assert_eq!(outcome.current, 8);
    assert!(outcome.lost.is_empty());
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(8));
}

pub async fn fatal_release_rolls_back_latest_nonce_only(store: &dyn TxStore) {
    let from = Address::random();
    store.seed_nonce_cursor(from, 3).await.unwrap();
    let (a, _) = in_flight(store, from).await;
    let (b, _) = in_flight(store, from).await;
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(5));

    // not the most recent assignment: the nonce stays taken
    store.mark_fatal(a.id, "rejected", true).await.unwrap();
    let a = store.transaction(a.id).await.unwrap().unwrap();
    assert_eq!(a.state, TxState::FatalError);
    assert_eq!(a.nonce, Some(3));
    assert_eq!(a.error.as_deref(), Some("rejected"));
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(5));

    store.mark_fatal(b.id, "rejected", true).await.unwrap();
    let b = store.transaction(b.id).await.unwrap().unwrap();
    assert_eq!(b.state, TxState::FatalError);
    assert_eq!(b.nonce, None);
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(4));

    // without release the cursor is left alone
    let (c, _) = in_flight(store, from).await;
    store.mark_fatal(c.id, "lost", false).await.unwrap();
    assert_eq!(store.transaction(c.id).await.unwrap().unwrap().nonce, Some(4));
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(5));

    let unstarted = enqueue(store, from).await;
    store.mark_fatal(unstarted.id, "checker", true).await.unwrap();
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(5));

    let err = store.mark_fatal(b.id, "again", true).await.unwrap_err();
    assert!(matches!(err, TxmError::InvalidStateTransition { .. }));
    assert!(store.tracked_transactions(from).await.unwrap().is_empty());
}

pub async fn replace_attempt_keeps_one_current(store: &dyn TxStore) {
    let from = Address::random();
    store.seed_nonce_cursor(from, 0).await.unwrap();
    let (tx, first) = in_flight(store, from).await;
    store.mark_broadcast(first.id, Utc::now()).await.unwrap();

    let wrong_nonce = attempt_for(tx.id, 1, 2);
    assert!(store.replace_attempt(tx.id, first.id, &wrong_nonce).await.is_err());

    let second = attempt_for(tx.id, 0, 2);
    store.replace_attempt(tx.id, first.id, &second).await.unwrap();

    // the retired attempt can no longer be replaced
    let stray = attempt_for(tx.id, 0, 3);
    assert!(store.replace_attempt(tx.id, first.id, &stray).await.is_err());

    let attempts = tracked_attempts(store, from, tx.id).await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].id, first.id);
    assert_eq!(attempts[0].state, AttemptState::Replaced);
    assert_eq!(attempts[1].id, second.id);
    assert_eq!(attempts[1].state, AttemptState::InFlight);
    assert_eq!(attempts[1].gas_price, second.gas_price);

    let pending = store.unbroadcast_in_flight(from).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt.id, second.id);
    assert!(pending[0].replacement);

    // nonce and cursor are untouched by a replacement
    assert_eq!(store.transaction(tx.id).await.unwrap().unwrap().nonce, Some(0));
    assert_eq!(store.nonce_cursor(from).await.unwrap(), Some(1));
}

pub async fn receipt_retires_losers_and_reverts(store: &dyn TxStore) {
    let from = Address::random();
    store.seed_nonce_cursor(from, 0).await.unwrap();
    let (tx, first) = in_flight(store, from).await;
    let second = attempt_for(tx.id, 0, 2);
    store.replace_attempt(tx.id, first.id, &second).await.unwrap();

    let receipt = |attempt: &Attempt, block: u64| Receipt {
        tx_id: tx.id,
        attempt_id: attempt.id,
        tx_hash: attempt.hash,
        block_number: block,
        block_hash: H256::random(),
        success: true,
    };

    assert!(store
        .record_receipt(&receipt(&first, 10), TxState::InFlight)
        .await
        .is_err());

    // the older attempt was the one mined
    store
        .record_receipt(&receipt(&first, 10), TxState::Confirmed)
        .await
        .unwrap();
    assert_eq!(state_of(store, tx.id).await, TxState::Confirmed);
    let tracked = store.tracked_transactions(from).await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].receipt.as_ref().map(|r| r.attempt_id), Some(first.id));
    assert_eq!(tracked[0].receipt.as_ref().map(|r| r.block_number), Some(10));
    let states: Vec<AttemptState> = tracked[0].attempts.iter().map(|a| a.state).collect();
    assert_eq!(states, vec![AttemptState::Confirmed, AttemptState::Replaced]);

    store.revert_receipt(tx.id).await.unwrap();
    assert_eq!(state_of(store, tx.id).await, TxState::InFlight);
    let tracked = store.tracked_transactions(from).await.unwrap();
    assert!(tracked[0].receipt.is_none());
    assert_eq!(tracked[0].current_attempt().map(|a| a.id), Some(first.id));
    assert!(store.revert_receipt(tx.id).await.is_err());

    // after the reorg the newer attempt lands instead and reaches finality
    store
        .record_receipt(&receipt(&second, 12), TxState::Finalized)
        .await
        .unwrap();
    assert_eq!(state_of(store, tx.id).await, TxState::Finalized);
    assert!(store.tracked_transactions(from).await.unwrap().is_empty());
    assert!(store.revert_receipt(tx.id).await.is_err());
    assert!(store.mark_fatal(tx.id, "late", false).await.is_err());
}

/// Every check above against one store
pub async fn run_all<S: TxStore + CursorOverride>(store: &S) {
    idempotent_create(store).await;
    commit_requires_matching_cursor(store).await;
    sync_cursor_with_chain(store).await;
    fatal_release_rolls_back_latest_nonce_only(store).await;
    replace_attempt_keeps_one_current(store).await;
    receipt_retires_losers_and_reverts(store).await;
}
