//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain head and RPC health
//! - Transaction lifecycle per sending key
//! - Stuck, reorged and resent transactions

use crate::error::{TxmError, TxmResult};
use crate::txm::models::StateCounts;

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::Address;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "txm_chain_connected",
        "Chain RPC status (1=reachable, 0=unreachable)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "txm_chain_block_height",
        "Latest observed block height",
        &["chain_id"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_CREATED: CounterVec = register_counter_vec!(
        "txm_transactions_created_total",
        "Transactions enqueued",
        &["from"]
    ).unwrap();

    pub static ref TX_BROADCAST: CounterVec = register_counter_vec!(
        "txm_transactions_broadcast_total",
        "First attempts handed to the chain",
        &["from"]
    ).unwrap();

    pub static ref TX_BUMPED: CounterVec = register_counter_vec!(
        "txm_attempts_bumped_total",
        "Replacement attempts with a bumped fee",
        &["from"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txm_transactions_confirmed_total",
        "Transactions included on chain",
        &["from"]
    ).unwrap();

    pub static ref TX_FINALIZED: CounterVec = register_counter_vec!(
        "txm_transactions_finalized_total",
        "Transactions past the finality depth",
        &["from"]
    ).unwrap();

    pub static ref TX_FATAL: CounterVec = register_counter_vec!(
        "txm_transactions_fatal_total",
        "Transactions moved to fatal_error",
        &["from", "reason"]
    ).unwrap();

    pub static ref TX_REORGED: CounterVec = register_counter_vec!(
        "txm_transactions_reorged_total",
        "Confirmed transactions returned to in_flight",
        &["from"]
    ).unwrap();

    pub static ref TX_RESENT: CounterVec = register_counter_vec!(
        "txm_attempts_resent_total",
        "Unchanged attempts re-submitted by the resender",
        &[]
    ).unwrap();

    pub static ref TX_STUCK: CounterVec = register_counter_vec!(
        "txm_transactions_stuck_total",
        "Bumps refused at the fee ceiling",
        &["from"]
    ).unwrap();

    pub static ref TX_STATES: GaugeVec = register_gauge_vec!(
        "txm_transactions",
        "Transactions per state",
        &["state"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "txm_transaction_inclusion_seconds",
        "Time from enqueue to first inclusion",
        &["from"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "txm_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "txm_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TxmResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TxmError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxmError::Internal(e.to_string()))?;

        Ok(())
    }
}

pub async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn key(from: Address) -> String {
    format!("{:?}", from)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_tx_created(from: Address) {
    TX_CREATED.with_label_values(&[&key(from)]).inc();
}

pub fn record_tx_broadcast(from: Address) {
    TX_BROADCAST.with_label_values(&[&key(from)]).inc();
}

pub fn record_tx_bumped(from: Address) {
    TX_BUMPED.with_label_values(&[&key(from)]).inc();
}

pub fn record_tx_confirmed(from: Address, latency_secs: f64) {
    let from = key(from);
    TX_CONFIRMED.with_label_values(&[&from]).inc();
    TX_LATENCY.with_label_values(&[&from]).observe(latency_secs);
}

pub fn record_tx_finalized(from: Address) {
    TX_FINALIZED.with_label_values(&[&key(from)]).inc();
}

pub fn record_tx_fatal(from: Address, reason: &str) {
    TX_FATAL.with_label_values(&[&key(from), reason]).inc();
}

pub fn record_tx_reorged(from: Address) {
    TX_REORGED.with_label_values(&[&key(from)]).inc();
}

pub fn record_tx_resent() {
    TX_RESENT.with_label_values(&[]).inc();
}

pub fn record_tx_stuck(from: Address) {
    TX_STUCK.with_label_values(&[&key(from)]).inc();
}

pub fn record_state_counts(counts: &StateCounts) {
    for (state, n) in [
        ("unstarted", counts.unstarted),
        ("in_flight", counts.in_flight),
        ("confirmed", counts.confirmed),
        ("finalized", counts.finalized),
        ("fatal_error", counts.fatal_error),
    ] {
        TX_STATES.with_label_values(&[state]).set(n as f64);
    }
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
