//! Oracle TXM - durable transaction manager for EVM chains
//!
//! Accepts transaction intents over HTTP, assigns gapless nonces per sending
//! key, and drives each transaction through broadcast, fee bumping, inclusion
//! and finality, surviving restarts without double-spending a nonce.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod events;
mod keys;
mod metrics;
mod state;
mod txm;

use chain::EthChainClient;
use config::{CheckerKind, Settings};
use events::BroadcastNotifier;
use keys::{KeyStore, LocalKeyStore};
use metrics::MetricsServer;
use state::{InMemoryTxStore, PgTxStore, TxStore};
use txm::{
    ChainFeeEstimator, Collaborators, ForwarderRegistry, NoChecker, SimulateChecker,
    StaticForwarders, TransmitChecker, Txm,
};

/// Buffered state changes per subscriber
const EVENT_CAPACITY: usize = 1024;

const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Oracle TXM v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({}), finality depth {}",
        settings.chain.name,
        settings.chain.chain_id,
        settings.txm.finality_depth()
    );

    // Initialize the transaction store
    let store: Arc<dyn TxStore> = if settings.uses_memory_store() {
        warn!("Using the in-memory store; transactions will not survive a restart");
        Arc::new(InMemoryTxStore::new())
    } else {
        let store = PgTxStore::new(&settings.database).await?;
        info!("Database connection established");
        store.run_migrations().await?;
        info!("Database migrations complete");
        Arc::new(store)
    };

    // Chain client and fee estimation
    let chain = Arc::new(EthChainClient::new(settings.chain.clone())?);
    let fees = Arc::new(ChainFeeEstimator::new(
        chain.clone(),
        settings.chain.gas_price_buffer_percent,
    ));

    let keys = Arc::new(LocalKeyStore::from_env(
        &settings.keys.private_key_envs,
        settings.chain.chain_id,
    )?);
    info!("Loaded {} sending keys", keys.enabled_addresses().len());

    let forwarders: Option<Arc<dyn ForwarderRegistry>> = if settings.forwarders.is_empty() {
        None
    } else {
        Some(Arc::new(StaticForwarders::from_config(&settings.forwarders)))
    };

    let checker: Arc<dyn TransmitChecker> = match settings.txm.checker {
        CheckerKind::None => Arc::new(NoChecker),
        CheckerKind::Simulate => Arc::new(SimulateChecker::new(
            chain.clone(),
            forwarders.clone().filter(|_| settings.txm.use_forwarders),
        )),
    };

    let notifier = Arc::new(BroadcastNotifier::new(EVENT_CAPACITY));
    let txm = Arc::new(Txm::new(
        Collaborators {
            store,
            chain: chain.clone(),
            keys,
            fees,
            notifier,
            checker,
            forwarders,
        },
        &settings.txm,
    ));

    // Nonce reconciliation happens here; refuse to run on failure
    txm.start().await?;

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let txm = txm.clone();
        async move {
            if let Err(e) = api::run_server(config, txm).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chain = chain.clone();
        let txm = txm.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS))
                    .await;

                let healthy = chain.health_check().await;
                metrics::record_chain_health(txm.chain_id(), healthy);
                if !healthy {
                    warn!("Chain {} health check failed", txm.chain_id());
                }

                match txm.state_counts().await {
                    Ok(counts) => {
                        metrics::record_state_counts(&counts);
                        if healthy {
                            metrics::record_health_check();
                        } else {
                            metrics::record_health_check_failure();
                        }
                    }
                    Err(e) => {
                        warn!("Store health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Oracle TXM is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Workers finish their current iteration before we exit
    txm.stop().await;

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Oracle TXM stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,oracle_txm=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
