//! Configuration management for the transaction manager
//!
//! Loads configuration from a TOML file with `${VAR}` substitution, then applies
//! `TXM__SECTION__KEY` environment overrides.

use crate::chain::finality::recommended_finality_depth;

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub txm: TxmConfig,
    pub chain: ChainConfig,
    pub database: DatabaseConfig,
    pub keys: KeysConfig,
    #[serde(default)]
    pub forwarders: Vec<ForwarderConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

/// Policy knobs for the broadcaster, confirmer and resender
#[derive(Debug, Clone, Deserialize)]
pub struct TxmConfig {
    /// Blocks on top of the inclusion block before a receipt is final
    #[serde(default)]
    pub finality_depth: Option<u64>,
    #[serde(default = "default_bump_percent")]
    pub bump_percent: u64,
    #[serde(default = "default_bump_min_gwei")]
    pub bump_min_gwei: u64,
    #[serde(default = "default_min_gas_price_gwei")]
    pub min_gas_price_gwei: u64,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_broadcaster_poll_ms")]
    pub broadcaster_poll_ms: u64,
    #[serde(default = "default_confirmer_poll_ms")]
    pub confirmer_poll_ms: u64,
    #[serde(default = "default_head_poll_ms")]
    pub head_poll_ms: u64,
    /// 0 disables the resender
    #[serde(default = "default_resend_after_secs")]
    pub resend_after_secs: u64,
    #[serde(default = "default_resend_interval_secs")]
    pub resend_interval_secs: u64,
    #[serde(default = "default_resend_batch_size")]
    pub resend_batch_size: usize,
    #[serde(default = "default_true")]
    pub nonce_auto_sync: bool,
    #[serde(default)]
    pub use_forwarders: bool,
    #[serde(default)]
    pub checker: CheckerKind,
}

/// Pre-broadcast validation strategy
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CheckerKind {
    #[default]
    None,
    Simulate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_gas_price_buffer_percent")]
    pub gas_price_buffer_percent: u64,
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL, or `memory://` for the in-process store
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Names of environment variables holding hex private keys
    pub private_key_envs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    pub from: Address,
    pub forwarder: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Chains reject replacements that raise the fee by less than this
pub const MIN_BUMP_PERCENT: u64 = 10;

const GWEI: u64 = 1_000_000_000;

fn default_bump_percent() -> u64 {
    20
}
fn default_bump_min_gwei() -> u64 {
    5
}
fn default_min_gas_price_gwei() -> u64 {
    1
}
fn default_max_gas_price_gwei() -> u64 {
    500
}
fn default_stuck_threshold_secs() -> u64 {
    60
}
fn default_broadcaster_poll_ms() -> u64 {
    1_000
}
fn default_confirmer_poll_ms() -> u64 {
    15_000
}
fn default_head_poll_ms() -> u64 {
    2_000
}
fn default_resend_after_secs() -> u64 {
    300
}
fn default_resend_interval_secs() -> u64 {
    30
}
fn default_resend_batch_size() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_gas_price_buffer_percent() -> u64 {
    10
}
fn default_submit_timeout_secs() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            finality_depth: None,
            bump_percent: default_bump_percent(),
            bump_min_gwei: default_bump_min_gwei(),
            min_gas_price_gwei: default_min_gas_price_gwei(),
            max_gas_price_gwei: default_max_gas_price_gwei(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            broadcaster_poll_ms: default_broadcaster_poll_ms(),
            confirmer_poll_ms: default_confirmer_poll_ms(),
            head_poll_ms: default_head_poll_ms(),
            resend_after_secs: default_resend_after_secs(),
            resend_interval_secs: default_resend_interval_secs(),
            resend_batch_size: default_resend_batch_size(),
            nonce_auto_sync: true,
            use_forwarders: false,
            checker: CheckerKind::None,
        }
    }
}

impl TxmConfig {
    pub fn finality_depth(&self) -> u64 {
        self.finality_depth.unwrap_or(64)
    }

    pub fn bump_min_wei(&self) -> U256 {
        U256::from(self.bump_min_gwei) * U256::from(GWEI)
    }

    pub fn min_gas_price_wei(&self) -> U256 {
        U256::from(self.min_gas_price_gwei) * U256::from(GWEI)
    }

    pub fn max_gas_price_wei(&self) -> U256 {
        U256::from(self.max_gas_price_gwei) * U256::from(GWEI)
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs as i64)
    }

    pub fn resend_after(&self) -> Option<chrono::Duration> {
        (self.resend_after_secs > 0).then(|| chrono::Duration::seconds(self.resend_after_secs as i64))
    }

    pub fn broadcaster_poll_interval(&self) -> Duration {
        Duration::from_millis(self.broadcaster_poll_ms)
    }

    pub fn confirmer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmer_poll_ms)
    }

    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }

    /// Validate policy knobs
    pub fn validate(&self) -> Result<()> {
        if self.bump_percent < MIN_BUMP_PERCENT {
            anyhow::bail!(
                "bump_percent must be at least {}, got {}",
                MIN_BUMP_PERCENT,
                self.bump_percent
            );
        }
        if self.max_gas_price_gwei < self.min_gas_price_gwei {
            anyhow::bail!(
                "max_gas_price_gwei ({}) is below min_gas_price_gwei ({})",
                self.max_gas_price_gwei,
                self.min_gas_price_gwei
            );
        }
        if self.finality_depth == Some(0) {
            anyhow::bail!("finality_depth must be positive");
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from the file named by `TXM_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let mut settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(&config_str, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("TXM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| "Failed to assemble configuration")?
            .try_deserialize()
            .with_context(|| "Failed to parse configuration")?;

        if settings.txm.finality_depth.is_none() {
            settings.txm.finality_depth = Some(recommended_finality_depth(settings.chain.chain_id));
        }

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        self.txm.validate()?;

        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        if self.keys.private_key_envs.is_empty() {
            anyhow::bail!("At least one sending key must be configured");
        }

        if self.txm.use_forwarders && self.forwarders.is_empty() {
            tracing::warn!("Forwarders enabled but none configured - all transactions go direct");
        }

        Ok(())
    }

    /// Whether the in-process store was requested
    pub fn uses_memory_store(&self) -> bool {
        self.database.url.starts_with("memory://")
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
