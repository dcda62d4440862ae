//! Signing keys
//!
//! The transaction manager only ever sees addresses and signed payloads; key
//! material stays inside the `KeyStore` implementation.

use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use std::collections::BTreeMap;
use tracing::info;

/// Signing service for sending keys
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Addresses allowed to send transactions
    fn enabled_addresses(&self) -> Vec<Address>;

    /// Sign `tx` with the key of `from`, returning the raw RLP payload
    async fn sign(&self, from: Address, tx: &TypedTransaction) -> TxmResult<Bytes>;
}

/// In-process wallets loaded from the environment
pub struct LocalKeyStore {
    wallets: BTreeMap<Address, LocalWallet>,
}

impl LocalKeyStore {
    pub fn new(wallets: Vec<LocalWallet>, chain_id: u64) -> Self {
        let wallets = wallets
            .into_iter()
            .map(|w| {
                let w = w.with_chain_id(chain_id);
                (w.address(), w)
            })
            .collect();
        Self { wallets }
    }

    /// Load wallets from the named environment variables
    pub fn from_env(var_names: &[String], chain_id: u64) -> TxmResult<Self> {
        let mut wallets = Vec::with_capacity(var_names.len());

        for name in var_names {
            let key = std::env::var(name)
                .map_err(|_| TxmError::Signing(format!("Environment variable {} not set", name)))?;
            let wallet = key
                .trim()
                .parse::<LocalWallet>()
                .map_err(|e| TxmError::Signing(format!("Invalid private key in {}: {}", name, e)))?;
            info!("Loaded sending key {:?} from {}", wallet.address(), name);
            wallets.push(wallet);
        }

        Ok(Self::new(wallets, chain_id))
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    fn enabled_addresses(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }

    async fn sign(&self, from: Address, tx: &TypedTransaction) -> TxmResult<Bytes> {
        let wallet = self
            .wallets
            .get(&from)
            .ok_or_else(|| TxmError::UnknownKey(format!("{:?}", from)))?;

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| TxmError::Signing(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}
