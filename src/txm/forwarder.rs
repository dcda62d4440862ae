//! Routing of transactions through forwarding contracts

use crate::config::ForwarderConfig;

use alloy_sol_types::{sol, SolCall};
use ethers::types::{Address, Bytes};
use std::collections::HashMap;

sol! {
    function forward(address to, bytes data);
}

/// Mapping from sending key to forwarding contract
#[cfg_attr(test, mockall::automock)]
pub trait ForwarderRegistry: Send + Sync {
    fn forwarder_for(&self, from: Address) -> Option<Address>;
}

/// Forwarders fixed at startup from configuration
#[derive(Debug, Default)]
pub struct StaticForwarders {
    forwarders: HashMap<Address, Address>,
}

impl StaticForwarders {
    pub fn new(pairs: impl IntoIterator<Item = (Address, Address)>) -> Self {
        Self {
            forwarders: pairs.into_iter().collect(),
        }
    }

    pub fn from_config(config: &[ForwarderConfig]) -> Self {
        Self::new(config.iter().map(|f| (f.from, f.forwarder)))
    }
}

impl ForwarderRegistry for StaticForwarders {
    fn forwarder_for(&self, from: Address) -> Option<Address> {
        self.forwarders.get(&from).copied()
    }
}

/// Calldata for `forward(to, data)`
pub fn encode_forward(to: Address, data: &Bytes) -> Bytes {
    let call = forwardCall {
        to: alloy_primitives::Address::from(to.0),
        data: alloy_primitives::Bytes::from(data.to_vec()),
    };
    Bytes::from(call.abi_encode())
}

/// Destination and calldata for a transaction, routed through the sender's
/// forwarder when it has one
pub fn route(
    registry: Option<&dyn ForwarderRegistry>,
    from: Address,
    to: Address,
    data: &Bytes,
) -> (Address, Bytes) {
    match registry.and_then(|r| r.forwarder_for(from)) {
        Some(forwarder) => (forwarder, encode_forward(to, data)),
        None => (to, data.clone()),
    }
}
