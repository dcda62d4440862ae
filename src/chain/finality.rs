//! Finality depths for well-known networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: L1 finality, soft-final after L1 inclusion
//! - Avalanche: Instant finality (1 block)

/// Get recommended finality depth for a chain
pub fn recommended_finality_depth(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local dev chains
        1337 | 31337 => 1,
        // Default conservative
        _ => 64,
    }
}
