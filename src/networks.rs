// src/networks.rs
//
// Built-in network registry. Profiles are immutable configuration loaded
// once; consumers can replace or extend the table with their own profiles.

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::multicall::default_aggregation_address;

/// Immutable per-network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// Stable key ("ethereum", "polygon", ...).
    pub key: String,
    /// Display name for logs and reports.
    pub name: String,
    pub chain_id: u64,
    /// Asset registry contract: serves `getReservesList()` and the 15-word
    /// `getReserveData(address)` struct.
    pub registry: Address,
    /// Market-data provider contract: serves the 12-word
    /// `getReserveData(address)` struct with supply/borrow totals.
    pub data_provider: Address,
    /// Primary RPC endpoint.
    pub rpc: String,
    /// Ordered fallback RPC endpoints.
    pub rpc_fallback: Vec<String>,
    /// Aggregation helper contract, when deployed on this network.
    pub aggregation_contract: Option<Address>,
    pub active: bool,
}

impl NetworkProfile {
    /// Primary plus fallbacks, in preference order.
    pub fn all_endpoints(&self) -> Vec<String> {
        let mut endpoints = Vec::with_capacity(1 + self.rpc_fallback.len());
        endpoints.push(self.rpc.clone());
        endpoints.extend(self.rpc_fallback.iter().cloned());
        endpoints
    }
}

fn profile(
    key: &str,
    name: &str,
    chain_id: u64,
    registry: &str,
    data_provider: &str,
    rpc: &str,
    fallbacks: &[&str],
    active: bool,
) -> NetworkProfile {
    NetworkProfile {
        key: key.to_string(),
        name: name.to_string(),
        chain_id,
        registry: registry.parse().expect("valid registry address"),
        data_provider: data_provider.parse().expect("valid data provider address"),
        rpc: rpc.to_string(),
        rpc_fallback: fallbacks.iter().map(|s| s.to_string()).collect(),
        aggregation_contract: Some(default_aggregation_address()),
        active,
    }
}

/// The curated built-in network table.
pub fn builtin_networks() -> Vec<NetworkProfile> {
    vec![
        profile(
            "ethereum",
            "Ethereum Mainnet",
            1,
            "0x87870Bca3F3fD6335C3F4ce8392D69350B4fA4E2",
            "0x7B4EB56E7CD4b454BA8ff71E4518426369a138a3",
            "https://ethereum.publicnode.com",
            &[
                "https://eth-mainnet.public.blastapi.io",
                "https://eth.drpc.org",
                "https://eth.llamarpc.com",
                "https://1rpc.io/eth",
            ],
            true,
        ),
        profile(
            "polygon",
            "Polygon",
            137,
            "0x794a61358D6845594F94dc1DB02A252b5b4814aD",
            "0x69FA688f1Dc47d4B5d8029D5a35FB7a548310654",
            "https://polygon-bor.publicnode.com",
            &[
                "https://polygon-mainnet.public.blastapi.io",
                "https://polygon.drpc.org",
                "https://1rpc.io/matic",
            ],
            true,
        ),
        profile(
            "arbitrum",
            "Arbitrum One",
            42161,
            "0x794a61358D6845594F94dc1DB02A252b5b4814aD",
            "0x69FA688f1Dc47d4B5d8029D5a35FB7a548310654",
            "https://arbitrum-one.publicnode.com",
            &[
                "https://arbitrum-one.public.blastapi.io",
                "https://arbitrum.drpc.org",
                "https://1rpc.io/arb",
            ],
            true,
        ),
        profile(
            "optimism",
            "Optimism",
            10,
            "0x794a61358D6845594F94dc1DB02A252b5b4814aD",
            "0x69FA688f1Dc47d4B5d8029D5a35FB7a548310654",
            "https://optimism.publicnode.com",
            &[
                "https://optimism-mainnet.public.blastapi.io",
                "https://optimism.drpc.org",
                "https://1rpc.io/op",
            ],
            true,
        ),
        profile(
            "avalanche",
            "Avalanche C-Chain",
            43114,
            "0x794a61358D6845594F94dc1DB02A252b5b4814aD",
            "0x69FA688f1Dc47d4B5d8029D5a35FB7a548310654",
            "https://avalanche-evm.publicnode.com",
            &[
                "https://ava-mainnet.public.blastapi.io/ext/bc/C/rpc",
                "https://avalanche.drpc.org",
                "https://1rpc.io/avax/c",
            ],
            true,
        ),
        profile(
            "base",
            "Base",
            8453,
            "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5",
            "0x2d8A3C5677189723C4cB8873CfC9C8976FDF38Ac",
            "https://base.publicnode.com",
            &[
                "https://base-mainnet.public.blastapi.io",
                "https://base.drpc.org",
                "https://1rpc.io/base",
            ],
            true,
        ),
        profile(
            "bnb",
            "BNB Smart Chain",
            56,
            "0x6807dc923806fE8Fd134338EABCA509979a7e0cB",
            "0x41393e5e337606dc3821075Af65AeE84D7688CBD",
            "https://bsc.publicnode.com",
            &[
                "https://bsc-mainnet.public.blastapi.io",
                "https://bsc.drpc.org",
                "https://1rpc.io/bnb",
            ],
            true,
        ),
        profile(
            "gnosis",
            "Gnosis Chain",
            100,
            "0xb50201558B00496A145fE76f7424749556E326D8",
            "0x501B4c19dd9C2e06E94dA7b6D5Ed4ddA013EC741",
            "https://gnosis.publicnode.com",
            &[
                "https://gnosis-mainnet.public.blastapi.io",
                "https://gnosis.drpc.org",
            ],
            true,
        ),
        profile(
            "scroll",
            "Scroll",
            534352,
            "0x11fCfe756c05AD438e312a7fd934381537D3cFfe",
            "0xa99F4E69acF23C6838DE90dD1B5c02EA928A53ee",
            "https://scroll-rpc.publicnode.com",
            &[
                "https://scroll-mainnet.public.blastapi.io",
                "https://scroll.drpc.org",
            ],
            true,
        ),
        profile(
            "metis",
            "Metis Andromeda",
            1088,
            "0x90df02551bB792286e8D4f13E0e357b4Bf1D6a57",
            "0x99411FC17Ad1B56f49719E3850B2CDcc0f9bBFd8",
            "https://metis-rpc.publicnode.com",
            &["https://andromeda.metis.io/?owner=1088"],
            true,
        ),
        profile(
            "celo",
            "Celo",
            42220,
            "0x3E59A31363E2ad014dcbc521c4a0d5757d9f3402",
            "0x2e0f8D3B1631296cC7c56538D6Eb6032601E15ED",
            "https://celo-rpc.publicnode.com",
            &["https://forno.celo.org", "https://1rpc.io/celo"],
            true,
        ),
        profile(
            "linea",
            "Linea",
            59144,
            "0xc47b8C00b0f69a36fa203Ffeac0334874574a8Ac",
            "0x47cd4b507B81cB831669c71c7077f4daF6762FF4",
            "https://linea-rpc.publicnode.com",
            &["https://rpc.linea.build", "https://1rpc.io/linea"],
            true,
        ),
        profile(
            "zksync",
            "zkSync Era",
            324,
            "0x4d9429246EA989C9CeE203B43F6d1C7D83e3B8F8",
            "0x7deA671A409f4a95E9b1C84b3C7292F1B8562B7A",
            "https://mainnet.era.zksync.io",
            &["https://zksync.drpc.org", "https://1rpc.io/zksync2-era"],
            true,
        ),
    ]
}

/// Built-in networks with the `active` flag set.
pub fn active_networks() -> Vec<NetworkProfile> {
    builtin_networks().into_iter().filter(|n| n.active).collect()
}

/// Looks up a built-in profile by its stable key.
pub fn network_by_key(key: &str) -> Option<NetworkProfile> {
    builtin_networks().into_iter().find(|n| n.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_is_well_formed() {
        let networks = builtin_networks();
        assert!(networks.len() >= 10);
        for network in &networks {
            assert!(!network.key.is_empty());
            assert!(network.chain_id > 0);
            assert!(network.rpc.starts_with("https://"));
            assert_ne!(network.registry, Address::zero());
            assert_ne!(network.data_provider, Address::zero());
        }
    }

    #[test]
    fn test_all_endpoints_order() {
        let eth = network_by_key("ethereum").unwrap();
        let endpoints = eth.all_endpoints();
        assert_eq!(endpoints[0], eth.rpc);
        assert_eq!(endpoints.len(), 1 + eth.rpc_fallback.len());
    }

    #[test]
    fn test_active_filter() {
        assert!(active_networks().iter().all(|n| n.active));
    }
}
