//! Network descriptors and the registry built once at startup.
//!
//! A network is *known* when it appears in the built-in table, and *active*
//! when its settlement credentials are present in the environment. Only
//! active networks are advertised in 402 responses.

use std::env;

use alloy::primitives::U256;

use crate::constants::{PRICE_ATOMIC_DECIMALS, SOLANA_FACILITATOR_KEY_ENV};
use crate::error::PaymentError;

/// Chain family of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    Evm,
    Svm,
}

impl VmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VmKind::Evm => "evm",
            VmKind::Svm => "svm",
        }
    }
}

/// Settlement token deployed on a network.
#[derive(Debug, Clone)]
pub struct TokenDescriptor {
    /// Contract address (EVM) or mint address (SVM).
    pub address: String,
    /// EIP-712 domain `name` for EVM tokens.
    pub display_name: String,
    /// EIP-712 domain `version` for EVM tokens.
    pub domain_version: String,
    pub decimals: u32,
}

/// External settlement service owning verify/settle for an EVM network.
#[derive(Debug, Clone)]
pub struct FacilitatorDescriptor {
    pub url: String,
    /// Env var naming the Bearer API key.
    pub api_key_env: String,
    /// Network name the facilitator expects instead of the CAIP-2 id.
    pub network_alias: Option<String>,
    /// Contract advertised as `payTo` when settlement is delegated.
    pub facilitator_contract: Option<String>,
    /// x402 version the facilitator speaks, when pinned.
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NetworkDescriptor {
    pub vm: VmKind,
    /// CAIP-2 identifier, e.g. `eip155:8453` or `solana:<genesis>`.
    pub network_id: String,
    pub chain_id: Option<u64>,
    /// Env var naming the RPC endpoint.
    pub rpc_env: String,
    pub token: TokenDescriptor,
    pub facilitator: Option<FacilitatorDescriptor>,
}

impl NetworkDescriptor {
    /// Whether this network can currently settle payments.
    ///
    /// EVM-local needs its RPC endpoint; a facilitator network needs its API
    /// key (the gateway never dials that chain itself); SVM needs both the
    /// RPC endpoint and the co-signer key.
    pub fn is_active(&self) -> bool {
        fn set(var: &str) -> bool {
            env::var(var).map(|v| !v.is_empty()).unwrap_or(false)
        }
        match (self.vm, &self.facilitator) {
            (VmKind::Evm, Some(fac)) => set(&fac.api_key_env),
            (VmKind::Evm, None) => set(&self.rpc_env),
            (VmKind::Svm, _) => set(&self.rpc_env) && set(SOLANA_FACILITATOR_KEY_ENV),
        }
    }

    /// Resolve the RPC URL, naming the missing env var on failure.
    pub fn rpc_url(&self) -> Result<String, PaymentError> {
        env::var(&self.rpc_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PaymentError::ConfigError(format!("missing env var {}", self.rpc_env)))
    }
}

pub struct NetworkRegistry {
    networks: Vec<NetworkDescriptor>,
}

impl NetworkRegistry {
    /// Build the registry from the built-in table. Invoked once at startup;
    /// credential presence is re-read from the environment per request.
    pub fn from_env() -> Self {
        Self {
            networks: builtin_networks(),
        }
    }

    pub fn new(networks: Vec<NetworkDescriptor>) -> Self {
        Self { networks }
    }

    pub fn resolve(&self, network_id: &str) -> Option<&NetworkDescriptor> {
        self.networks.iter().find(|n| n.network_id == network_id)
    }

    pub fn active(&self) -> impl Iterator<Item = &NetworkDescriptor> {
        self.networks.iter().filter(|n| n.is_active())
    }

    pub fn all(&self) -> &[NetworkDescriptor] {
        &self.networks
    }
}

/// Scale a 6-decimal-reference atomic price to a token's native decimals.
///
/// `priceAtomic * 10^(decimals - 6)` when decimals exceed 6, unchanged
/// otherwise. Arbitrary-precision throughout.
pub fn scaled_amount(price_atomic: &str, decimals: u32) -> Result<U256, PaymentError> {
    let base: U256 = price_atomic
        .parse()
        .map_err(|_| PaymentError::ConfigError(format!("invalid atomic price '{price_atomic}'")))?;
    if decimals <= PRICE_ATOMIC_DECIMALS {
        return Ok(base);
    }
    let factor = U256::from(10u64).pow(U256::from(decimals - PRICE_ATOMIC_DECIMALS));
    base.checked_mul(factor)
        .ok_or_else(|| PaymentError::ConfigError(format!("atomic price '{price_atomic}' overflows")))
}

fn usdc(address: &str) -> TokenDescriptor {
    TokenDescriptor {
        address: address.to_string(),
        display_name: "USD Coin".to_string(),
        domain_version: "2".to_string(),
        decimals: 6,
    }
}

fn builtin_networks() -> Vec<NetworkDescriptor> {
    vec![
        NetworkDescriptor {
            vm: VmKind::Evm,
            network_id: "eip155:8453".to_string(),
            chain_id: Some(8453),
            rpc_env: "BASE_RPC_URL".to_string(),
            token: usdc("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            facilitator: None,
        },
        NetworkDescriptor {
            vm: VmKind::Evm,
            network_id: "eip155:84532".to_string(),
            chain_id: Some(84532),
            rpc_env: "BASE_SEPOLIA_RPC_URL".to_string(),
            token: TokenDescriptor {
                address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
                display_name: "USDC".to_string(),
                domain_version: "2".to_string(),
                decimals: 6,
            },
            facilitator: None,
        },
        // MegaETH testnet settles in an 18-decimal stable, exercising the
        // 6-to-18 amount scaling path.
        NetworkDescriptor {
            vm: VmKind::Evm,
            network_id: "eip155:6342".to_string(),
            chain_id: Some(6342),
            rpc_env: "MEGAETH_RPC_URL".to_string(),
            token: TokenDescriptor {
                address: "0x8D635c2Db76110F43301236B1d4e9cA99Bc4a3eF".to_string(),
                display_name: "MegaUSD".to_string(),
                domain_version: "1".to_string(),
                decimals: 18,
            },
            facilitator: None,
        },
        NetworkDescriptor {
            vm: VmKind::Evm,
            network_id: "eip155:43114".to_string(),
            chain_id: Some(43114),
            rpc_env: "AVALANCHE_RPC_URL".to_string(),
            token: usdc("0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"),
            facilitator: Some(FacilitatorDescriptor {
                url: "https://facilitator.x402.rs".to_string(),
                api_key_env: "AVALANCHE_FACILITATOR_API_KEY".to_string(),
                network_alias: Some("avalanche".to_string()),
                facilitator_contract: Some(
                    "0x6A000F20005980200259B80c5102003040001068".to_string(),
                ),
                protocol_version: Some(1),
            }),
        },
        NetworkDescriptor {
            vm: VmKind::Svm,
            network_id: "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdpKuc147dw2N9d".to_string(),
            chain_id: None,
            rpc_env: "SOLANA_RPC_URL".to_string(),
            token: TokenDescriptor {
                address: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
                display_name: "USDC".to_string(),
                domain_version: "1".to_string(),
                decimals: 6,
            },
            facilitator: None,
        },
        NetworkDescriptor {
            vm: VmKind::Svm,
            network_id: "solana:EtWTRABZaYq6iMfeYKouRu166VU2xqa1wcaWoxPkrZBG".to_string(),
            chain_id: None,
            rpc_env: "SOLANA_DEVNET_RPC_URL".to_string(),
            token: TokenDescriptor {
                address: "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU".to_string(),
                display_name: "USDC".to_string(),
                domain_version: "1".to_string(),
                decimals: 6,
            },
            facilitator: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_amount_six_decimals_unchanged() {
        assert_eq!(scaled_amount("10000", 6).unwrap(), U256::from(10_000u64));
    }

    #[test]
    fn test_scaled_amount_six_to_eighteen() {
        // priceAtomic 10000 at 18 decimals advertises 10^16.
        assert_eq!(
            scaled_amount("10000", 18).unwrap().to_string(),
            "10000000000000000"
        );
    }

    #[test]
    fn test_scaled_amount_fewer_decimals_unchanged() {
        assert_eq!(scaled_amount("10000", 2).unwrap(), U256::from(10_000u64));
    }

    #[test]
    fn test_scaled_amount_rejects_garbage() {
        assert!(scaled_amount("not-a-number", 6).is_err());
        assert!(scaled_amount("-5", 6).is_err());
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let registry = NetworkRegistry::from_env();
        assert!(registry.resolve("eip155:8453").is_some());
        assert!(registry.resolve("eip155:99999").is_none());
    }

    #[test]
    fn test_facilitator_network_activity_keyed_on_api_key() {
        let registry = NetworkRegistry::from_env();
        let avalanche = registry.resolve("eip155:43114").unwrap();
        let var = &avalanche.facilitator.as_ref().unwrap().api_key_env;
        std::env::remove_var(var);
        assert!(!avalanche.is_active());
        std::env::set_var(var, "test-key");
        assert!(avalanche.is_active());
        std::env::remove_var(var);
    }
}
