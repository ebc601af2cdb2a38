//! EVM-local settlement path: the gateway verifies the EIP-3009 authorization
//! itself and broadcasts `transferWithAuthorization` from its own wallet.

use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::constants::{SCHEME_EXACT, SETTLEMENT_KEY_ENV};
use crate::eip712::{decode_signature_hex, recover_signer, split_signature};
use crate::erc3009;
use crate::error::PaymentError;
use crate::network::{scaled_amount, NetworkDescriptor};
use crate::nonce::NonceCoordinator;
use crate::payment::{ExactEvmPayload, PaymentPayload};
use crate::response::{SettlementReceipt, VerifyOutcome};
use crate::route::RouteDescriptor;
use crate::scheme::ChainAdapter;
use crate::TransferWithAuthorization;

pub struct EvmLocalAdapter {
    nonces: NonceCoordinator,
    /// Wallet-backed RPC clients, one per chain, built lazily and shared
    /// across requests.
    providers: DashMap<u64, DynProvider>,
}

impl EvmLocalAdapter {
    pub fn new(nonces: NonceCoordinator) -> Self {
        Self {
            nonces,
            providers: DashMap::new(),
        }
    }

    fn provider_for(&self, network: &NetworkDescriptor) -> Result<DynProvider, PaymentError> {
        let chain_id = network.chain_id.ok_or_else(|| {
            PaymentError::ConfigError(format!("network {} has no chain id", network.network_id))
        })?;
        if let Some(provider) = self.providers.get(&chain_id) {
            return Ok(provider.clone());
        }

        let rpc_url = network.rpc_url()?;
        let key = env::var(SETTLEMENT_KEY_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                PaymentError::ConfigError(format!("missing env var {SETTLEMENT_KEY_ENV}"))
            })?;
        let signer: PrivateKeySigner = key
            .parse()
            .map_err(|_| PaymentError::ConfigError(format!("invalid {SETTLEMENT_KEY_ENV}")))?;
        let url = rpc_url
            .parse()
            .map_err(|_| PaymentError::ConfigError(format!("invalid URL in {}", network.rpc_env)))?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        self.providers.insert(chain_id, provider.clone());
        Ok(provider)
    }

    fn authorization_struct(
        body: &ExactEvmPayload,
        value: U256,
    ) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: body.authorization.from,
            to: body.authorization.to,
            value,
            validAfter: U256::from(body.authorization.valid_after),
            validBefore: U256::from(body.authorization.valid_before),
            nonce: body.authorization.nonce,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl ChainAdapter for EvmLocalAdapter {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<VerifyOutcome, PaymentError> {
        // 1. Authorization and signature present.
        let Some(body) = ExactEvmPayload::from_value(&payload.payload) else {
            return Ok(VerifyOutcome::invalid("Missing authorization or signature"));
        };
        let auth = &body.authorization;
        let payer = format!("{:#x}", auth.from);

        // 2. Scheme.
        if payload.scheme != SCHEME_EXACT {
            return Ok(VerifyOutcome::invalid(format!(
                "Unsupported scheme: {}",
                payload.scheme
            )));
        }

        // 3. Authorized value covers the scaled price.
        let value = match auth.value.parse::<U256>() {
            Ok(v) => v,
            Err(_) => {
                return Ok(VerifyOutcome::invalid_with_payer(
                    format!("Invalid authorization value '{}'", auth.value),
                    payer,
                ))
            }
        };
        let required = scaled_amount(&route.price_atomic, network.token.decimals)?;
        if value < required {
            return Ok(VerifyOutcome::invalid_with_payer(
                format!("Payment amount below required: authorized {value}, required {required}"),
                payer,
            ));
        }

        // 4. Recipient matches the route.
        let Some(pay_to) = route.pay_to.as_deref() else {
            return Ok(VerifyOutcome::invalid(format!(
                "No EVM recipient configured for route {}",
                route.key
            )));
        };
        if format!("{:#x}", auth.to).to_lowercase() != pay_to.to_lowercase() {
            return Ok(VerifyOutcome::invalid_with_payer(
                format!("Recipient mismatch: authorization pays {:#x}", auth.to),
                payer,
            ));
        }

        // 5. Time window (inclusive on both ends).
        let now = unix_now();
        if now < auth.valid_after {
            return Ok(VerifyOutcome::invalid_with_payer(
                "Authorization not yet valid",
                payer,
            ));
        }
        if now > auth.valid_before {
            return Ok(VerifyOutcome::invalid_with_payer(
                "Authorization expired",
                payer,
            ));
        }

        // 6. Nonce replay.
        let nonce_id = auth.nonce.to_string();
        if let Some(record) = self.nonces.get(&nonce_id).await {
            tracing::warn!(nonce = %nonce_id, payer = %payer, "replayed nonce rejected");
            return Ok(VerifyOutcome::invalid_with_payer(
                format!("Nonce already used (status {:?})", record.status),
                payer,
            ));
        }

        // 7. EIP-712 signature recovers the payer.
        let sig_bytes = match decode_signature_hex(&body.signature) {
            Ok(b) => b,
            Err(e) => return Ok(VerifyOutcome::invalid_with_payer(e.to_string(), payer)),
        };
        let typed = Self::authorization_struct(&body, value);
        match recover_signer(&typed, &sig_bytes, network) {
            Ok(recovered) if recovered == auth.from => {}
            Ok(_) => {
                return Ok(VerifyOutcome::invalid_with_payer("Invalid signature", payer));
            }
            Err(e) => return Ok(VerifyOutcome::invalid_with_payer(e.to_string(), payer)),
        }

        // 8. On-chain balance. An RPC failure is non-fatal: transient outages
        // must not produce false 402s, and settlement is the real authority.
        let provider = self.provider_for(network)?;
        let token: Address = network.token.address.parse().map_err(|_| {
            PaymentError::ConfigError(format!("invalid token address {}", network.token.address))
        })?;
        match erc3009::balance_of(&provider, token, auth.from).await {
            Ok(balance) if balance < required => {
                return Ok(VerifyOutcome::invalid_with_payer(
                    format!("Insufficient balance: have {balance}, need {required}"),
                    payer,
                ));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(payer = %payer, error = %e, "balance check unavailable, continuing");
            }
        }

        tracing::info!(payer = %payer, amount = %value, nonce = %nonce_id, "payment verification succeeded");
        Ok(VerifyOutcome::valid(payer))
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        _route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<SettlementReceipt, PaymentError> {
        let body = ExactEvmPayload::from_value(&payload.payload).ok_or_else(|| {
            PaymentError::SettlementFailed("missing authorization or signature".to_string())
        })?;
        let auth = &body.authorization;
        let value = auth
            .value
            .parse::<U256>()
            .map_err(|_| PaymentError::SettlementFailed("invalid authorization value".to_string()))?;

        let provider = self.provider_for(network)?;
        let token: Address = network.token.address.parse().map_err(|_| {
            PaymentError::ConfigError(format!("invalid token address {}", network.token.address))
        })?;
        let sig_bytes = decode_signature_hex(&body.signature)?;
        let (v, r, s) = split_signature(&sig_bytes)?;

        let settled = erc3009::transfer_with_authorization(
            &provider,
            token,
            auth.from,
            auth.to,
            value,
            U256::from(auth.valid_after),
            U256::from(auth.valid_before),
            auth.nonce,
            v,
            r,
            s,
        )
        .await?;

        tracing::info!(
            payer = %format!("{:#x}", auth.from),
            amount = %value,
            tx = %settled.tx_hash,
            "payment settled on-chain"
        );

        Ok(SettlementReceipt {
            tx_hash: settled.tx_hash.to_string(),
            network: network.network_id.clone(),
            block_number: settled.block_number,
            payer: Some(format!("{:#x}", auth.from)),
            facilitator: None,
        })
    }

    fn derive_nonce_key(&self, payload: &PaymentPayload) -> Option<String> {
        ExactEvmPayload::from_value(&payload.payload).map(|body| body.authorization.nonce.to_string())
    }
}
