//! SVM settlement path: an in-process co-signing facilitator.
//!
//! Clients submit a partially-signed SPL-token transfer whose fee payer is
//! the gateway's co-signer. Verification is structural and offline; settling
//! adds the co-signature and submits the transaction.

use std::env;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::Transaction;
use tokio::sync::OnceCell;

use crate::constants::{SCHEME_EXACT, SOLANA_FACILITATOR_KEY_ENV};
use crate::error::PaymentError;
use crate::network::{scaled_amount, NetworkDescriptor};
use crate::payment::{PaymentPayload, SvmPayload};
use crate::response::{SettlementReceipt, VerifyOutcome};
use crate::route::RouteDescriptor;
use crate::scheme::ChainAdapter;

/// Process-wide co-signer, initialized on first use.
///
/// `OnceCell` gives single-flight semantics: a storm of first requests shares
/// one in-flight initialization and all observe the same keypair; later
/// callers are lock-free reads.
pub struct SvmSigner {
    cell: OnceCell<Arc<Keypair>>,
}

impl SvmSigner {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub async fn keypair(&self) -> Result<Arc<Keypair>, PaymentError> {
        self.cell
            .get_or_try_init(|| async {
                let raw = env::var(SOLANA_FACILITATOR_KEY_ENV)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        PaymentError::ConfigError(format!(
                            "missing env var {SOLANA_FACILITATOR_KEY_ENV}"
                        ))
                    })?;
                let bytes = bs58::decode(raw.trim()).into_vec().map_err(|e| {
                    PaymentError::ConfigError(format!(
                        "invalid {SOLANA_FACILITATOR_KEY_ENV}: {e}"
                    ))
                })?;
                let keypair = Keypair::try_from(bytes.as_slice()).map_err(|e| {
                    PaymentError::ConfigError(format!(
                        "invalid {SOLANA_FACILITATOR_KEY_ENV}: {e}"
                    ))
                })?;
                tracing::info!(fee_payer = %keypair.pubkey(), "SVM co-signer initialized");
                Ok(Arc::new(keypair))
            })
            .await
            .cloned()
    }

    /// Co-signer address advertised as `feePayer` in 402 responses.
    pub async fn fee_payer(&self) -> Result<String, PaymentError> {
        Ok(self.keypair().await?.pubkey().to_string())
    }
}

impl Default for SvmSigner {
    fn default() -> Self {
        Self::new()
    }
}

/// The SPL-token transfer found inside a client transaction.
struct TransferDetails {
    amount: u64,
    mint: Pubkey,
    destination: Pubkey,
    authority: Pubkey,
}

pub struct SvmFacilitatorAdapter {
    signer: Arc<SvmSigner>,
    clients: DashMap<String, Arc<RpcClient>>,
}

impl SvmFacilitatorAdapter {
    pub fn new(signer: Arc<SvmSigner>) -> Self {
        Self {
            signer,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, network: &NetworkDescriptor) -> Result<Arc<RpcClient>, PaymentError> {
        if let Some(client) = self.clients.get(&network.network_id) {
            return Ok(client.clone());
        }
        let client = Arc::new(RpcClient::new(network.rpc_url()?));
        self.clients.insert(network.network_id.clone(), client.clone());
        Ok(client)
    }

    fn decode_transaction(body: &SvmPayload) -> Result<(Vec<u8>, Transaction), PaymentError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body.transaction.trim())
            .map_err(|e| {
                PaymentError::VerificationFailed(format!("Malformed transaction encoding: {e}"))
            })?;
        let transaction: Transaction = bincode::deserialize(&bytes).map_err(|e| {
            PaymentError::VerificationFailed(format!("Malformed transaction: {e}"))
        })?;
        Ok((bytes, transaction))
    }

    /// Locate the SPL-token `TransferChecked` instruction.
    fn find_transfer(transaction: &Transaction) -> Option<TransferDetails> {
        let keys = &transaction.message.account_keys;
        for instruction in &transaction.message.instructions {
            let program = keys.get(instruction.program_id_index as usize)?;
            if *program != spl_token::id() {
                continue;
            }
            let Ok(spl_token::instruction::TokenInstruction::TransferChecked { amount, .. }) =
                spl_token::instruction::TokenInstruction::unpack(&instruction.data)
            else {
                continue;
            };
            // TransferChecked accounts: [source, mint, destination, authority].
            let account = |i: usize| -> Option<Pubkey> {
                keys.get(*instruction.accounts.get(i)? as usize).copied()
            };
            return Some(TransferDetails {
                amount,
                mint: account(1)?,
                destination: account(2)?,
                authority: account(3)?,
            });
        }
        None
    }
}

#[async_trait]
impl ChainAdapter for SvmFacilitatorAdapter {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<VerifyOutcome, PaymentError> {
        let Some(body) = SvmPayload::from_value(&payload.payload) else {
            return Ok(VerifyOutcome::invalid("Missing transaction"));
        };
        if payload.scheme != SCHEME_EXACT {
            return Ok(VerifyOutcome::invalid(format!(
                "Unsupported scheme: {}",
                payload.scheme
            )));
        }

        let (_, transaction) = match Self::decode_transaction(&body) {
            Ok(decoded) => decoded,
            Err(e) => return Ok(VerifyOutcome::invalid(e.to_string())),
        };

        let keypair = self.signer.keypair().await?;
        let fee_payer = transaction.message.account_keys.first().copied();
        if fee_payer != Some(keypair.pubkey()) {
            return Ok(VerifyOutcome::invalid(
                "Transaction fee payer is not the gateway co-signer",
            ));
        }

        let Some(transfer) = Self::find_transfer(&transaction) else {
            return Ok(VerifyOutcome::invalid("No token transfer in transaction"));
        };
        let payer = transfer.authority.to_string();

        let mint = Pubkey::from_str(&network.token.address).map_err(|_| {
            PaymentError::ConfigError(format!("invalid mint address {}", network.token.address))
        })?;
        if transfer.mint != mint {
            return Ok(VerifyOutcome::invalid_with_payer(
                format!("Token mint mismatch: transfer moves {}", transfer.mint),
                payer,
            ));
        }

        let Some(pay_to_sol) = route.pay_to_sol.as_deref() else {
            return Ok(VerifyOutcome::invalid(format!(
                "No SVM recipient configured for route {}",
                route.key
            )));
        };
        let recipient = Pubkey::from_str(pay_to_sol).map_err(|_| {
            PaymentError::ConfigError(format!("invalid SVM recipient {pay_to_sol}"))
        })?;
        let expected_destination =
            spl_associated_token_account::get_associated_token_address(&recipient, &mint);
        if transfer.destination != expected_destination {
            return Ok(VerifyOutcome::invalid_with_payer(
                format!("Recipient mismatch: transfer pays {}", transfer.destination),
                payer,
            ));
        }

        let required = scaled_amount(&route.price_atomic, network.token.decimals)?;
        let required: u64 = required.try_into().map_err(|_| {
            PaymentError::ConfigError(format!("required amount {required} exceeds u64"))
        })?;
        if transfer.amount < required {
            return Ok(VerifyOutcome::invalid_with_payer(
                format!(
                    "Payment amount below required: authorized {}, required {required}",
                    transfer.amount
                ),
                payer,
            ));
        }

        // The client must have signed; the fee-payer slot stays empty until
        // settlement co-signs it.
        let signature_checks = transaction.verify_with_results();
        if transaction.message.header.num_required_signatures < 2
            || !signature_checks.iter().skip(1).all(|ok| *ok)
        {
            return Ok(VerifyOutcome::invalid_with_payer(
                "Missing or invalid client signature",
                payer,
            ));
        }

        tracing::info!(payer = %payer, amount = transfer.amount, "SVM payment verification succeeded");
        Ok(VerifyOutcome::valid(payer))
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        _route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<SettlementReceipt, PaymentError> {
        let body = SvmPayload::from_value(&payload.payload)
            .ok_or_else(|| PaymentError::SettlementFailed("missing transaction".to_string()))?;
        let (_, mut transaction) = Self::decode_transaction(&body)
            .map_err(|e| PaymentError::SettlementFailed(e.to_string()))?;
        let payer = Self::find_transfer(&transaction).map(|t| t.authority.to_string());

        let keypair = self.signer.keypair().await?;
        let blockhash = transaction.message.recent_blockhash;
        transaction
            .try_partial_sign(&[keypair.as_ref()], blockhash)
            .map_err(|e| PaymentError::SettlementFailed(format!("co-signing failed: {e}")))?;

        let client = self.client_for(network)?;
        let signature = client
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| {
                PaymentError::SettlementFailed(format!("transaction submission failed: {e}"))
            })?;

        tracing::info!(tx = %signature, payer = ?payer, "SVM payment settled");
        Ok(SettlementReceipt {
            tx_hash: signature.to_string(),
            network: network.network_id.clone(),
            block_number: None,
            payer,
            facilitator: None,
        })
    }

    /// The replay key is the hash of the exact transaction bytes: a retry
    /// that resubmits the identical partial transaction is blocked locally.
    fn derive_nonce_key(&self, payload: &PaymentPayload) -> Option<String> {
        let body = SvmPayload::from_value(&payload.payload)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body.transaction.trim())
            .ok()?;
        let digest = Sha256::digest(&bytes);
        Some(format!("svm:{}", alloy::hex::encode(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::message::Message;
    use std::sync::OnceLock;

    const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    /// One facilitator keypair for the whole test process; its base58 bytes
    /// are what `SOLANA_FACILITATOR_PRIVATE_KEY` holds in production.
    fn facilitator_keypair() -> &'static Keypair {
        static KEYPAIR: OnceLock<Keypair> = OnceLock::new();
        KEYPAIR.get_or_init(|| {
            let keypair = Keypair::new();
            std::env::set_var(
                SOLANA_FACILITATOR_KEY_ENV,
                bs58::encode(keypair.to_bytes()).into_string(),
            );
            std::env::set_var("SVM_ADAPTER_TEST_RPC", "http://127.0.0.1:1");
            keypair
        })
    }

    fn network() -> NetworkDescriptor {
        use crate::network::{TokenDescriptor, VmKind};
        NetworkDescriptor {
            vm: VmKind::Svm,
            network_id: "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdpKuc147dw2N9d".to_string(),
            chain_id: None,
            rpc_env: "SVM_ADAPTER_TEST_RPC".to_string(),
            token: TokenDescriptor {
                address: USDC_MINT.to_string(),
                display_name: "USDC".to_string(),
                domain_version: "1".to_string(),
                decimals: 6,
            },
            facilitator: None,
        }
    }

    fn route(recipient: &Pubkey) -> RouteDescriptor {
        RouteDescriptor {
            key: "myapi".to_string(),
            path: "/v1/myapi".to_string(),
            backend_name: "myapi".to_string(),
            backend_url: "http://127.0.0.1:9/api".to_string(),
            backend_api_key_env: "MYAPI_BACKEND_API_KEY".to_string(),
            backend_api_key_header: "x-api-key".to_string(),
            price: "$0.01".to_string(),
            price_atomic: "10000".to_string(),
            pay_to: None,
            pay_to_sol: Some(recipient.to_string()),
            description: "test".to_string(),
            mime_type: "application/json".to_string(),
        }
    }

    /// Client-partially-signed transfer of `amount` to `recipient`, with the
    /// facilitator as fee payer, encoded the way clients submit it.
    fn client_transaction(client: &Keypair, recipient: &Pubkey, amount: u64) -> String {
        let mint = Pubkey::from_str(USDC_MINT).unwrap();
        let source =
            spl_associated_token_account::get_associated_token_address(&client.pubkey(), &mint);
        let destination =
            spl_associated_token_account::get_associated_token_address(recipient, &mint);
        let instruction = spl_token::instruction::transfer_checked(
            &spl_token::id(),
            &source,
            &mint,
            &destination,
            &client.pubkey(),
            &[],
            amount,
            6,
        )
        .unwrap();

        let blockhash = Hash::new_unique();
        let message = Message::new_with_blockhash(
            &[instruction],
            Some(&facilitator_keypair().pubkey()),
            &blockhash,
        );
        let mut transaction = Transaction::new_unsigned(message);
        transaction.try_partial_sign(&[client], blockhash).unwrap();

        base64::engine::general_purpose::STANDARD
            .encode(bincode::serialize(&transaction).unwrap())
    }

    fn payload(transaction: String) -> PaymentPayload {
        PaymentPayload {
            x402_version: 2,
            scheme: SCHEME_EXACT.to_string(),
            network: network().network_id,
            payload: serde_json::json!({ "transaction": transaction }),
            extensions: None,
        }
    }

    #[tokio::test]
    async fn test_verify_accepts_well_formed_transfer() {
        let _ = facilitator_keypair();
        let client = Keypair::new();
        let recipient = Keypair::new().pubkey();
        let adapter = SvmFacilitatorAdapter::new(Arc::new(SvmSigner::new()));

        let outcome = adapter
            .verify(
                &payload(client_transaction(&client, &recipient, 10_000)),
                &route(&recipient),
                &network(),
            )
            .await
            .unwrap();
        assert!(outcome.is_valid, "{:?}", outcome.invalid_reason);
        assert_eq!(outcome.payer.as_deref(), Some(client.pubkey().to_string().as_str()));
    }

    #[tokio::test]
    async fn test_verify_rejects_underpayment() {
        let _ = facilitator_keypair();
        let client = Keypair::new();
        let recipient = Keypair::new().pubkey();
        let adapter = SvmFacilitatorAdapter::new(Arc::new(SvmSigner::new()));

        let outcome = adapter
            .verify(
                &payload(client_transaction(&client, &recipient, 9_999)),
                &route(&recipient),
                &network(),
            )
            .await
            .unwrap();
        assert!(!outcome.is_valid);
        assert!(outcome
            .invalid_reason
            .unwrap()
            .contains("Payment amount below required"));
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_recipient() {
        let _ = facilitator_keypair();
        let client = Keypair::new();
        let recipient = Keypair::new().pubkey();
        let other = Keypair::new().pubkey();
        let adapter = SvmFacilitatorAdapter::new(Arc::new(SvmSigner::new()));

        let outcome = adapter
            .verify(
                &payload(client_transaction(&client, &other, 10_000)),
                &route(&recipient),
                &network(),
            )
            .await
            .unwrap();
        assert!(!outcome.is_valid);
        assert!(outcome.invalid_reason.unwrap().contains("Recipient mismatch"));
    }

    #[tokio::test]
    async fn test_verify_rejects_foreign_fee_payer() {
        let _ = facilitator_keypair();
        let client = Keypair::new();
        let recipient = Keypair::new().pubkey();
        let adapter = SvmFacilitatorAdapter::new(Arc::new(SvmSigner::new()));

        // Build a transaction whose fee payer is the client, not the gateway.
        let mint = Pubkey::from_str(USDC_MINT).unwrap();
        let destination =
            spl_associated_token_account::get_associated_token_address(&recipient, &mint);
        let source =
            spl_associated_token_account::get_associated_token_address(&client.pubkey(), &mint);
        let instruction = spl_token::instruction::transfer_checked(
            &spl_token::id(),
            &source,
            &mint,
            &destination,
            &client.pubkey(),
            &[],
            10_000,
            6,
        )
        .unwrap();
        let blockhash = Hash::new_unique();
        let message =
            Message::new_with_blockhash(&[instruction], Some(&client.pubkey()), &blockhash);
        let mut transaction = Transaction::new_unsigned(message);
        transaction.try_partial_sign(&[&client], blockhash).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(bincode::serialize(&transaction).unwrap());

        let outcome = adapter
            .verify(&payload(encoded), &route(&recipient), &network())
            .await
            .unwrap();
        assert!(!outcome.is_valid);
        assert!(outcome.invalid_reason.unwrap().contains("fee payer"));
    }

    #[tokio::test]
    async fn test_verify_rejects_garbage_transaction() {
        let _ = facilitator_keypair();
        let recipient = Keypair::new().pubkey();
        let adapter = SvmFacilitatorAdapter::new(Arc::new(SvmSigner::new()));

        let outcome = adapter
            .verify(&payload("!!!not-base64!!!".to_string()), &route(&recipient), &network())
            .await
            .unwrap();
        assert!(!outcome.is_valid);
        assert!(outcome
            .invalid_reason
            .unwrap()
            .contains("Malformed transaction"));
    }

    #[tokio::test]
    async fn test_nonce_key_is_stable_hash_of_bytes() {
        let _ = facilitator_keypair();
        let client = Keypair::new();
        let recipient = Keypair::new().pubkey();
        let adapter = SvmFacilitatorAdapter::new(Arc::new(SvmSigner::new()));

        let encoded = client_transaction(&client, &recipient, 10_000);
        let key_a = adapter.derive_nonce_key(&payload(encoded.clone())).unwrap();
        let key_b = adapter.derive_nonce_key(&payload(encoded)).unwrap();
        assert_eq!(key_a, key_b);
        assert!(key_a.starts_with("svm:"));
        assert_eq!(key_a.len(), 4 + 64);
    }

    #[tokio::test]
    async fn test_single_flight_signer_shares_one_keypair() {
        let _ = facilitator_keypair();
        let signer = Arc::new(SvmSigner::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let signer = signer.clone();
            handles.push(tokio::spawn(async move {
                signer.fee_payer().await.unwrap()
            }));
        }
        let mut addresses = Vec::new();
        for handle in handles {
            addresses.push(handle.await.unwrap());
        }
        addresses.dedup();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0], facilitator_keypair().pubkey().to_string());
    }
}
