//! EVM-facilitator settlement path: verification and settlement are both
//! delegated to an external facilitator over HTTP. The facilitator owns
//! replay protection, so this path derives no gateway-side nonce key.

use std::env;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::constants::{MAX_TIMEOUT_SECONDS, SCHEME_EXACT};
use crate::error::PaymentError;
use crate::network::{scaled_amount, FacilitatorDescriptor, NetworkDescriptor};
use crate::payment::PaymentPayload;
use crate::response::{SettlementReceipt, VerifyOutcome};
use crate::route::RouteDescriptor;
use crate::scheme::ChainAdapter;

pub struct EvmFacilitatorAdapter {
    http: reqwest::Client,
}

impl EvmFacilitatorAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn descriptor<'a>(
        network: &'a NetworkDescriptor,
    ) -> Result<&'a FacilitatorDescriptor, PaymentError> {
        network.facilitator.as_ref().ok_or_else(|| {
            PaymentError::ConfigError(format!(
                "network {} has no facilitator configured",
                network.network_id
            ))
        })
    }

    fn api_key(fac: &FacilitatorDescriptor) -> Result<String, PaymentError> {
        env::var(&fac.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PaymentError::ConfigError(format!("missing env var {}", fac.api_key_env)))
    }

    /// Request body shared by `/verify` and `/settle`.
    fn request_body(
        payload: &PaymentPayload,
        route: &RouteDescriptor,
        network: &NetworkDescriptor,
        fac: &FacilitatorDescriptor,
    ) -> Result<Value, PaymentError> {
        let alias = fac
            .network_alias
            .clone()
            .unwrap_or_else(|| payload.network.clone());
        // protocolVersion pin wins; otherwise echo the client's version
        // (which itself defaults to the gateway's).
        let version = fac.protocol_version.unwrap_or(payload.x402_version);
        let amount = scaled_amount(&route.price_atomic, network.token.decimals)?.to_string();
        let pay_to = fac
            .facilitator_contract
            .clone()
            .or_else(|| route.pay_to.clone())
            .ok_or_else(|| {
                PaymentError::ConfigError(format!("route {} has no EVM recipient", route.key))
            })?;

        Ok(json!({
            "paymentPayload": {
                "x402Version": version,
                "scheme": payload.scheme,
                "network": alias,
                "payload": payload.payload,
            },
            "paymentRequirements": {
                "scheme": SCHEME_EXACT,
                "network": alias,
                "maxAmountRequired": amount,
                "maxTimeoutSeconds": MAX_TIMEOUT_SECONDS,
                "payTo": pay_to,
                "asset": network.token.address,
                "resource": route.path,
                "description": route.description,
                "mimeType": route.mime_type,
                "amount": amount,
                "recipient": pay_to,
            },
        }))
    }

    async fn post(
        &self,
        fac: &FacilitatorDescriptor,
        endpoint: &str,
        body: &Value,
    ) -> Result<(reqwest::StatusCode, String), PaymentError> {
        let url = format!("{}/{}", fac.url.trim_end_matches('/'), endpoint);
        let api_key = Self::api_key(fac)?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| PaymentError::HttpError(format!("facilitator request failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PaymentError::HttpError(format!("facilitator response unreadable: {e}")))?;
        Ok((status, text))
    }
}

#[async_trait]
impl ChainAdapter for EvmFacilitatorAdapter {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<VerifyOutcome, PaymentError> {
        let fac = Self::descriptor(network)?;
        let body = Self::request_body(payload, route, network, fac)?;
        let (status, text) = self.post(fac, "verify", &body).await?;

        let parsed: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                return Ok(VerifyOutcome::invalid(format!(
                    "Facilitator returned non-JSON ({})",
                    status.as_u16()
                )))
            }
        };

        if status.is_success() && parsed["isValid"] == json!(true) {
            let payer = parsed["payer"].as_str().unwrap_or_default().to_string();
            return Ok(VerifyOutcome::valid(payer));
        }

        let reason = parsed["invalidReason"]
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("Facilitator rejected payment ({})", status.as_u16()));
        tracing::warn!(facilitator = %fac.url, status = %status, reason = %reason, "facilitator verify rejected");
        Ok(VerifyOutcome::invalid(reason))
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<SettlementReceipt, PaymentError> {
        let fac = Self::descriptor(network)?;
        let body = Self::request_body(payload, route, network, fac)?;
        let (status, text) = self.post(fac, "settle", &body).await?;

        let parsed: Value = serde_json::from_str(&text).map_err(|_| {
            PaymentError::SettlementFailed(format!(
                "Facilitator returned non-JSON ({})",
                status.as_u16()
            ))
        })?;

        if status.is_success() && parsed["success"] == json!(true) {
            let tx_hash = parsed["transaction"]
                .as_str()
                .ok_or_else(|| {
                    PaymentError::SettlementFailed(
                        "facilitator settle response missing transaction".to_string(),
                    )
                })?
                .to_string();
            let receipt_network = parsed["network"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| network.network_id.clone());

            tracing::info!(facilitator = %fac.url, tx = %tx_hash, "facilitator settlement succeeded");
            return Ok(SettlementReceipt {
                tx_hash,
                network: receipt_network,
                block_number: None,
                payer: parsed["payer"].as_str().map(str::to_owned),
                facilitator: Some(fac.url.clone()),
            });
        }

        let reason = parsed["errorReason"]
            .as_str()
            .or_else(|| parsed["error"]["message"].as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("Facilitator settlement failed ({})", status.as_u16()));
        Err(PaymentError::SettlementFailed(reason))
    }

    fn derive_nonce_key(&self, _payload: &PaymentPayload) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{TokenDescriptor, VmKind};
    use actix_web::{web, App, HttpResponse, HttpServer};

    fn route() -> RouteDescriptor {
        RouteDescriptor {
            key: "myapi".to_string(),
            path: "/v1/myapi".to_string(),
            backend_name: "myapi".to_string(),
            backend_url: "http://127.0.0.1:9/api".to_string(),
            backend_api_key_env: "MYAPI_BACKEND_API_KEY".to_string(),
            backend_api_key_header: "x-api-key".to_string(),
            price: "$0.01".to_string(),
            price_atomic: "10000".to_string(),
            pay_to: Some("0x1111111111111111111111111111111111111111".to_string()),
            pay_to_sol: None,
            description: "test".to_string(),
            mime_type: "application/json".to_string(),
        }
    }

    fn network(url: &str, key_env: &str) -> NetworkDescriptor {
        NetworkDescriptor {
            vm: VmKind::Evm,
            network_id: "eip155:43114".to_string(),
            chain_id: Some(43114),
            rpc_env: "FAC_TEST_RPC".to_string(),
            token: TokenDescriptor {
                address: "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E".to_string(),
                display_name: "USD Coin".to_string(),
                domain_version: "2".to_string(),
                decimals: 6,
            },
            facilitator: Some(FacilitatorDescriptor {
                url: url.to_string(),
                api_key_env: key_env.to_string(),
                network_alias: Some("avalanche".to_string()),
                facilitator_contract: Some(
                    "0x2222222222222222222222222222222222222222".to_string(),
                ),
                protocol_version: Some(1),
            }),
        }
    }

    fn payload() -> PaymentPayload {
        PaymentPayload {
            x402_version: 2,
            scheme: SCHEME_EXACT.to_string(),
            network: "eip155:43114".to_string(),
            payload: serde_json::json!({"authorization": {}, "signature": "0x"}),
            extensions: None,
        }
    }

    /// Bind a mock facilitator on an ephemeral port, serving fixed responses.
    async fn spawn_facilitator(
        verify: (u16, &'static str),
        settle: (u16, &'static str),
    ) -> String {
        let server = HttpServer::new(move || {
            App::new()
                .route(
                    "/verify",
                    web::post().to(move || async move {
                        HttpResponse::build(
                            actix_web::http::StatusCode::from_u16(verify.0).unwrap(),
                        )
                        .content_type("application/json")
                        .body(verify.1)
                    }),
                )
                .route(
                    "/settle",
                    web::post().to(move || async move {
                        HttpResponse::build(
                            actix_web::http::StatusCode::from_u16(settle.0).unwrap(),
                        )
                        .content_type("application/json")
                        .body(settle.1)
                    }),
                )
        })
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        tokio::spawn(server.run());
        format!("http://{addr}")
    }

    #[actix_rt::test]
    async fn test_verify_accepts_facilitator_yes() {
        std::env::set_var("FAC_TEST_KEY_A", "secret");
        let url =
            spawn_facilitator((200, r#"{"isValid":true,"payer":"0xabc"}"#), (200, "{}")).await;
        let adapter = EvmFacilitatorAdapter::new(reqwest::Client::new());

        let outcome = adapter
            .verify(&payload(), &route(), &network(&url, "FAC_TEST_KEY_A"))
            .await
            .unwrap();
        assert!(outcome.is_valid);
        assert_eq!(outcome.payer.as_deref(), Some("0xabc"));
    }

    #[actix_rt::test]
    async fn test_verify_surfaces_invalid_reason() {
        std::env::set_var("FAC_TEST_KEY_B", "secret");
        let url = spawn_facilitator(
            (200, r#"{"isValid":false,"invalidReason":"Nonce already used"}"#),
            (200, "{}"),
        )
        .await;
        let adapter = EvmFacilitatorAdapter::new(reqwest::Client::new());

        let outcome = adapter
            .verify(&payload(), &route(), &network(&url, "FAC_TEST_KEY_B"))
            .await
            .unwrap();
        assert!(!outcome.is_valid);
        assert_eq!(outcome.invalid_reason.as_deref(), Some("Nonce already used"));
    }

    #[actix_rt::test]
    async fn test_verify_non_json_becomes_reasoned_rejection() {
        std::env::set_var("FAC_TEST_KEY_C", "secret");
        let url = spawn_facilitator((502, "<html>bad gateway</html>"), (200, "{}")).await;
        let adapter = EvmFacilitatorAdapter::new(reqwest::Client::new());

        let outcome = adapter
            .verify(&payload(), &route(), &network(&url, "FAC_TEST_KEY_C"))
            .await
            .unwrap();
        assert!(!outcome.is_valid);
        assert_eq!(
            outcome.invalid_reason.as_deref(),
            Some("Facilitator returned non-JSON (502)")
        );
    }

    #[actix_rt::test]
    async fn test_settle_success_yields_null_block_receipt() {
        std::env::set_var("FAC_TEST_KEY_D", "secret");
        let url = spawn_facilitator(
            (200, "{}"),
            (200, r#"{"success":true,"transaction":"0xdead","network":"avalanche"}"#),
        )
        .await;
        let adapter = EvmFacilitatorAdapter::new(reqwest::Client::new());
        let network = network(&url, "FAC_TEST_KEY_D");

        let receipt = adapter.settle(&payload(), &route(), &network).await.unwrap();
        assert_eq!(receipt.tx_hash, "0xdead");
        assert_eq!(receipt.network, "avalanche");
        assert_eq!(receipt.block_number, None);
        assert_eq!(receipt.facilitator.as_deref(), Some(url.as_str()));
    }

    #[actix_rt::test]
    async fn test_settle_failure_surfaces_error_reason() {
        std::env::set_var("FAC_TEST_KEY_E", "secret");
        let url = spawn_facilitator(
            (200, "{}"),
            (400, r#"{"success":false,"errorReason":"insufficient allowance"}"#),
        )
        .await;
        let adapter = EvmFacilitatorAdapter::new(reqwest::Client::new());

        let result = adapter
            .settle(&payload(), &route(), &network(&url, "FAC_TEST_KEY_E"))
            .await;
        match result {
            Err(PaymentError::SettlementFailed(reason)) => {
                assert_eq!(reason, "insufficient allowance");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn test_missing_api_key_names_env_var() {
        std::env::remove_var("FAC_TEST_KEY_MISSING");
        let adapter = EvmFacilitatorAdapter::new(reqwest::Client::new());

        let result = adapter
            .verify(
                &payload(),
                &route(),
                &network("http://127.0.0.1:1", "FAC_TEST_KEY_MISSING"),
            )
            .await;
        match result {
            Err(PaymentError::ConfigError(msg)) => {
                assert!(msg.contains("FAC_TEST_KEY_MISSING"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
