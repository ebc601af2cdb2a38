//! Payment-identifier idempotency cache.
//!
//! A confirmed settlement is cached under the client-chosen payment id; every
//! retry carrying the same id within the TTL observes the identical
//! `PAYMENT-RESPONSE` header bytes and triggers no further settlement.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::{IDEMPOTENCY_KEY_PREFIX, IDEMPOTENCY_TTL_SECS};
use crate::response::SettlementReceipt;
use crate::store::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    /// Exact header value handed back on every replay.
    pub payment_response_header: String,
    pub settlement: SettlementReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub timestamp_ms: u64,
    pub response: CachedResponse,
}

#[derive(Clone)]
pub struct IdempotencyCache {
    store: Arc<dyn KvStore>,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(payment_id: &str) -> String {
        format!("{IDEMPOTENCY_KEY_PREFIX}{payment_id}")
    }

    /// Look up a cached settlement. Store errors read as a miss.
    pub async fn get(&self, payment_id: &str) -> Option<IdempotencyRecord> {
        let value = match self.store.get(&Self::key(payment_id)).await {
            Ok(v) => v?,
            Err(e) => {
                tracing::warn!(payment_id = %payment_id, error = %e, "idempotency read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(payment_id = %payment_id, error = %e, "corrupt idempotency record, treating as miss");
                None
            }
        }
    }

    /// Cache a confirmed settlement. Never mutated afterwards; write errors
    /// are logged and swallowed (the nonce record still blocks a re-settle).
    pub async fn put(&self, payment_id: &str, response: CachedResponse) {
        let record = IdempotencyRecord {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            response,
        };
        let value = match serde_json::to_string(&record) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(payment_id = %payment_id, error = %e, "idempotency serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .store
            .put(
                &Self::key(payment_id),
                &value,
                Duration::from_secs(IDEMPOTENCY_TTL_SECS),
            )
            .await
        {
            tracing::error!(payment_id = %payment_id, error = %e, "idempotency write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::payment_response_header;
    use crate::store::MemoryKvStore;

    fn receipt() -> SettlementReceipt {
        SettlementReceipt {
            tx_hash: "0xcafe".to_string(),
            network: "eip155:8453".to_string(),
            block_number: None,
            payer: Some("0x1111111111111111111111111111111111111111".to_string()),
            facilitator: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_returns_identical_header_bytes() {
        let cache = IdempotencyCache::new(Arc::new(MemoryKvStore::new()));
        let header = payment_response_header(&receipt());
        cache
            .put(
                "test-payment-id-12345678",
                CachedResponse {
                    payment_response_header: header.clone(),
                    settlement: receipt(),
                },
            )
            .await;

        let first = cache.get("test-payment-id-12345678").await.unwrap();
        let second = cache.get("test-payment-id-12345678").await.unwrap();
        assert_eq!(first.response.payment_response_header, header);
        assert_eq!(
            first.response.payment_response_header,
            second.response.payment_response_header
        );
    }

    #[tokio::test]
    async fn test_miss_for_unknown_id() {
        let cache = IdempotencyCache::new(Arc::new(MemoryKvStore::new()));
        assert!(cache.get("never-seen-payment-id").await.is_none());
    }
}
