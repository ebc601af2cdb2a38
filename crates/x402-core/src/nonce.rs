//! Durable nonce lifecycle: pending claim → confirmed, with rollback.
//!
//! A `true` from [`NonceCoordinator::claim`] is the unique license to settle.
//! Store failures are asymmetric: reads fail open (the chain or facilitator
//! is the ultimate replay authority), claims fail closed (a store outage must
//! not enable a double-spend).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::{NONCE_CONFIRMED_TTL_SECS, NONCE_KEY_PREFIX, NONCE_PENDING_TTL_SECS};
use crate::response::SettlementReceipt;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonceStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    pub status: NonceStatus,
    pub timestamp_ms: u64,
    pub network: String,
    pub payer: String,
    pub route: String,
    pub vm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// Request-scoped context recorded alongside each claim.
#[derive(Debug, Clone)]
pub struct NonceMetadata {
    pub network: String,
    pub payer: String,
    pub route: String,
    pub vm: String,
}

#[derive(Clone)]
pub struct NonceCoordinator {
    store: Arc<dyn KvStore>,
}

impl NonceCoordinator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(id: &str) -> String {
        format!("{NONCE_KEY_PREFIX}{id}")
    }

    /// Read the record for a nonce id. Store errors read as absent.
    pub async fn get(&self, id: &str) -> Option<NonceRecord> {
        let value = match self.store.get(&Self::key(id)).await {
            Ok(v) => v?,
            Err(e) => {
                tracing::warn!(nonce = %id, error = %e, "nonce read failed, treating as absent");
                return None;
            }
        };
        match serde_json::from_str(&value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(nonce = %id, error = %e, "corrupt nonce record, treating as absent");
                None
            }
        }
    }

    /// Atomically claim a nonce for settlement: SET-if-absent with the
    /// pending TTL. Returns `true` iff this request owns the claim. A store
    /// failure counts as a lost claim.
    pub async fn claim(&self, id: &str, meta: &NonceMetadata) -> bool {
        let record = NonceRecord {
            status: NonceStatus::Pending,
            timestamp_ms: unix_ms(),
            network: meta.network.clone(),
            payer: meta.payer.clone(),
            route: meta.route.clone(),
            vm: meta.vm.clone(),
            tx_hash: None,
            block_number: None,
        };
        let value = match serde_json::to_string(&record) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(nonce = %id, error = %e, "nonce record serialization failed");
                return false;
            }
        };
        match self
            .store
            .put_if_absent(
                &Self::key(id),
                &value,
                Duration::from_secs(NONCE_PENDING_TTL_SECS),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(nonce = %id, error = %e, "nonce claim failed closed on store error");
                false
            }
        }
    }

    /// Promote a settled nonce to confirmed with the long replay TTL.
    /// Store errors are logged and swallowed: the token contract's own nonce
    /// storage rejects a re-settlement either way.
    pub async fn confirm(&self, id: &str, meta: &NonceMetadata, receipt: &SettlementReceipt) {
        let record = NonceRecord {
            status: NonceStatus::Confirmed,
            timestamp_ms: unix_ms(),
            network: meta.network.clone(),
            payer: meta.payer.clone(),
            route: meta.route.clone(),
            vm: meta.vm.clone(),
            tx_hash: Some(receipt.tx_hash.clone()),
            block_number: receipt.block_number,
        };
        let value = match serde_json::to_string(&record) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(nonce = %id, error = %e, "nonce confirm serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .store
            .put(
                &Self::key(id),
                &value,
                Duration::from_secs(NONCE_CONFIRMED_TTL_SECS),
            )
            .await
        {
            tracing::error!(nonce = %id, error = %e, "nonce confirm write failed");
        }
    }

    /// Release a claimed nonce after settlement raises, so the client can
    /// retry with the same authorization. Called exactly once per failure.
    pub async fn release(&self, id: &str) {
        if let Err(e) = self.store.delete(&Self::key(id)).await {
            tracing::error!(nonce = %id, error = %e, "nonce release failed; pending TTL will expire it");
        }
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
