//! At-most-once execution of side-effecting operations keyed by content hash.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::conversation::SessionId;
use crate::domain::idempotency::{
    ContentHash, IdempotencyRecord, IdempotencyStatus,
};
use crate::store::{IdempotencyStore, Reservation, StoreError};

/// Identifies one logical side-effecting request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerKey {
    pub hash: ContentHash,
    pub session_id: SessionId,
    pub operation: String,
}

impl LedgerKey {
    pub fn new(session_id: &SessionId, operation: impl Into<String>, parts: &[&str]) -> Self {
        let operation = operation.into();
        Self {
            hash: ContentHash::compute(session_id.as_str(), &operation, parts),
            session_id: session_id.clone(),
            operation,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LedgerOutcome {
    /// Caller owns the hash and must run the operation, then `record_result`.
    Acquired(IdempotencyRecord),
    /// A terminal record exists; the operation must not run again.
    Completed(IdempotencyRecord),
    /// Another worker is running the operation right now.
    InFlight(IdempotencyRecord),
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    processing_timeout: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>, processing_timeout: Duration) -> Self {
        Self { store, processing_timeout }
    }

    pub async fn get_by_hash(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.store.get(hash).await
    }

    pub async fn begin(&self, key: &LedgerKey) -> Result<LedgerOutcome, StoreError> {
        let timeout = chrono::Duration::from_std(self.processing_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let stale_before = Utc::now() - timeout;
        let claim =
            IdempotencyRecord::processing(key.hash.clone(), key.session_id.clone(), &key.operation);

        match self.store.try_reserve(&claim, stale_before).await? {
            Reservation::Acquired(record) => {
                if record.attempt_count > 1 {
                    warn!(
                        event_name = "idempotency.ledger.takeover",
                        hash = %record.hash,
                        operation = %record.operation,
                        attempt_count = record.attempt_count,
                        "re-acquired failed or stale ledger record"
                    );
                }
                Ok(LedgerOutcome::Acquired(record))
            }
            Reservation::Existing(record) if record.status.is_terminal() => {
                info!(
                    event_name = "idempotency.ledger.short_circuit",
                    hash = %record.hash,
                    session_id = %key.session_id,
                    status = record.status.as_str(),
                    "operation already settled, skipping execution"
                );
                Ok(LedgerOutcome::Completed(record))
            }
            Reservation::Existing(record) => {
                info!(
                    event_name = "idempotency.ledger.in_flight",
                    hash = %record.hash,
                    session_id = %key.session_id,
                    "operation is already running elsewhere"
                );
                Ok(LedgerOutcome::InFlight(record))
            }
        }
    }

    /// Upserts the outcome for `key`. Called by the owner of an acquired hash.
    pub async fn record_result(
        &self,
        key: &LedgerKey,
        status: IdempotencyStatus,
        payload: Option<Value>,
    ) -> Result<IdempotencyRecord, StoreError> {
        let existing = self.store.get(&key.hash).await?;
        let now = Utc::now();
        let record = IdempotencyRecord {
            hash: key.hash.clone(),
            session_id: key.session_id.clone(),
            operation: key.operation.clone(),
            status,
            payload,
            attempt_count: existing.as_ref().map_or(1, |record| record.attempt_count),
            created_at: existing.as_ref().map_or(now, |record| record.created_at),
            updated_at: now,
        };
        self.store.upsert(&record).await?;
        info!(
            event_name = "idempotency.ledger.recorded",
            hash = %record.hash,
            session_id = %record.session_id,
            status = record.status.as_str(),
            "ledger record settled"
        );
        Ok(record)
    }
}
