//! Storage contracts consumed by the pipeline. Implementations live in `closer-db`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::conversation::{ConversationState, SessionId};
use crate::domain::idempotency::{ContentHash, IdempotencyRecord};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        ApplicationError::Persistence(value.to_string())
    }
}

/// Result of an atomic reservation attempt on a hash.
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    /// The caller now owns the hash and must settle it with a final status.
    Acquired(IdempotencyRecord),
    /// Someone else holds, or already settled, the hash.
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, hash: &ContentHash) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert or overwrite the record for `record.hash`. Keeps the original `created_at`.
    async fn upsert(&self, record: &IdempotencyRecord) -> Result<(), StoreError>;

    /// Check-and-set in one critical section: inserts `claim` when the hash is
    /// unknown, takes over a `failed` record or a `processing` record last
    /// touched before `stale_before`, and otherwise returns the existing record.
    async fn try_reserve(
        &self,
        claim: &IdempotencyRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<Reservation, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> Result<Option<ConversationState>, StoreError>;
    async fn save(&self, state: &ConversationState) -> Result<(), StoreError>;
}
