use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use closer_core::domain::conversation::{ConversationState, SessionId};
use closer_core::domain::idempotency::{ContentHash, IdempotencyRecord, IdempotencyStatus};
use closer_core::store::{ConversationStore, IdempotencyStore, Reservation, StoreError};

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, hash: &ContentHash) -> Result<Option<IdempotencyRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(hash.as_str()).cloned())
    }

    async fn upsert(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let mut next = record.clone();
        if let Some(existing) = records.get(record.hash.as_str()) {
            next.created_at = existing.created_at;
        }
        records.insert(record.hash.as_str().to_string(), next);
        Ok(())
    }

    async fn try_reserve(
        &self,
        claim: &IdempotencyRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let mut records = self.records.write().await;
        let Some(existing) = records.get_mut(claim.hash.as_str()) else {
            let mut acquired = claim.clone();
            acquired.status = IdempotencyStatus::Processing;
            acquired.payload = None;
            acquired.attempt_count = 1;
            records.insert(claim.hash.as_str().to_string(), acquired.clone());
            return Ok(Reservation::Acquired(acquired));
        };

        let reclaimable = existing.status == IdempotencyStatus::Failed
            || (existing.status == IdempotencyStatus::Processing
                && existing.updated_at < stale_before);
        if !reclaimable {
            return Ok(Reservation::Existing(existing.clone()));
        }

        existing.session_id = claim.session_id.clone();
        existing.operation = claim.operation.clone();
        existing.status = IdempotencyStatus::Processing;
        existing.payload = None;
        existing.attempt_count += 1;
        existing.updated_at = claim.updated_at;
        Ok(Reservation::Acquired(existing.clone()))
    }
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    sessions: RwLock<HashMap<SessionId, ConversationState>>,
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<ConversationState>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(state.session_id.clone(), state.clone());
        Ok(())
    }
}
