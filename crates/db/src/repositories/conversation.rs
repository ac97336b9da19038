use sqlx::Row;

use closer_core::domain::conversation::{ConversationState, SessionId};
use closer_core::store::{ConversationStore, StoreError};

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// One-line view of a stored session, used by operator tooling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub current_state: String,
    pub dialog_phase: String,
    pub awaiting_approval: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let row = sqlx::query("SELECT payload_json FROM conversation_state WHERE session_id = ?")
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload_json")?;
        Ok(Some(serde_json::from_str(&payload)?))
    }

    pub async fn upsert(&self, state: &ConversationState) -> Result<(), RepositoryError> {
        let payload_json = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO conversation_state (
                session_id,
                current_state,
                dialog_phase,
                awaiting_approval,
                payload_json,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                current_state = excluded.current_state,
                dialog_phase = excluded.dialog_phase,
                awaiting_approval = excluded.awaiting_approval,
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at",
        )
        .bind(state.session_id.as_str())
        .bind(state.current_state.as_str())
        .bind(state.dialog_phase.as_str())
        .bind(i64::from(state.pending_approval.is_some()))
        .bind(payload_json)
        .bind(format_timestamp(state.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sessions ordered by most recent activity first.
    pub async fn list(
        &self,
        awaiting_approval_only: bool,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT session_id, current_state, dialog_phase, awaiting_approval, updated_at
             FROM conversation_state
             WHERE (? = 0 OR awaiting_approval = 1)
             ORDER BY updated_at DESC, session_id ASC
             LIMIT ?",
        )
        .bind(i64::from(awaiting_approval_only))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SessionSummary {
                    session_id: SessionId(row.try_get("session_id")?),
                    current_state: row.try_get("current_state")?,
                    dialog_phase: row.try_get("dialog_phase")?,
                    awaiting_approval: row.try_get::<i64, _>("awaiting_approval")? != 0,
                    updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.find(session_id).await?)
    }

    async fn save(&self, state: &ConversationState) -> Result<(), StoreError> {
        Ok(self.upsert(state).await?)
    }
}
