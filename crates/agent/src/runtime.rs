use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use closer_core::compaction::compact;
use closer_core::config::CheckpointConfig;
use closer_core::domain::approval::ApprovalDecision;
use closer_core::domain::conversation::{ConversationState, SessionId};
use closer_core::errors::{ApplicationError, DomainError};
use closer_core::flows::{DialogPhase, FlowState};
use closer_core::store::ConversationStore;

use crate::pipeline::{PipelineExecutor, TurnDiagnostics, TurnInput, TurnOutcome};

/// What a caller sees after one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnReply {
    pub session_id: String,
    pub trace_id: String,
    pub messages: Vec<String>,
    pub next_state: FlowState,
    pub dialog_phase: DialogPhase,
    pub escalate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    pub awaiting_approval: bool,
    pub diagnostics: TurnDiagnostics,
}

impl TurnReply {
    fn from_outcome(session_id: &SessionId, outcome: TurnOutcome) -> Self {
        Self {
            session_id: session_id.to_string(),
            trace_id: outcome.diagnostics.trace_id.clone(),
            messages: outcome.messages,
            next_state: outcome.next_state,
            dialog_phase: outcome.dialog_phase,
            escalate: outcome.escalate,
            escalation_reason: outcome.escalation_reason,
            awaiting_approval: outcome.awaiting_approval,
            diagnostics: outcome.diagnostics,
        }
    }
}

type SessionLock = Arc<tokio::sync::Mutex<()>>;
type LockMap = Mutex<HashMap<SessionId, SessionLock>>;

/// A claim on one session's lock. Dropping it, including when the turn future
/// is cancelled, removes the map entry once no other turn holds or waits on it.
struct SessionLease<'a> {
    locks: &'a LockMap,
    session_id: SessionId,
    lock: SessionLock,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.session_id);
        }
    }
}

/// Load, run, apply, compact, save. Turns for one session never interleave.
pub struct ConversationRuntime {
    executor: Arc<PipelineExecutor>,
    store: Arc<dyn ConversationStore>,
    checkpoint: CheckpointConfig,
    locks: LockMap,
}

impl ConversationRuntime {
    pub fn new(
        executor: Arc<PipelineExecutor>,
        store: Arc<dyn ConversationStore>,
        checkpoint: CheckpointConfig,
    ) -> Self {
        Self { executor, store, checkpoint, locks: Mutex::new(HashMap::new()) }
    }

    pub fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.executor
    }

    pub async fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationState>, ApplicationError> {
        Ok(self.store.load(session_id).await?)
    }

    pub async fn process_turn(
        &self,
        session_id: &SessionId,
        input: TurnInput,
    ) -> Result<TurnReply, ApplicationError> {
        let lease = self.session_lock(session_id);
        let _turn = lease.lock.lock().await;
        let mut state = self
            .store
            .load(session_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(session_id.as_str()));
        let outcome = self.executor.process_turn(&state, input).await;
        self.commit(&mut state, outcome).await
    }

    pub async fn resume_turn(
        &self,
        session_id: &SessionId,
        decision: ApprovalDecision,
    ) -> Result<TurnReply, ApplicationError> {
        let lease = self.session_lock(session_id);
        let _turn = lease.lock.lock().await;
        let mut state = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| DomainError::SessionNotFound(session_id.to_string()))?;
        let outcome = self.executor.resume_turn(&state, decision).await?;
        self.commit(&mut state, outcome).await
    }

    async fn commit(
        &self,
        state: &mut ConversationState,
        outcome: TurnOutcome,
    ) -> Result<TurnReply, ApplicationError> {
        state.apply(outcome.delta.clone());
        let report = compact(state, &self.checkpoint);
        self.store.save(state).await.map_err(|error| {
            warn!(
                event_name = "runtime.session.save_failed",
                session_id = %state.session_id,
                trace_id = %outcome.diagnostics.trace_id,
                error = %error,
                "could not persist conversation state"
            );
            ApplicationError::from(error)
        })?;

        info!(
            event_name = "runtime.session.saved",
            session_id = %state.session_id,
            trace_id = %outcome.diagnostics.trace_id,
            current_state = %state.current_state,
            messages = state.messages.len(),
            bytes = report.bytes_after,
            "conversation state persisted"
        );
        Ok(TurnReply::from_outcome(&state.session_id, outcome))
    }

    fn session_lock(&self, session_id: &SessionId) -> SessionLease<'_> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lock = Arc::clone(locks.entry(session_id.clone()).or_default());
        SessionLease { locks: &self.locks, session_id: session_id.clone(), lock }
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.locks.lock().map_or(0, |locks| locks.len())
    }
}
