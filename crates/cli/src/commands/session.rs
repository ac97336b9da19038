use closer_core::domain::conversation::SessionId;
use closer_db::{SqlConversationStore, SqlIdempotencyStore};
use serde_json::{json, Value};

use crate::commands::{with_database, CommandResult};

pub fn run(session_id: &str) -> CommandResult {
    let session_id = SessionId(session_id.trim().to_string());
    if session_id.as_str().is_empty() {
        return CommandResult::failure("session", "invalid_argument", "session id is empty", 6);
    }

    let lookup = session_id.clone();
    let result = with_database("session", |pool| async move {
        let state = SqlConversationStore::new(pool.clone())
            .find(&lookup)
            .await
            .map_err(|error| ("query", error.to_string(), 7u8))?;
        let Some(state) = state else {
            return Ok(None);
        };
        let ledger = SqlIdempotencyStore::new(pool)
            .list_for_session(&lookup)
            .await
            .map_err(|error| ("query", error.to_string(), 7u8))?;

        let ledger = ledger
            .iter()
            .map(|record| {
                json!({
                    "hash": record.hash,
                    "operation": record.operation,
                    "status": record.status.as_str(),
                    "attempt_count": record.attempt_count,
                    "updated_at": record.updated_at,
                })
            })
            .collect::<Vec<Value>>();

        Ok(Some(json!({
            "session_id": state.session_id,
            "current_state": state.current_state,
            "dialog_phase": state.dialog_phase.as_str(),
            "awaiting_approval": state.pending_approval.is_some(),
            "pending_approval": state.pending_approval,
            "message_count": state.messages.len(),
            "last_message": state.last_message().map(|message| message.content.clone()),
            "selected_products": state.selected_products,
            "should_escalate": state.should_escalate,
            "escalation_reason": state.escalation_reason,
            "metadata": state.metadata,
            "updated_at": state.updated_at,
            "ledger": ledger,
        })))
    });

    match result {
        Ok(Some(view)) => CommandResult::success_with_data(
            "session",
            format!("session `{session_id}` loaded"),
            view,
        ),
        Ok(None) => CommandResult::failure(
            "session",
            "not_found",
            format!("no stored state for session `{session_id}`"),
            6,
        ),
        Err(failure) => failure,
    }
}

pub fn list(awaiting_approval_only: bool, limit: u32) -> CommandResult {
    let result = with_database("sessions", |pool| async move {
        SqlConversationStore::new(pool)
            .list(awaiting_approval_only, limit.max(1))
            .await
            .map_err(|error| ("query", error.to_string(), 7u8))
    });

    match result {
        Ok(summaries) => {
            let rows = summaries
                .iter()
                .map(|summary| {
                    json!({
                        "session_id": summary.session_id,
                        "current_state": summary.current_state,
                        "dialog_phase": summary.dialog_phase,
                        "awaiting_approval": summary.awaiting_approval,
                        "updated_at": summary.updated_at,
                    })
                })
                .collect::<Vec<Value>>();
            CommandResult::success_with_data(
                "sessions",
                format!("{} session(s)", rows.len()),
                Value::Array(rows),
            )
        }
        Err(failure) => failure,
    }
}
