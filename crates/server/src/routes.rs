use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use closer_agent::{ConversationRuntime, TurnInput, TurnReply};
use closer_core::breaker::{BreakerStatus, CircuitBreakerRegistry};
use closer_core::domain::approval::ApprovalDecision;
use closer_core::domain::conversation::{Attachment, SessionId};
use closer_core::errors::{ApplicationError, InterfaceError};

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<ConversationRuntime>,
    breakers: Arc<CircuitBreakerRegistry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub correlation_id: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn router(runtime: Arc<ConversationRuntime>, breakers: Arc<CircuitBreakerRegistry>) -> Router {
    Router::new()
        .route("/sessions/{session_id}/turns", post(post_turn))
        .route("/sessions/{session_id}/approval", post(post_approval))
        .route("/breakers", get(list_breakers))
        .route("/breakers/{name}/reset", post(reset_breaker))
        .with_state(ApiState { runtime, breakers })
}

async fn post_turn(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
    Json(request): Json<TurnRequest>,
) -> ApiResult<TurnReply> {
    let correlation_id = Uuid::new_v4().to_string();
    if request.message.trim().is_empty() && request.attachments.is_empty() {
        return Err(reject(InterfaceError::BadRequest {
            message: "message or attachments required".to_string(),
            correlation_id,
        }));
    }

    let session_id = SessionId(session_id);
    let input = TurnInput { user_input: request.message, attachments: request.attachments };
    let reply = state
        .runtime
        .process_turn(&session_id, input)
        .await
        .map_err(|error| application_failure(error, &correlation_id))?;
    info!(
        event_name = "server.turn.completed",
        session_id = %session_id,
        trace_id = %reply.trace_id,
        escalate = reply.escalate,
        "turn served"
    );
    Ok(Json(reply))
}

async fn post_approval(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
    Json(decision): Json<ApprovalDecision>,
) -> ApiResult<TurnReply> {
    let correlation_id = Uuid::new_v4().to_string();
    let session_id = SessionId(session_id);
    let reply = state
        .runtime
        .resume_turn(&session_id, decision)
        .await
        .map_err(|error| application_failure(error, &correlation_id))?;
    Ok(Json(reply))
}

async fn list_breakers(State(state): State<ApiState>) -> Json<BTreeMap<String, BreakerStatus>> {
    Json(state.breakers.statuses())
}

async fn reset_breaker(
    Path(name): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<BreakerStatus> {
    let correlation_id = Uuid::new_v4().to_string();
    if !state.breakers.reset(&name) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError { error: format!("unknown breaker `{name}`"), correlation_id }),
        ));
    }
    info!(event_name = "server.breaker.reset", breaker = %name, "breaker reset by operator");
    let status = state.breakers.get(&name).map(|breaker| breaker.get_status()).ok_or((
        StatusCode::NOT_FOUND,
        Json(ApiError { error: format!("unknown breaker `{name}`"), correlation_id }),
    ))?;
    Ok(Json(status))
}

fn application_failure(error: ApplicationError, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    warn!(
        event_name = "server.request.failed",
        correlation_id = %correlation_id,
        error = %error,
        "request failed"
    );
    reject(error.into_interface(correlation_id))
}

fn reject(error: InterfaceError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiError {
            error: error.user_message().to_string(),
            correlation_id: error.correlation_id().to_string(),
        }),
    )
}
