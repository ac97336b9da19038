use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::{Attachment, SessionId};
use crate::flows::FlowState;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    PaymentConfirmation,
    OrderSubmission,
}

impl ApprovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentConfirmation => "payment_confirmation",
            Self::OrderSubmission => "order_submission",
        }
    }
}

/// A suspended turn waiting for an operator decision.
///
/// Carries everything needed to re-enter the pipeline at the responder that
/// asked for it, so the suspension survives a process restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub session_id: SessionId,
    pub kind: ApprovalKind,
    pub resume_state: FlowState,
    pub user_input: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub summary: String,
    pub payload: Value,
    pub requested_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(operator: impl Into<String>) -> Self {
        Self { approved: true, operator: Some(operator.into()), note: None }
    }

    pub fn reject(operator: impl Into<String>, note: impl Into<String>) -> Self {
        Self { approved: false, operator: Some(operator.into()), note: Some(note.into()) }
    }
}
