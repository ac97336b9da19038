use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use closer_core::escalation::EscalationLevel;
use closer_core::flows::FlowState;

/// Everything an operator needs to pick the conversation up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationNotification {
    pub session_id: String,
    pub trace_id: String,
    pub level: EscalationLevel,
    pub reason: String,
    pub state: FlowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// The user input that triggered the escalation, or a reference to it.
    pub input_ref: String,
    #[serde(default)]
    pub attachment_urls: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify(&self, notification: &EscalationNotification) -> Result<()>;
}

/// Writes escalations to the log only. Used when no operator channel is configured.
#[derive(Clone, Debug, Default)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn notify(&self, notification: &EscalationNotification) -> Result<()> {
        info!(
            event_name = "escalation.notification.logged",
            session_id = %notification.session_id,
            trace_id = %notification.trace_id,
            level = notification.level.as_str(),
            reason = %notification.reason,
            state = %notification.state,
            "operator notification (log channel)"
        );
        Ok(())
    }
}
