//! Dual-track hand-off: a neutral reply now, an operator notification in the background.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use closer_core::breaker::CircuitBreakerRegistry;
use closer_core::escalation::{ActiveEscalations, EscalationLevel};
use closer_core::flows::FlowState;

use crate::notify::{EscalationNotification, NotificationSender};

pub const NOTIFICATION_DEPENDENCY: &str = "operator_notifications";

#[derive(Clone, Debug, PartialEq)]
pub struct EscalationRequest {
    pub session_id: String,
    pub trace_id: String,
    pub level: EscalationLevel,
    pub reason: String,
    pub state: FlowState,
    pub confidence: Option<f64>,
    pub input_ref: String,
    pub attachment_urls: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// A notification task was spawned.
    Dispatched,
    /// The session already has an escalation in its suppression window.
    Suppressed,
}

#[derive(Debug)]
pub struct EscalationOutcome {
    pub soft_message: String,
    pub dispatch: DispatchStatus,
    /// Handle of the background notification; callers on the turn path drop it.
    pub task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct EscalationController {
    active: Arc<ActiveEscalations>,
    notifier: Arc<dyn NotificationSender>,
    breakers: Arc<CircuitBreakerRegistry>,
    soft_message: String,
}

impl EscalationController {
    pub fn new(
        active: Arc<ActiveEscalations>,
        notifier: Arc<dyn NotificationSender>,
        breakers: Arc<CircuitBreakerRegistry>,
        soft_message: impl Into<String>,
    ) -> Self {
        Self { active, notifier, breakers, soft_message: soft_message.into() }
    }

    pub fn soft_message(&self) -> &str {
        &self.soft_message
    }

    /// Returns the user-facing message immediately. The operator notification
    /// runs on a detached task whose failure is only logged.
    pub fn escalate(&self, request: EscalationRequest) -> EscalationOutcome {
        let key = request.session_id.clone();
        if !self.active.try_insert(&key) {
            info!(
                event_name = "escalation.dispatch.suppressed",
                session_id = %request.session_id,
                trace_id = %request.trace_id,
                reason = %request.reason,
                "escalation already in flight for session, skipping notification"
            );
            return EscalationOutcome {
                soft_message: self.soft_message.clone(),
                dispatch: DispatchStatus::Suppressed,
                task: None,
            };
        }

        info!(
            event_name = "escalation.dispatch.started",
            session_id = %request.session_id,
            trace_id = %request.trace_id,
            level = request.level.as_str(),
            reason = %request.reason,
            "dispatching operator notification"
        );

        let notification = EscalationNotification {
            session_id: request.session_id,
            trace_id: request.trace_id,
            level: request.level,
            reason: request.reason,
            state: request.state,
            confidence: request.confidence,
            input_ref: request.input_ref,
            attachment_urls: request.attachment_urls,
            occurred_at: Utc::now(),
        };
        let active = Arc::clone(&self.active);
        let notifier = Arc::clone(&self.notifier);
        let breaker = self.breakers.get_or_create(NOTIFICATION_DEPENDENCY);

        let task = tokio::spawn(async move {
            if !breaker.can_execute() {
                warn!(
                    event_name = "escalation.notification.skipped",
                    session_id = %notification.session_id,
                    trace_id = %notification.trace_id,
                    "notification channel circuit is open"
                );
                active.release(&key);
                return;
            }
            match notifier.notify(&notification).await {
                Ok(()) => {
                    breaker.record_success();
                    info!(
                        event_name = "escalation.notification.delivered",
                        session_id = %notification.session_id,
                        trace_id = %notification.trace_id,
                        "operator notified"
                    );
                }
                Err(error) => {
                    breaker.record_failure(&error.to_string());
                    // Let the next trigger for this session try again.
                    active.release(&key);
                    warn!(
                        event_name = "escalation.notification.failed",
                        session_id = %notification.session_id,
                        trace_id = %notification.trace_id,
                        error = %error,
                        "operator notification failed"
                    );
                }
            }
        });

        EscalationOutcome {
            soft_message: self.soft_message.clone(),
            dispatch: DispatchStatus::Dispatched,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use closer_core::breaker::CircuitBreakerRegistry;
    use closer_core::escalation::{ActiveEscalations, EscalationLevel};
    use closer_core::flows::FlowState;

    use super::{DispatchStatus, EscalationController, EscalationRequest};
    use crate::notify::{EscalationNotification, NotificationSender};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSender for Counting {
        async fn notify(&self, _notification: &EscalationNotification) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("webhook returned 500");
            }
            Ok(())
        }
    }

    fn controller(sender: Arc<Counting>) -> EscalationController {
        EscalationController::new(
            Arc::new(ActiveEscalations::new(16, Duration::from_secs(600))),
            sender,
            Arc::new(CircuitBreakerRegistry::default()),
            "One moment, I'm checking availability for you.",
        )
    }

    fn request(session: &str) -> EscalationRequest {
        EscalationRequest {
            session_id: session.to_string(),
            trace_id: "trace-esc".to_string(),
            level: EscalationLevel::Hard,
            reason: "vision_low_confidence".to_string(),
            state: FlowState::Vision,
            confidence: Some(0.42),
            input_ref: "what is this?".to_string(),
            attachment_urls: vec!["https://cdn.example.com/p.jpg".to_string()],
        }
    }

    #[tokio::test]
    async fn duplicate_trigger_dispatches_once() {
        let sender = Arc::new(Counting::default());
        let controller = controller(sender.clone());

        let first = controller.escalate(request("s1"));
        let second = controller.escalate(request("s1"));

        assert_eq!(first.dispatch, DispatchStatus::Dispatched);
        assert_eq!(second.dispatch, DispatchStatus::Suppressed);
        assert_eq!(first.soft_message, second.soft_message);
        first.task.expect("spawned").await.expect("task completes");
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);

        let other = controller.escalate(request("s2"));
        assert_eq!(other.dispatch, DispatchStatus::Dispatched);
    }

    #[tokio::test]
    async fn failed_notification_does_not_surface_and_frees_the_session() {
        let sender = Arc::new(Counting { fail: true, ..Counting::default() });
        let controller = controller(sender.clone());

        let first = controller.escalate(request("s1"));
        assert!(!first.soft_message.is_empty());
        first.task.expect("spawned").await.expect("task completes");

        let retry = controller.escalate(request("s1"));
        assert_eq!(retry.dispatch, DispatchStatus::Dispatched);
        retry.task.expect("spawned").await.expect("task completes");
        assert_eq!(sender.calls.load(Ordering::SeqCst), 2);
    }
}
