//! Per-turn node pipeline: moderation, intent, responder, validation, then
//! accept, retry, suspend or escalate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use closer_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use closer_core::breaker::{BreakerStatus, CircuitBreakerRegistry};
use closer_core::catalog::CatalogLookup;
use closer_core::config::AppConfig;
use closer_core::domain::approval::{ApprovalDecision, ApprovalId, ApprovalRequest};
use closer_core::domain::conversation::{
    ApprovalChange, Attachment, ConversationState, Message, Role, StateDelta,
};
use closer_core::domain::idempotency::{IdempotencyRecord, IdempotencyStatus};
use closer_core::domain::response::AgentResponse;
use closer_core::errors::{DomainError, ErrorCategory};
use closer_core::escalation::{ActiveEscalations, EscalationLevel, VisionDecision, VisionEscalationPolicy};
use closer_core::flows::{DialogPhase, FlowGuard, FlowState, GuardResolution};
use closer_core::ledger::{IdempotencyLedger, LedgerKey, LedgerOutcome};
use closer_core::validation::{ValidationContext, ValidationError, ValidationGate, UNPARSEABLE_RESPONSE};

use crate::escalation::{DispatchStatus, EscalationController, EscalationRequest};
use crate::intent::{IntentClassification, IntentClassifier, IntentKind};
use crate::moderation::{ModerationDecision, Moderator};
use crate::notify::NotificationSender;
use crate::resilience::{with_circuit_breaker, CallError};
use crate::responders::{
    ApprovalResume, InterruptRequest, ResponderOutput, ResponderRegistry, ResponderRequest,
};

pub const VISION_NO_MATCH_KEY: &str = "vision_no_match_count";
pub const LAST_INTENT_KEY: &str = "last_intent";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnInput {
    pub user_input: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TurnInput {
    pub fn text(user_input: impl Into<String>) -> Self {
        Self { user_input: user_input.into(), attachments: Vec::new() }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    fn has_image(&self) -> bool {
        self.attachments.iter().any(Attachment::is_image)
    }
}

/// Internal trace of one turn. Logged and returned to callers, never shown to the customer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnDiagnostics {
    pub trace_id: String,
    pub route: Option<FlowState>,
    pub responder: Option<String>,
    pub intent: Option<IntentClassification>,
    pub attempts: u32,
    pub error_category: Option<ErrorCategory>,
    pub validation_errors: Vec<ValidationError>,
    pub breaker: Option<BreakerStatus>,
    pub guard: Option<GuardResolution>,
    pub ledger_hash: Option<String>,
    pub ledger_outcome: Option<String>,
    /// Result of a staged side effect performed this turn.
    pub side_effect: Option<serde_json::Value>,
    pub escalation_dispatch: Option<DispatchStatus>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub delta: StateDelta,
    pub messages: Vec<String>,
    pub next_state: FlowState,
    pub dialog_phase: DialogPhase,
    pub escalate: bool,
    pub escalation_reason: Option<String>,
    pub awaiting_approval: bool,
    pub diagnostics: TurnDiagnostics,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub responder_timeout: Duration,
    pub intent_reroute_confidence: f64,
    pub holding_message: String,
    pub vision_policy: VisionEscalationPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            responder_timeout: config.pipeline.responder_timeout(),
            intent_reroute_confidence: config.pipeline.intent_reroute_confidence,
            holding_message: config.pipeline.holding_message.clone(),
            vision_policy: config.escalation.vision_policy(),
        }
    }
}

/// Collaborators wired into the executor.
pub struct PipelineComponents {
    pub moderator: Arc<dyn Moderator>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub responders: ResponderRegistry,
    pub ledger: IdempotencyLedger,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub notifier: Arc<dyn NotificationSender>,
    pub catalog: Option<Arc<dyn CatalogLookup>>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct PipelineExecutor {
    moderator: Arc<dyn Moderator>,
    classifier: Arc<dyn IntentClassifier>,
    responders: ResponderRegistry,
    ledger: IdempotencyLedger,
    breakers: Arc<CircuitBreakerRegistry>,
    catalog: Option<Arc<dyn CatalogLookup>>,
    audit: Arc<dyn AuditSink>,
    gate: ValidationGate,
    guard: FlowGuard,
    escalation: EscalationController,
    settings: PipelineSettings,
}

/// Mutable per-turn bookkeeping.
struct Turn<'a> {
    state: &'a ConversationState,
    audit: AuditContext,
    delta: StateDelta,
    diagnostics: TurnDiagnostics,
}

enum Attempt {
    Accepted(AgentResponse),
    Interrupted(InterruptRequest),
    Unavailable(CallError),
    Exhausted(Vec<ValidationError>),
}

struct PendingEscalation {
    level: EscalationLevel,
    reason: String,
    confidence: Option<f64>,
}

impl PipelineExecutor {
    pub fn new(config: &AppConfig, components: PipelineComponents) -> Self {
        let active = Arc::new(ActiveEscalations::new(
            config.escalation.dedupe_capacity,
            config.escalation.suppression_window(),
        ));
        let escalation = EscalationController::new(
            active,
            components.notifier,
            Arc::clone(&components.breakers),
            config.escalation.soft_message.clone(),
        );
        Self {
            moderator: components.moderator,
            classifier: components.classifier,
            responders: components.responders,
            ledger: components.ledger,
            breakers: components.breakers,
            catalog: components.catalog,
            audit: components.audit,
            gate: ValidationGate::new(config.validation.clone(), config.pipeline.max_retries),
            guard: FlowGuard::new(),
            escalation,
            settings: PipelineSettings::from_config(config),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub async fn process_turn(&self, state: &ConversationState, input: TurnInput) -> TurnOutcome {
        let trace_id = Uuid::new_v4().to_string();
        let mut turn = Turn::new(state, &trace_id);
        turn.delta.appended_messages.push(Message::user(input.user_input.clone()));

        info!(
            event_name = "pipeline.turn.started",
            session_id = %state.session_id,
            trace_id = %trace_id,
            current_state = %state.current_state,
            attachments = input.attachments.len(),
            "processing turn"
        );

        if state.pending_approval.is_some() {
            info!(
                event_name = "pipeline.turn.awaiting_approval",
                session_id = %state.session_id,
                trace_id = %trace_id,
                "approval outstanding, replying with holding message"
            );
            let holding = self.settings.holding_message.clone();
            return turn.finish(vec![holding]);
        }

        let decision = match self.moderator.moderate(&input.user_input).await {
            Ok(decision) => decision,
            Err(error) => {
                warn!(
                    event_name = "pipeline.moderation.unavailable",
                    session_id = %state.session_id,
                    trace_id = %trace_id,
                    error = %error,
                    "moderation failed, blocking turn"
                );
                ModerationDecision::block("moderation_unavailable")
            }
        };
        if let ModerationDecision::Block { reason_code } = decision {
            return self.block_turn(turn, &input, &reason_code).await;
        }
        self.emit(&turn, "moderation.allowed", AuditCategory::Moderation, AuditOutcome::Success, &[]);

        let intent = match self.classifier.classify(&input.user_input, input.has_image(), state).await {
            Ok(intent) => Some(intent),
            Err(error) => {
                warn!(
                    event_name = "pipeline.intent.failed",
                    session_id = %state.session_id,
                    trace_id = %trace_id,
                    error = %error,
                    "intent classification failed, continuing without intent"
                );
                None
            }
        };
        if let Some(intent) = &intent {
            turn.delta.metadata.insert(LAST_INTENT_KEY.to_string(), json!(intent.intent.as_str()));
            turn.diagnostics.intent = Some(intent.clone());
        }

        let route = self.route(state, intent.as_ref(), input.has_image());
        let base = ResponderRequest {
            state,
            route,
            user_input: &input.user_input,
            attachments: &input.attachments,
            intent: intent.as_ref(),
            feedback: None,
            approval: None,
            effect: None,
            trace_id: &trace_id,
        };
        self.run_responder(turn, base).await
    }

    /// Re-enters the pipeline at the responder that requested approval.
    pub async fn resume_turn(
        &self,
        state: &ConversationState,
        decision: ApprovalDecision,
    ) -> Result<TurnOutcome, DomainError> {
        let Some(pending) = state.pending_approval.clone() else {
            return Err(DomainError::NoPendingApproval(state.session_id.to_string()));
        };

        let trace_id = Uuid::new_v4().to_string();
        let mut turn = Turn::new(state, &trace_id);
        turn.delta.approval = ApprovalChange::Clear;
        let verdict = if decision.approved { "approved" } else { "rejected" };
        let mut note = format!("{} {verdict}", pending.kind.as_str());
        if let Some(operator) = &decision.operator {
            note.push_str(&format!(" by {operator}"));
        }
        if let Some(comment) = &decision.note {
            note.push_str(&format!(": {comment}"));
        }
        turn.delta.appended_messages.push(Message::new(Role::Operator, note));

        info!(
            event_name = "pipeline.turn.resumed",
            session_id = %state.session_id,
            trace_id = %trace_id,
            approval_id = %pending.id.0,
            approved = decision.approved,
            "resuming suspended turn"
        );
        self.emit(
            &turn,
            "approval.decided",
            AuditCategory::Approval,
            if decision.approved { AuditOutcome::Success } else { AuditOutcome::Rejected },
            &[("approval_id", pending.id.0.clone())],
        );

        let resume = ApprovalResume { request: pending, decision };
        let base = ResponderRequest {
            state,
            route: resume.request.resume_state,
            user_input: &resume.request.user_input,
            attachments: &resume.request.attachments,
            intent: None,
            feedback: None,
            approval: Some(&resume),
            effect: None,
            trace_id: &trace_id,
        };
        Ok(self.run_responder(turn, base).await)
    }

    fn route(
        &self,
        state: &ConversationState,
        intent: Option<&IntentClassification>,
        has_image: bool,
    ) -> FlowState {
        let confident = intent
            .filter(|intent| intent.confidence >= self.settings.intent_reroute_confidence)
            .map(|intent| intent.intent);
        match confident {
            Some(IntentKind::Complaint) => return FlowState::Complaint,
            Some(IntentKind::OutOfDomain) => return FlowState::OutOfDomain,
            _ => {}
        }
        if has_image && matches!(state.current_state, FlowState::Init | FlowState::Discovery) {
            return FlowState::Vision;
        }
        state.current_state
    }

    async fn block_turn(&self, mut turn: Turn<'_>, input: &TurnInput, reason_code: &str) -> TurnOutcome {
        let state = turn.state;
        warn!(
            event_name = "pipeline.moderation.blocked",
            session_id = %state.session_id,
            trace_id = %turn.audit.trace_id,
            reason_code = %reason_code,
            "moderation blocked turn"
        );
        self.emit(
            &turn,
            "moderation.blocked",
            AuditCategory::Moderation,
            AuditOutcome::Rejected,
            &[("reason_code", reason_code.to_string())],
        );

        let mut parts = vec![input.user_input.as_str()];
        parts.extend(input.attachments.iter().map(|attachment| attachment.url.as_str()));
        let key = LedgerKey::new(&state.session_id, "moderation", &parts);
        if let Err(error) = self
            .ledger
            .record_result(&key, IdempotencyStatus::Blocked, Some(json!({"reason_code": reason_code})))
            .await
        {
            warn!(
                event_name = "pipeline.ledger.record_failed",
                session_id = %state.session_id,
                error = %error,
                "could not record blocked input"
            );
        }
        turn.diagnostics.ledger_hash = Some(key.hash.to_string());

        turn.diagnostics.error_category = Some(ErrorCategory::Safety);
        let escalation = PendingEscalation {
            level: EscalationLevel::Hard,
            reason: format!("moderation_blocked:{reason_code}"),
            confidence: None,
        };
        self.escalate_without_reply(turn, escalation, input.user_input.clone(), &input.attachments)
    }

    async fn run_responder(&self, mut turn: Turn<'_>, base: ResponderRequest<'_>) -> TurnOutcome {
        let state = turn.state;
        turn.diagnostics.route = Some(base.route);

        let Some(responder) = self.responders.get(base.route) else {
            error!(
                event_name = "pipeline.responder.missing",
                session_id = %state.session_id,
                route = %base.route,
                "no responder registered for state"
            );
            turn.diagnostics.error_category = Some(ErrorCategory::Dependency);
            let escalation = PendingEscalation {
                level: EscalationLevel::Hard,
                reason: "no_responder".to_string(),
                confidence: None,
            };
            return self.escalate_without_reply(
                turn,
                escalation,
                base.user_input.to_string(),
                base.attachments,
            );
        };
        turn.diagnostics.responder = Some(responder.name().to_string());
        let breaker = self.breakers.get_or_create(responder.dependency());

        let side_effect = responder.side_effect(&base);
        let ledger_key = side_effect.as_ref().map(|effect| {
            let parts = effect.parts.iter().map(String::as_str).collect::<Vec<_>>();
            LedgerKey::new(&state.session_id, effect.operation, &parts)
        });
        if let Some(key) = &ledger_key {
            turn.diagnostics.ledger_hash = Some(key.hash.to_string());
            match self.ledger.begin(key).await {
                Ok(LedgerOutcome::Acquired(_)) => {
                    turn.diagnostics.ledger_outcome = Some("acquired".to_string());
                }
                Ok(LedgerOutcome::Completed(record)) => {
                    return self.replay(turn, record, &base).await;
                }
                Ok(LedgerOutcome::InFlight(_)) => {
                    turn.diagnostics.ledger_outcome = Some("in_flight".to_string());
                    turn.diagnostics.error_category = Some(ErrorCategory::IdempotencyConflict);
                    let holding = self.settings.holding_message.clone();
                    return turn.finish(vec![holding]);
                }
                Err(error) => {
                    warn!(
                        event_name = "pipeline.ledger.unavailable",
                        session_id = %state.session_id,
                        trace_id = %turn.audit.trace_id,
                        error = %error,
                        "idempotency ledger unavailable, refusing side effect"
                    );
                    turn.diagnostics.error_category = Some(ErrorCategory::Dependency);
                    let escalation = PendingEscalation {
                        level: EscalationLevel::Hard,
                        reason: "ledger_unavailable".to_string(),
                        confidence: None,
                    };
                    return self.escalate_without_reply(
                        turn,
                        escalation,
                        base.user_input.to_string(),
                        base.attachments,
                    );
                }
            }
        }

        let staged = side_effect.as_ref().is_some_and(|effect| effect.staged);
        let effect = match &ledger_key {
            Some(key) if staged => {
                match with_circuit_breaker(
                    &breaker,
                    self.settings.responder_timeout,
                    responder.perform(&base),
                )
                .await
                {
                    Ok(effect) => {
                        if let Some(result) = &effect {
                            // Settled before the first reply attempt.
                            self.settle(
                                Some(key),
                                IdempotencyStatus::Processed,
                                Some(json!({ "effect": result })),
                            )
                            .await;
                            info!(
                                event_name = "pipeline.side_effect.performed",
                                session_id = %state.session_id,
                                trace_id = %turn.audit.trace_id,
                                responder = responder.name(),
                                hash = %key.hash,
                                "staged side effect performed"
                            );
                        }
                        effect
                    }
                    Err(call_error) => {
                        warn!(
                            event_name = "pipeline.side_effect.failed",
                            session_id = %state.session_id,
                            trace_id = %turn.audit.trace_id,
                            responder = responder.name(),
                            error = %call_error,
                            "staged side effect failed"
                        );
                        self.settle(Some(key), IdempotencyStatus::Failed, None).await;
                        turn.diagnostics.breaker = Some(breaker.get_status());
                        turn.diagnostics.error_category = Some(ErrorCategory::Dependency);
                        let escalation = PendingEscalation {
                            level: EscalationLevel::Hard,
                            reason: call_error.code().to_string(),
                            confidence: None,
                        };
                        return self.escalate_without_reply(
                            turn,
                            escalation,
                            base.user_input.to_string(),
                            base.attachments,
                        );
                    }
                }
            }
            _ => None,
        };
        turn.diagnostics.side_effect = effect.clone();
        // Once the effect has run its record stays PROCESSED whatever the reply does.
        let open_key = if effect.is_some() { None } else { ledger_key.as_ref() };

        let context = ValidationContext { session_id: state.session_id.as_str() };
        let mut retry_count = 0_u32;
        let mut feedback: Option<String> = None;
        let attempt = loop {
            turn.diagnostics.attempts += 1;
            let request = ResponderRequest {
                feedback: feedback.as_deref(),
                effect: effect.as_ref(),
                ..base.clone()
            };
            let output = with_circuit_breaker(
                &breaker,
                self.settings.responder_timeout,
                responder.respond(&request),
            )
            .await;

            let errors = match output {
                Err(call_error) if call_error.is_open() => break Attempt::Unavailable(call_error),
                Err(call_error) => {
                    warn!(
                        event_name = "pipeline.responder.failed",
                        session_id = %state.session_id,
                        trace_id = %turn.audit.trace_id,
                        responder = responder.name(),
                        attempt = turn.diagnostics.attempts,
                        error = %call_error,
                        "responder call failed"
                    );
                    vec![ValidationError::new(
                        call_error.code(),
                        ErrorCategory::Dependency,
                        call_error.to_string(),
                    )]
                }
                Ok(ResponderOutput::Interrupt(interrupt)) => break Attempt::Interrupted(interrupt),
                Ok(ResponderOutput::Malformed { reason }) => {
                    vec![ValidationError::schema(UNPARSEABLE_RESPONSE, reason)]
                }
                Ok(ResponderOutput::Reply(response)) => {
                    let errors = self.gate.validate(&response, &context);
                    if errors.is_empty() {
                        break Attempt::Accepted(*response);
                    }
                    errors
                }
            };

            let categories = ValidationGate::categorize(&errors)
                .into_iter()
                .map(|(category, count)| format!("{}={count}", category.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            let codes =
                errors.iter().map(|error| error.code.as_str()).collect::<Vec<_>>().join(",");
            info!(
                event_name = "pipeline.validation.failed",
                session_id = %state.session_id,
                trace_id = %turn.audit.trace_id,
                attempt = turn.diagnostics.attempts,
                retry_count,
                categories = %categories,
                codes = %codes,
                "responder output rejected"
            );
            self.emit(
                &turn,
                "validation.rejected",
                AuditCategory::Validation,
                AuditOutcome::Rejected,
                &[("attempt", turn.diagnostics.attempts.to_string()), ("errors", codes)],
            );
            turn.diagnostics.error_category = ValidationGate::dominant_category(&errors);
            turn.diagnostics.validation_errors = errors.clone();

            if !self.gate.should_retry(retry_count) {
                break Attempt::Exhausted(errors);
            }
            retry_count += 1;
            let dependency_only =
                errors.iter().all(|error| error.category == ErrorCategory::Dependency);
            feedback = (!dependency_only).then(|| ValidationGate::retry_feedback(&errors));
        };

        turn.delta.retry_count = retry_count;
        turn.diagnostics.breaker = Some(breaker.get_status());

        match attempt {
            Attempt::Accepted(response) => {
                turn.diagnostics.validation_errors.clear();
                turn.diagnostics.error_category = None;
                self.accept(turn, response, ledger_key.as_ref(), &base).await
            }
            Attempt::Interrupted(interrupt) => {
                self.settle(open_key, IdempotencyStatus::Failed, None).await;
                self.suspend(turn, &base, interrupt)
            }
            Attempt::Unavailable(call_error) => {
                self.settle(open_key, IdempotencyStatus::Failed, None).await;
                turn.diagnostics.error_category = Some(ErrorCategory::Dependency);
                let escalation = PendingEscalation {
                    level: EscalationLevel::Hard,
                    reason: call_error.code().to_string(),
                    confidence: None,
                };
                self.escalate_without_reply(
                    turn,
                    escalation,
                    base.user_input.to_string(),
                    base.attachments,
                )
            }
            Attempt::Exhausted(errors) => {
                let dependency_only =
                    errors.iter().all(|error| error.category == ErrorCategory::Dependency);
                let (status, reason) = if dependency_only {
                    (IdempotencyStatus::Failed, "dependency_failed")
                } else {
                    (IdempotencyStatus::Escalated, "validation_exhausted")
                };
                warn!(
                    event_name = "pipeline.retry.exhausted",
                    session_id = %state.session_id,
                    trace_id = %turn.audit.trace_id,
                    retry_count,
                    reason,
                    "retries exhausted, escalating"
                );
                self.settle(open_key, status, Some(json!({"reason": reason}))).await;
                let escalation = PendingEscalation {
                    level: EscalationLevel::Hard,
                    reason: reason.to_string(),
                    confidence: None,
                };
                self.escalate_without_reply(
                    turn,
                    escalation,
                    base.user_input.to_string(),
                    base.attachments,
                )
            }
        }
    }

    async fn accept(
        &self,
        mut turn: Turn<'_>,
        response: AgentResponse,
        ledger_key: Option<&LedgerKey>,
        base: &ResponderRequest<'_>,
    ) -> TurnOutcome {
        let state = turn.state;
        let mut escalation: Option<PendingEscalation> = None;

        turn.delta.metadata.extend(response.metadata.clone());

        if let Some(assessment) = response.vision.clone() {
            let previous = state.metadata_u32(VISION_NO_MATCH_KEY);
            let identified = assessment
                .identified_product
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty());
            let in_catalog = match identified {
                Some(name) => self.catalog_contains(name).await,
                None => None,
            };
            let no_match = if identified.is_some() { 0 } else { previous.saturating_add(1) };
            turn.delta.metadata.insert(VISION_NO_MATCH_KEY.to_string(), json!(no_match));

            if let VisionDecision::Escalate(reason) =
                self.settings.vision_policy.evaluate(&assessment, in_catalog, previous)
            {
                escalation = Some(PendingEscalation {
                    level: EscalationLevel::Hard,
                    reason: reason.as_str().to_string(),
                    confidence: Some(assessment.confidence),
                });
            }
        }

        if escalation.is_none() {
            if let Some(signal) = &response.escalation {
                if let Some(level) = signal.normalized_level() {
                    let reason = if signal.reason.trim().is_empty() {
                        "generator_requested".to_string()
                    } else {
                        signal.reason.clone()
                    };
                    escalation = Some(PendingEscalation { level, reason, confidence: None });
                }
            }
        }

        // Only a phase declared this turn constrains the state; the stored one is kept otherwise.
        let declared_phase = response.dialog_phase.clone().filter(|phase| !phase.is_empty());
        let resolution = self.guard.resolve_with_audit(
            state.current_state,
            response.next_state,
            declared_phase.as_ref().unwrap_or(&DialogPhase::default()),
            self.audit.as_ref(),
            &turn.audit,
        );
        turn.delta.current_state = Some(resolution.state);
        if !resolution.rejected {
            turn.delta.dialog_phase = declared_phase;
        }
        turn.diagnostics.guard = Some(resolution);
        if let Some(products) = response.selected_products.clone() {
            turn.delta.selected_products = Some(products);
        }
        if let Some(customer) = response.customer.clone() {
            turn.delta.customer = Some(customer);
        }

        let hard = escalation.as_ref().filter(|pending| pending.level == EscalationLevel::Hard);
        if let Some(key) = ledger_key {
            let (status, payload) = match (hard, &turn.diagnostics.side_effect) {
                (Some(pending), Some(effect)) => (
                    IdempotencyStatus::Processed,
                    Some(json!({"effect": effect, "reason": pending.reason})),
                ),
                (Some(pending), None) => {
                    (IdempotencyStatus::Escalated, Some(json!({"reason": pending.reason})))
                }
                (None, _) => (IdempotencyStatus::Processed, serde_json::to_value(&response).ok()),
            };
            self.settle(Some(key), status, payload).await;
        }

        self.emit(
            &turn,
            "responder.accepted",
            AuditCategory::Responder,
            AuditOutcome::Success,
            &[("attempts", turn.diagnostics.attempts.to_string())],
        );

        match escalation {
            Some(pending) if pending.level == EscalationLevel::Hard => self.escalate_without_reply(
                turn,
                pending,
                base.user_input.to_string(),
                base.attachments,
            ),
            Some(pending) => {
                self.dispatch(&mut turn, pending, base.user_input.to_string(), base.attachments);
                turn.finish(response.messages)
            }
            None => turn.finish(response.messages),
        }
    }

    /// A terminal ledger record exists for this side effect.
    async fn replay(
        &self,
        mut turn: Turn<'_>,
        record: IdempotencyRecord,
        base: &ResponderRequest<'_>,
    ) -> TurnOutcome {
        info!(
            event_name = "pipeline.ledger.replayed",
            session_id = %turn.state.session_id,
            trace_id = %turn.audit.trace_id,
            hash = %record.hash,
            status = record.status.as_str(),
            "side effect already settled, replaying recorded outcome"
        );
        turn.diagnostics.ledger_outcome = Some(format!("replayed_{}", record.status.as_str()));
        turn.diagnostics.error_category = Some(ErrorCategory::IdempotencyConflict);
        self.emit(
            &turn,
            "idempotency.replayed",
            AuditCategory::Idempotency,
            AuditOutcome::Success,
            &[("status", record.status.as_str().to_string())],
        );

        let replayable = match (record.status, record.payload) {
            (IdempotencyStatus::Processed, Some(payload)) => {
                serde_json::from_value::<AgentResponse>(payload).ok()
            }
            _ => None,
        };
        if let Some(mut response) = replayable {
            // The vision outcome was already counted when the record was written.
            response.vision = None;
            return self.accept(turn, response, None, base).await;
        }
        if record.status == IdempotencyStatus::Processed {
            // Effect ran but no reply was stored: either still phrasing it or already escalated.
            let holding = self.settings.holding_message.clone();
            return turn.finish(vec![holding]);
        }

        let escalation = PendingEscalation {
            level: EscalationLevel::Hard,
            reason: "already_escalated".to_string(),
            confidence: None,
        };
        self.escalate_without_reply(turn, escalation, base.user_input.to_string(), base.attachments)
    }

    fn suspend(
        &self,
        mut turn: Turn<'_>,
        base: &ResponderRequest<'_>,
        interrupt: InterruptRequest,
    ) -> TurnOutcome {
        let state = turn.state;
        let approval = ApprovalRequest {
            id: ApprovalId(Uuid::new_v4().to_string()),
            session_id: state.session_id.clone(),
            kind: interrupt.kind,
            resume_state: base.route,
            user_input: base.user_input.to_string(),
            attachments: base.attachments.to_vec(),
            summary: interrupt.summary,
            payload: interrupt.payload,
            requested_at: Utc::now(),
        };
        info!(
            event_name = "pipeline.turn.suspended",
            session_id = %state.session_id,
            trace_id = %turn.audit.trace_id,
            approval_id = %approval.id.0,
            kind = approval.kind.as_str(),
            "waiting for operator approval"
        );
        self.emit(
            &turn,
            "approval.requested",
            AuditCategory::Approval,
            AuditOutcome::Success,
            &[("approval_id", approval.id.0.clone()), ("kind", approval.kind.as_str().to_string())],
        );

        let resolution = self.guard.resolve(state.current_state, base.route, &interrupt.dialog_phase);
        turn.delta.current_state = Some(resolution.state);
        if !resolution.rejected {
            turn.delta.dialog_phase = Some(interrupt.dialog_phase);
        }
        turn.diagnostics.guard = Some(resolution);
        turn.delta.approval = ApprovalChange::Set(Box::new(approval));
        turn.finish(vec![interrupt.holding_message])
    }

    /// Fatal path: the customer only sees the neutral soft message.
    fn escalate_without_reply(
        &self,
        mut turn: Turn<'_>,
        pending: PendingEscalation,
        input_ref: String,
        attachments: &[Attachment],
    ) -> TurnOutcome {
        let soft_message = self.dispatch(&mut turn, pending, input_ref, attachments);
        turn.finish(vec![soft_message])
    }

    fn dispatch(
        &self,
        turn: &mut Turn<'_>,
        pending: PendingEscalation,
        input_ref: String,
        attachments: &[Attachment],
    ) -> String {
        let state = turn.state;
        self.emit(
            turn,
            "escalation.triggered",
            AuditCategory::Escalation,
            AuditOutcome::Success,
            &[("level", pending.level.as_str().to_string()), ("reason", pending.reason.clone())],
        );
        turn.delta.should_escalate = true;
        turn.delta.escalation_reason = Some(pending.reason.clone());

        let outcome = self.escalation.escalate(EscalationRequest {
            session_id: state.session_id.to_string(),
            trace_id: turn.audit.trace_id.clone(),
            level: pending.level,
            reason: pending.reason,
            state: turn.delta.current_state.unwrap_or(state.current_state),
            confidence: pending.confidence,
            input_ref,
            attachment_urls: attachments.iter().map(|attachment| attachment.url.clone()).collect(),
        });
        turn.diagnostics.escalation_dispatch = Some(outcome.dispatch);
        outcome.soft_message
    }

    async fn settle(
        &self,
        key: Option<&LedgerKey>,
        status: IdempotencyStatus,
        payload: Option<serde_json::Value>,
    ) {
        let Some(key) = key else {
            return;
        };
        if let Err(error) = self.ledger.record_result(key, status, payload).await {
            warn!(
                event_name = "pipeline.ledger.record_failed",
                session_id = %key.session_id,
                hash = %key.hash,
                status = status.as_str(),
                error = %error,
                "could not settle ledger record"
            );
        }
    }

    /// `None` when there is no catalog or the lookup failed.
    async fn catalog_contains(&self, name: &str) -> Option<bool> {
        let catalog = self.catalog.as_ref()?;
        match catalog.search(name).await {
            Ok(hits) => Some(!hits.is_empty()),
            Err(error) => {
                warn!(
                    event_name = "pipeline.catalog.lookup_failed",
                    product = %name,
                    error = %error,
                    "catalog lookup failed, skipping availability check"
                );
                None
            }
        }
    }

    fn emit(
        &self,
        turn: &Turn<'_>,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, String)],
    ) {
        let mut event = AuditEvent::new(&turn.audit, event_type, category, outcome);
        for (key, value) in metadata {
            event = event.with_metadata(*key, value.clone());
        }
        self.audit.emit(event);
    }
}

impl<'a> Turn<'a> {
    fn new(state: &'a ConversationState, trace_id: &str) -> Self {
        Self {
            state,
            audit: AuditContext::new(state.session_id.as_str(), trace_id, "pipeline"),
            delta: StateDelta::default(),
            diagnostics: TurnDiagnostics { trace_id: trace_id.to_string(), ..Default::default() },
        }
    }

    fn finish(mut self, messages: Vec<String>) -> TurnOutcome {
        self.delta
            .appended_messages
            .extend(messages.iter().cloned().map(Message::assistant));
        let next_state = self.delta.current_state.unwrap_or(self.state.current_state);
        let dialog_phase =
            self.delta.dialog_phase.clone().unwrap_or_else(|| self.state.dialog_phase.clone());
        let awaiting_approval = match &self.delta.approval {
            ApprovalChange::Set(_) => true,
            ApprovalChange::Clear => false,
            ApprovalChange::Unchanged => self.state.pending_approval.is_some(),
        };

        info!(
            event_name = "pipeline.turn.completed",
            session_id = %self.state.session_id,
            trace_id = %self.diagnostics.trace_id,
            next_state = %next_state,
            dialog_phase = dialog_phase.as_str(),
            escalate = self.delta.should_escalate,
            attempts = self.diagnostics.attempts,
            retry_count = self.delta.retry_count,
            error_category = self.diagnostics.error_category.map(|category| category.as_str()),
            "turn finished"
        );

        TurnOutcome {
            messages,
            next_state,
            dialog_phase,
            escalate: self.delta.should_escalate,
            escalation_reason: self.delta.escalation_reason.clone(),
            awaiting_approval,
            diagnostics: self.diagnostics,
            delta: self.delta,
        }
    }
}
