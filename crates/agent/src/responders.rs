//! State responders: one generator per conversation state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use closer_core::domain::approval::{ApprovalDecision, ApprovalKind, ApprovalRequest};
use closer_core::domain::conversation::{Attachment, ConversationState};
use closer_core::domain::response::AgentResponse;
use closer_core::flows::{DialogPhase, FlowState};

use crate::intent::IntentClassification;

/// A human decision handed back to the responder that asked for it.
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalResume {
    pub request: ApprovalRequest,
    pub decision: ApprovalDecision,
}

#[derive(Clone, Debug)]
pub struct ResponderRequest<'a> {
    pub state: &'a ConversationState,
    /// The state whose responder was selected; may differ from `state.current_state`.
    pub route: FlowState,
    pub user_input: &'a str,
    pub attachments: &'a [Attachment],
    pub intent: Option<&'a IntentClassification>,
    /// Validation feedback from the previous attempt in this turn.
    pub feedback: Option<&'a str>,
    pub approval: Option<&'a ApprovalResume>,
    /// Result of [`Responder::perform`] for this turn, identical on every attempt.
    pub effect: Option<&'a Value>,
    pub trace_id: &'a str,
}

impl ResponderRequest<'_> {
    pub fn session_id(&self) -> &str {
        self.state.session_id.as_str()
    }

    pub fn image_urls(&self) -> Vec<&str> {
        self.attachments
            .iter()
            .filter(|attachment| attachment.is_image())
            .map(|attachment| attachment.url.as_str())
            .collect()
    }
}

/// Suspension requested by a responder instead of a final reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub kind: ApprovalKind,
    pub summary: String,
    pub payload: Value,
    /// Shown to the customer while the operator decides.
    pub holding_message: String,
    pub dialog_phase: DialogPhase,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponderOutput {
    Reply(Box<AgentResponse>),
    Interrupt(InterruptRequest),
    /// The generator answered, but not with a usable structured response.
    Malformed { reason: String },
}

impl ResponderOutput {
    pub fn reply(response: AgentResponse) -> Self {
        Self::Reply(Box::new(response))
    }
}

/// Identifies the logical input of a side-effecting call for the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideEffect {
    pub operation: &'static str,
    pub parts: Vec<String>,
    /// The effect lives in [`Responder::perform`] and runs once before any
    /// reply attempt; otherwise the `respond` call itself is the effect.
    pub staged: bool,
}

#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Name of the circuit breaker guarding this responder's dependency.
    fn dependency(&self) -> &'static str {
        "llm"
    }

    /// `Some` when this request would trigger an expensive or external side effect.
    fn side_effect(&self, _request: &ResponderRequest<'_>) -> Option<SideEffect> {
        None
    }

    /// Runs a staged side effect. Called at most once per acquired ledger key.
    async fn perform(&self, _request: &ResponderRequest<'_>) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn respond(&self, request: &ResponderRequest<'_>) -> Result<ResponderOutput>;
}

#[derive(Default)]
pub struct ResponderRegistry {
    responders: HashMap<FlowState, Arc<dyn Responder>>,
    fallback: Option<Arc<dyn Responder>>,
}

impl ResponderRegistry {
    pub fn register<R>(&mut self, state: FlowState, responder: R)
    where
        R: Responder + 'static,
    {
        self.responders.insert(state, Arc::new(responder));
    }

    pub fn register_shared(&mut self, state: FlowState, responder: Arc<dyn Responder>) {
        self.responders.insert(state, responder);
    }

    /// Used for any state without a dedicated responder.
    pub fn set_fallback(&mut self, responder: Arc<dyn Responder>) {
        self.fallback = Some(responder);
    }

    pub fn get(&self, state: FlowState) -> Option<Arc<dyn Responder>> {
        self.responders.get(&state).cloned().or_else(|| self.fallback.clone())
    }

    pub fn len(&self) -> usize {
        self.responders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty() && self.fallback.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmission {
    pub session_id: String,
    pub approval_id: String,
    pub payload: Value,
}

/// External order/CRM sink. Called at most once per approved payment.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    async fn submit(&self, order: &OrderSubmission) -> Result<String>;
}

/// Assigns a local order id and logs the submission. Used when no CRM is wired in.
#[derive(Clone, Debug, Default)]
pub struct LoggingOrderSubmitter;

#[async_trait]
impl OrderSubmitter for LoggingOrderSubmitter {
    async fn submit(&self, order: &OrderSubmission) -> Result<String> {
        let order_id = format!("ORD-{}", Uuid::new_v4().simple());
        info!(
            event_name = "agent.order.submitted",
            session_id = %order.session_id,
            approval_id = %order.approval_id,
            order_id = %order_id,
            "order recorded locally"
        );
        Ok(order_id)
    }
}

const PAID_TERMS: &[&str] = &["paid", "payment done", "transferred", "sent the money", "receipt"];

/// Payment collection. Delegates ordinary turns to `inner`, suspends for an
/// operator when the customer reports a payment, and submits the order in
/// `perform` once the payment is approved. `respond` only phrases the result.
pub struct PaymentResponder {
    inner: Arc<dyn Responder>,
    orders: Arc<dyn OrderSubmitter>,
}

impl PaymentResponder {
    pub fn new(inner: Arc<dyn Responder>, orders: Arc<dyn OrderSubmitter>) -> Self {
        Self { inner, orders }
    }

    fn reports_payment(request: &ResponderRequest<'_>) -> bool {
        let waiting = request.state.dialog_phase.as_str() == DialogPhase::WAITING_FOR_PAYMENT_PROOF;
        let input = request.user_input.to_lowercase();
        let mentions_payment = PAID_TERMS.iter().any(|term| input.contains(term));
        waiting && (mentions_payment || !request.image_urls().is_empty())
    }

    fn order_payload(state: &ConversationState) -> Value {
        json!({
            "products": state.selected_products,
            "customer": state.customer,
        })
    }
}

#[async_trait]
impl Responder for PaymentResponder {
    fn name(&self) -> &'static str {
        "payment"
    }

    fn dependency(&self) -> &'static str {
        "orders"
    }

    fn side_effect(&self, request: &ResponderRequest<'_>) -> Option<SideEffect> {
        let resume = request.approval?;
        resume.decision.approved.then(|| SideEffect {
            operation: "order_submission",
            parts: vec![resume.request.id.0.clone()],
            staged: true,
        })
    }

    async fn perform(&self, request: &ResponderRequest<'_>) -> Result<Option<Value>> {
        let Some(resume) = request.approval.filter(|resume| resume.decision.approved) else {
            return Ok(None);
        };
        let order_id = self
            .orders
            .submit(&OrderSubmission {
                session_id: request.session_id().to_string(),
                approval_id: resume.request.id.0.clone(),
                payload: resume.request.payload.clone(),
            })
            .await?;
        Ok(Some(json!({ "order_id": order_id })))
    }

    async fn respond(&self, request: &ResponderRequest<'_>) -> Result<ResponderOutput> {
        let session_id = request.session_id();

        if let Some(resume) = request.approval {
            if !resume.decision.approved {
                let response = AgentResponse::reply(
                    session_id,
                    FlowState::PaymentDelivery,
                    "We could not confirm the payment yet. Could you send the receipt again?",
                )
                .with_phase(DialogPhase::WAITING_FOR_PAYMENT_PROOF);
                return Ok(ResponderOutput::reply(response));
            }

            let order_id = request
                .effect
                .and_then(|effect| effect.get("order_id"))
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("approved payment has no submitted order"))?;
            let mut response = AgentResponse::reply(
                session_id,
                FlowState::Upsell,
                format!("Payment confirmed, thank you! Your order number is {order_id}."),
            )
            .with_phase("UPSELL_OFFERED");
            response.metadata.insert("order_id".to_string(), json!(order_id));
            response.metadata.insert("payment_confirmed".to_string(), json!(true));
            return Ok(ResponderOutput::reply(response));
        }

        if Self::reports_payment(request) {
            return Ok(ResponderOutput::Interrupt(InterruptRequest {
                kind: ApprovalKind::PaymentConfirmation,
                summary: format!(
                    "Customer in session {session_id} reports a payment for {} item(s)",
                    request.state.selected_products.len()
                ),
                payload: Self::order_payload(request.state),
                holding_message: "Thank you! We are checking your payment, this usually takes a few minutes."
                    .to_string(),
                dialog_phase: DialogPhase::new(DialogPhase::AWAITING_PAYMENT_APPROVAL),
            }));
        }

        self.inner.respond(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use closer_core::domain::approval::{ApprovalDecision, ApprovalId, ApprovalKind, ApprovalRequest};
    use closer_core::domain::conversation::{Attachment, ConversationState, SessionId};
    use closer_core::domain::response::AgentResponse;
    use closer_core::flows::{DialogPhase, FlowState};

    use super::{
        ApprovalResume, OrderSubmission, OrderSubmitter, PaymentResponder, Responder,
        ResponderOutput, ResponderRegistry, ResponderRequest,
    };

    struct Echo;

    #[async_trait]
    impl Responder for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn respond(&self, request: &ResponderRequest<'_>) -> Result<ResponderOutput> {
            Ok(ResponderOutput::reply(AgentResponse::reply(
                request.session_id(),
                request.route,
                request.user_input,
            )))
        }
    }

    #[derive(Default)]
    struct CountingOrders {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OrderSubmitter for CountingOrders {
        async fn submit(&self, _order: &OrderSubmission) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("ORD-{call}"))
        }
    }

    fn waiting_for_proof() -> ConversationState {
        let mut state = ConversationState::new("s-pay");
        state.current_state = FlowState::PaymentDelivery;
        state.dialog_phase = DialogPhase::from(DialogPhase::WAITING_FOR_PAYMENT_PROOF);
        state
    }

    fn request<'a>(
        state: &'a ConversationState,
        input: &'a str,
        attachments: &'a [Attachment],
        approval: Option<&'a ApprovalResume>,
    ) -> ResponderRequest<'a> {
        ResponderRequest {
            state,
            route: FlowState::PaymentDelivery,
            user_input: input,
            attachments,
            intent: None,
            feedback: None,
            approval,
            effect: None,
            trace_id: "trace-1",
        }
    }

    fn resume(approved: bool) -> ApprovalResume {
        ApprovalResume {
            request: ApprovalRequest {
                id: ApprovalId("apr-9".to_string()),
                session_id: SessionId("s-pay".to_string()),
                kind: ApprovalKind::PaymentConfirmation,
                resume_state: FlowState::PaymentDelivery,
                user_input: "paid".to_string(),
                attachments: Vec::new(),
                summary: "payment".to_string(),
                payload: json!({}),
                requested_at: Utc::now(),
            },
            decision: if approved {
                ApprovalDecision::approve("op-1")
            } else {
                ApprovalDecision::reject("op-1", "no receipt")
            },
        }
    }

    #[test]
    fn registry_falls_back_for_unregistered_states() {
        let mut registry = ResponderRegistry::default();
        assert!(registry.is_empty());
        registry.register(FlowState::Discovery, Echo);
        assert!(registry.get(FlowState::Offer).is_none());

        registry.set_fallback(Arc::new(Echo));
        assert_eq!(registry.get(FlowState::Offer).map(|r| r.name()), Some("echo"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn reported_payment_interrupts_for_approval() {
        let responder = PaymentResponder::new(Arc::new(Echo), Arc::new(CountingOrders::default()));
        let state = waiting_for_proof();
        let attachments = [Attachment::image("https://cdn.example.com/receipt.jpg")];

        let output = responder
            .respond(&request(&state, "here is the receipt", &attachments, None))
            .await
            .expect("respond");

        let ResponderOutput::Interrupt(interrupt) = output else {
            panic!("expected interrupt, got {output:?}");
        };
        assert_eq!(interrupt.kind, ApprovalKind::PaymentConfirmation);
        assert_eq!(interrupt.dialog_phase.as_str(), DialogPhase::AWAITING_PAYMENT_APPROVAL);
    }

    #[tokio::test]
    async fn approved_resume_submits_order_and_declares_side_effect() {
        let orders = Arc::new(CountingOrders::default());
        let responder = PaymentResponder::new(Arc::new(Echo), orders.clone());
        let state = waiting_for_proof();
        let approved = resume(true);
        let req = request(&state, "paid", &[], Some(&approved));

        let side_effect = responder.side_effect(&req).expect("approved payment has a side effect");
        assert_eq!(side_effect.operation, "order_submission");
        assert_eq!(side_effect.parts, vec!["apr-9".to_string()]);
        assert!(side_effect.staged);

        let effect = responder.perform(&req).await.expect("perform").expect("order submitted");
        assert_eq!(effect, json!({"order_id": "ORD-1"}));

        let with_effect = ResponderRequest { effect: Some(&effect), ..req.clone() };
        for _ in 0..3 {
            let ResponderOutput::Reply(response) =
                responder.respond(&with_effect).await.expect("respond")
            else {
                panic!("expected reply");
            };
            assert_eq!(response.next_state, FlowState::Upsell);
            assert_eq!(response.metadata.get("order_id"), Some(&json!("ORD-1")));
        }
        assert_eq!(orders.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn approved_reply_without_submitted_order_is_an_error() {
        let orders = Arc::new(CountingOrders::default());
        let responder = PaymentResponder::new(Arc::new(Echo), orders.clone());
        let state = waiting_for_proof();
        let approved = resume(true);

        let result = responder.respond(&request(&state, "paid", &[], Some(&approved))).await;

        assert!(result.is_err());
        assert_eq!(orders.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_resume_asks_for_proof_again_without_side_effect() {
        let orders = Arc::new(CountingOrders::default());
        let responder = PaymentResponder::new(Arc::new(Echo), orders.clone());
        let state = waiting_for_proof();
        let rejected = resume(false);
        let req = request(&state, "paid", &[], Some(&rejected));

        assert!(responder.side_effect(&req).is_none());
        assert!(responder.perform(&req).await.expect("perform").is_none());
        let ResponderOutput::Reply(response) = responder.respond(&req).await.expect("respond") else {
            panic!("expected reply");
        };
        assert_eq!(
            response.dialog_phase.as_ref().map(DialogPhase::as_str),
            Some(DialogPhase::WAITING_FOR_PAYMENT_PROOF)
        );
        assert_eq!(orders.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ordinary_payment_turns_delegate_to_inner() {
        let responder = PaymentResponder::new(Arc::new(Echo), Arc::new(CountingOrders::default()));
        let mut state = waiting_for_proof();
        state.dialog_phase = DialogPhase::from("WAITING_FOR_DELIVERY_DATA");

        let output = responder
            .respond(&request(&state, "Lviv, branch 12", &[], None))
            .await
            .expect("respond");
        assert!(matches!(output, ResponderOutput::Reply(ref r) if r.messages == ["Lviv, branch 12"]));
    }
}
