//! Agent runtime: the per-turn pipeline that answers a customer message.
//!
//! Each turn runs a fixed sequence of nodes:
//! 1. **Moderation** (`moderation`) - block unsafe input before anything else runs
//! 2. **Intent** (`intent`) - best-effort classification used for routing
//! 3. **Responder** (`responders`, `llm`) - the state handler produces a structured reply
//! 4. **Validation** - replies go through the core gate, with bounded retries
//! 5. **Escalation** (`escalation`) - neutral reply to the customer, background
//!    notification to an operator
//!
//! Side-effecting responders run through the idempotency ledger, dependency
//! calls through circuit breakers (`resilience`). A responder may suspend the
//! turn for operator approval; `runtime` persists the suspension and resumes it.
//!
//! # Safety Principle
//!
//! The LLM only drafts replies. Prices, state transitions and escalation
//! decisions are checked deterministically before anything reaches the customer.

pub mod escalation;
pub mod intent;
pub mod llm;
pub mod moderation;
pub mod notify;
pub mod pipeline;
pub mod resilience;
pub mod responders;
pub mod runtime;

pub use escalation::{DispatchStatus, EscalationController, EscalationRequest};
pub use intent::{IntentClassification, IntentClassifier, IntentKind, KeywordIntentClassifier};
pub use llm::{LlmClient, LlmResponder};
pub use moderation::{KeywordModerator, ModerationDecision, Moderator};
pub use notify::{EscalationNotification, LogNotificationSender, NotificationSender};
pub use pipeline::{PipelineComponents, PipelineExecutor, TurnDiagnostics, TurnInput, TurnOutcome};
pub use resilience::{with_circuit_breaker, CallError};
pub use responders::{
    LoggingOrderSubmitter, OrderSubmitter, PaymentResponder, Responder, ResponderOutput,
    ResponderRegistry, ResponderRequest,
};
pub use runtime::{ConversationRuntime, TurnReply};
