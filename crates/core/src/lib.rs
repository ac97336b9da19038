pub mod audit;
pub mod breaker;
pub mod catalog;
pub mod compaction;
pub mod config;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod flows;
pub mod ledger;
pub mod store;
pub mod validation;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use catalog::{CatalogLookup, InMemoryCatalog};
pub use compaction::{compact, CompactionReport};
pub use domain::approval::{ApprovalDecision, ApprovalId, ApprovalKind, ApprovalRequest};
pub use domain::conversation::{
    ApprovalChange, Attachment, ConversationState, Message, Role, SessionId, StateDelta,
};
pub use domain::customer::CustomerContact;
pub use domain::idempotency::{ContentHash, IdempotencyRecord, IdempotencyStatus};
pub use domain::product::{Product, ProductId};
pub use domain::response::AgentResponse;
pub use errors::{ApplicationError, DomainError, ErrorCategory, InterfaceError};
pub use escalation::{ActiveEscalations, EscalationLevel, EscalationSignal};
pub use flows::{DialogPhase, FlowGuard, FlowState};
pub use ledger::{IdempotencyLedger, LedgerKey, LedgerOutcome};
pub use store::{ConversationStore, IdempotencyStore, Reservation, StoreError};
pub use validation::{ValidationContext, ValidationError, ValidationGate};
