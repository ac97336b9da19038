use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::approval::ApprovalRequest;
use crate::domain::customer::CustomerContact;
use crate::domain::product::Product;
use crate::flows::{DialogPhase, FlowState};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Operator,
    System,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp: Utc::now() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Document,
}

/// A reference to user-supplied media. Content itself lives outside the state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
}

impl Attachment {
    pub fn image(url: impl Into<String>) -> Self {
        Self { kind: AttachmentKind::Image, url: url.into() }
    }

    pub fn is_image(&self) -> bool {
        self.kind == AttachmentKind::Image
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: SessionId,
    pub current_state: FlowState,
    #[serde(default)]
    pub dialog_phase: DialogPhase,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub selected_products: Vec<Product>,
    #[serde(default)]
    pub customer: CustomerContact,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub pending_approval: Option<ApprovalRequest>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub should_escalate: bool,
    #[serde(default)]
    pub escalation_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: SessionId(session_id.into()),
            current_state: FlowState::Init,
            dialog_phase: DialogPhase::new(DialogPhase::INIT),
            messages: Vec::new(),
            selected_products: Vec::new(),
            customer: CustomerContact::default(),
            metadata: BTreeMap::new(),
            pending_approval: None,
            retry_count: 0,
            should_escalate: false,
            escalation_reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn reset_turn_fields(&mut self) {
        self.retry_count = 0;
        self.should_escalate = false;
        self.escalation_reason = None;
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn metadata_u32(&self, key: &str) -> u32 {
        self.metadata
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(0)
    }

    pub fn apply(&mut self, delta: StateDelta) {
        self.messages.extend(delta.appended_messages);
        if let Some(state) = delta.current_state {
            self.current_state = state;
        }
        if let Some(phase) = delta.dialog_phase {
            self.dialog_phase = phase;
        }
        if let Some(products) = delta.selected_products {
            self.selected_products = products;
        }
        if let Some(customer) = &delta.customer {
            self.customer.merge(customer);
        }
        self.metadata.extend(delta.metadata);
        match delta.approval {
            ApprovalChange::Unchanged => {}
            ApprovalChange::Set(request) => self.pending_approval = Some(*request),
            ApprovalChange::Clear => self.pending_approval = None,
        }
        self.retry_count = delta.retry_count;
        self.should_escalate = delta.should_escalate;
        self.escalation_reason = delta.escalation_reason;
        self.updated_at = Utc::now();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "request", rename_all = "snake_case")]
pub enum ApprovalChange {
    #[default]
    Unchanged,
    Set(Box<ApprovalRequest>),
    Clear,
}

/// Everything one turn changes. Produced by the pipeline, applied between turns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub appended_messages: Vec<Message>,
    pub current_state: Option<FlowState>,
    pub dialog_phase: Option<DialogPhase>,
    pub selected_products: Option<Vec<Product>>,
    pub customer: Option<CustomerContact>,
    pub metadata: BTreeMap<String, Value>,
    pub approval: ApprovalChange,
    pub retry_count: u32,
    pub should_escalate: bool,
    pub escalation_reason: Option<String>,
}

impl StateDelta {
    pub fn assistant_replies(&self) -> Vec<String> {
        self.appended_messages
            .iter()
            .filter(|message| message.role == Role::Assistant)
            .map(|message| message.content.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{ApprovalChange, ConversationState, Message, StateDelta};
    use crate::domain::customer::CustomerContact;
    use crate::domain::product::Product;
    use crate::flows::{DialogPhase, FlowState};

    #[test]
    fn apply_appends_messages_and_overwrites_turn_fields() {
        let mut state = ConversationState::new("session-1");
        state.messages.push(Message::user("hi"));
        state.retry_count = 2;

        state.apply(StateDelta {
            appended_messages: vec![Message::user("show me dresses"), Message::assistant("sure")],
            current_state: Some(FlowState::Discovery),
            dialog_phase: Some(DialogPhase::from("BROWSING")),
            selected_products: Some(vec![Product::new("dress-1", "Linen dress", Decimal::new(1200, 0))]),
            customer: Some(CustomerContact { name: Some("A".to_string()), ..Default::default() }),
            metadata: [("intent".to_string(), json!("product_question"))].into_iter().collect(),
            approval: ApprovalChange::Unchanged,
            retry_count: 1,
            should_escalate: false,
            escalation_reason: None,
        });

        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.messages[0].content, "hi");
        assert_eq!(state.current_state, FlowState::Discovery);
        assert_eq!(state.dialog_phase.as_str(), "BROWSING");
        assert_eq!(state.selected_products.len(), 1);
        assert_eq!(state.customer.name.as_deref(), Some("A"));
        assert_eq!(state.metadata.get("intent"), Some(&json!("product_question")));
        assert_eq!(state.retry_count, 1);
    }

    #[test]
    fn state_survives_json_round_trip_without_optional_fields() {
        let raw = json!({
            "session_id": "session-9",
            "current_state": "SIZE_COLOR",
            "updated_at": "2026-03-01T10:00:00Z"
        });

        let state: ConversationState = serde_json::from_value(raw).expect("decode minimal state");
        assert_eq!(state.current_state, FlowState::SizeColor);
        assert!(state.messages.is_empty());
        assert!(state.pending_approval.is_none());
        assert_eq!(state.metadata_u32("vision_no_match_count"), 0);
    }
}
