use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::customer::CustomerContact;
use crate::domain::product::{Product, ProductId};
use crate::escalation::{EscalationSignal, VisionAssessment};
use crate::flows::{DialogPhase, FlowState};

/// Structured output of a state responder for one attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub session_id: String,
    pub messages: Vec<String>,
    #[serde(default)]
    pub products: Vec<Product>,
    pub next_state: FlowState,
    #[serde(default)]
    pub dialog_phase: Option<DialogPhase>,
    /// Replaces the session's selection when present.
    #[serde(default)]
    pub selected_products: Option<Vec<Product>>,
    #[serde(default)]
    pub customer: Option<CustomerContact>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub escalation: Option<EscalationSignal>,
    #[serde(default)]
    pub vision: Option<VisionAssessment>,
    /// Product ids returned by catalog tools this turn; `None` skips the hallucination check.
    #[serde(default)]
    pub tool_results: Option<Vec<ProductId>>,
}

impl AgentResponse {
    pub fn reply(session_id: impl Into<String>, next_state: FlowState, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: vec![message.into()],
            products: Vec::new(),
            next_state,
            dialog_phase: None,
            selected_products: None,
            customer: None,
            metadata: BTreeMap::new(),
            escalation: None,
            vision: None,
            tool_results: None,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.dialog_phase = Some(DialogPhase::new(phase));
        self
    }

    pub fn with_products(mut self, products: Vec<Product>) -> Self {
        self.products = products;
        self
    }

    pub fn with_tool_results(mut self, ids: Vec<ProductId>) -> Self {
        self.tool_results = Some(ids);
        self
    }

    pub fn with_escalation(mut self, signal: EscalationSignal) -> Self {
        self.escalation = Some(signal);
        self
    }

    pub fn with_vision(mut self, assessment: VisionAssessment) -> Self {
        self.vision = Some(assessment);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::AgentResponse;
    use crate::flows::FlowState;

    #[test]
    fn decodes_generator_json_with_defaults() {
        let response: AgentResponse = serde_json::from_value(json!({
            "session_id": "s1",
            "messages": ["Here is our linen dress"],
            "next_state": "OFFER",
            "dialog_phase": "OFFER_MADE",
            "products": [{"id": "dress-1", "name": "Linen dress", "price": "1200"}],
            "escalation": {"level": "low", "reason": "asked about custom sizes"}
        }))
        .expect("decode response");

        assert_eq!(response.next_state, FlowState::Offer);
        assert_eq!(response.products.len(), 1);
        assert!(response.tool_results.is_none());
        assert!(response.selected_products.is_none());
        assert_eq!(response.escalation.map(|signal| signal.reason).as_deref(), Some("asked about custom sizes"));
    }
}
