use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use closer_core::domain::response::AgentResponse;
use closer_core::flows::FlowState;

use crate::responders::{Responder, ResponderOutput, ResponderRequest, SideEffect};

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

const HISTORY_WINDOW: usize = 12;

/// Turns a completion into a structured `AgentResponse`.
///
/// The model is asked for a single JSON object; anything that does not parse
/// comes back as `ResponderOutput::Malformed` so the validation loop can retry.
pub struct LlmResponder<C> {
    client: C,
    name: &'static str,
    instructions: String,
    idempotent_operation: Option<&'static str>,
}

impl<C> LlmResponder<C>
where
    C: LlmClient,
{
    pub fn new(client: C, name: &'static str, instructions: impl Into<String>) -> Self {
        Self { client, name, instructions: instructions.into(), idempotent_operation: None }
    }

    /// Marks calls that carry image attachments as side-effecting under `operation`.
    pub fn idempotent_for_images(mut self, operation: &'static str) -> Self {
        self.idempotent_operation = Some(operation);
        self
    }

    pub fn render_prompt(&self, request: &ResponderRequest<'_>) -> String {
        let history = request
            .state
            .messages
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|message| json!({"role": message.role, "content": message.content}))
            .collect::<Vec<_>>();

        let prompt = json!({
            "instructions": self.instructions,
            "session_id": request.session_id(),
            "current_state": request.state.current_state,
            "responding_as": request.route,
            "dialog_phase": request.state.dialog_phase,
            "allowed_next_states": FlowState::ALL
                .iter()
                .filter(|state| request.route.can_transition_to(**state))
                .collect::<Vec<_>>(),
            "selected_products": request.state.selected_products,
            "customer": request.state.customer,
            "history": history,
            "user_input": request.user_input,
            "image_urls": request.image_urls(),
            "intent": request.intent,
            "previous_attempt_feedback": request.feedback,
            "output_format": {
                "session_id": "string, echo the session_id above",
                "messages": ["non-empty reply strings"],
                "products": [{"id": "catalog id", "name": "string", "price": "decimal"}],
                "next_state": "one of allowed_next_states",
                "dialog_phase": "optional sub-status",
                "metadata": "optional object",
                "escalation": {"level": "soft|hard", "reason": "string"},
                "vision": {"identified_product": "optional", "confidence": 0.0, "needs_clarification": false},
                "tool_results": "optional list of catalog ids you looked up"
            }
        });
        prompt.to_string()
    }
}

#[async_trait]
impl<C> Responder for LlmResponder<C>
where
    C: LlmClient,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn side_effect(&self, request: &ResponderRequest<'_>) -> Option<SideEffect> {
        let operation = self.idempotent_operation?;
        let images = request.image_urls();
        if images.is_empty() {
            return None;
        }
        let mut parts = vec![request.user_input.to_string()];
        parts.extend(images.into_iter().map(str::to_string));
        Some(SideEffect { operation, parts, staged: false })
    }

    async fn respond(&self, request: &ResponderRequest<'_>) -> Result<ResponderOutput> {
        let completion = self.client.complete(&self.render_prompt(request)).await?;
        Ok(parse_completion(&completion))
    }
}

pub fn parse_completion(completion: &str) -> ResponderOutput {
    let Some(body) = extract_json_object(completion) else {
        return ResponderOutput::Malformed {
            reason: "completion does not contain a JSON object".to_string(),
        };
    };
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(error) => {
            return ResponderOutput::Malformed { reason: format!("invalid JSON: {error}") };
        }
    };
    match serde_json::from_value::<AgentResponse>(value) {
        Ok(response) => ResponderOutput::reply(response),
        Err(error) => ResponderOutput::Malformed { reason: format!("unexpected shape: {error}") },
    }
}

/// The outermost `{...}` span, which also strips markdown code fences.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
