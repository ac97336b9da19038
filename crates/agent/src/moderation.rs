use anyhow::Result;
use async_trait::async_trait;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModerationDecision {
    Allow,
    Block { reason_code: String },
}

impl ModerationDecision {
    pub fn block(reason_code: impl Into<String>) -> Self {
        Self::Block { reason_code: reason_code.into() }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

/// Safety check run before anything else touches the input.
///
/// Callers treat an `Err` as a block: moderation fails closed.
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn moderate(&self, input: &str) -> Result<ModerationDecision>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BlockRule {
    reason_code: &'static str,
    terms: &'static [&'static str],
}

const DEFAULT_RULES: &[BlockRule] = &[
    BlockRule { reason_code: "self_harm", terms: &["kill myself", "suicide", "end my life"] },
    BlockRule { reason_code: "violence", terms: &["i will kill", "bomb threat", "shoot you"] },
    BlockRule {
        reason_code: "prompt_injection",
        terms: &["ignore previous instructions", "ignore all instructions", "system prompt"],
    },
    BlockRule { reason_code: "payment_fraud", terms: &["stolen card", "carding", "chargeback scam"] },
];

/// Case-insensitive substring matcher over a fixed rule set plus extra terms.
#[derive(Clone, Debug)]
pub struct KeywordModerator {
    rules: &'static [BlockRule],
    extra_terms: Vec<String>,
}

impl Default for KeywordModerator {
    fn default() -> Self {
        Self { rules: DEFAULT_RULES, extra_terms: Vec::new() }
    }
}

impl KeywordModerator {
    pub fn with_terms(terms: impl IntoIterator<Item = String>) -> Self {
        let extra_terms = terms
            .into_iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        Self { rules: DEFAULT_RULES, extra_terms }
    }

    pub fn evaluate(&self, input: &str) -> ModerationDecision {
        let normalized = input.to_lowercase();
        for rule in self.rules {
            if rule.terms.iter().any(|term| normalized.contains(term)) {
                return ModerationDecision::block(rule.reason_code);
            }
        }
        if self.extra_terms.iter().any(|term| normalized.contains(term.as_str())) {
            return ModerationDecision::block("blocked_term");
        }
        ModerationDecision::Allow
    }
}

#[async_trait]
impl Moderator for KeywordModerator {
    async fn moderate(&self, input: &str) -> Result<ModerationDecision> {
        Ok(self.evaluate(input))
    }
}
