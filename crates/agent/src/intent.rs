use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use closer_core::domain::conversation::ConversationState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Greeting,
    Product,
    Photo,
    Size,
    Price,
    Payment,
    Delivery,
    Complaint,
    OutOfDomain,
    Unknown,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Product => "product",
            Self::Photo => "photo",
            Self::Size => "size",
            Self::Price => "price",
            Self::Payment => "payment",
            Self::Delivery => "delivery",
            Self::Complaint => "complaint",
            Self::OutOfDomain => "out_of_domain",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: IntentKind,
    /// 0.0 to 1.0.
    pub confidence: f64,
    #[serde(default)]
    pub matched_terms: Vec<String>,
}

impl IntentClassification {
    pub fn unknown() -> Self {
        Self { intent: IntentKind::Unknown, confidence: 0.0, matched_terms: Vec::new() }
    }
}

/// Best-effort classification. A failure never blocks the turn.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        input: &str,
        has_image: bool,
        state: &ConversationState,
    ) -> Result<IntentClassification>;
}

const KEYWORDS: &[(IntentKind, &[&str])] = &[
    (
        IntentKind::Complaint,
        &["complaint", "refund", "broken", "damaged", "terrible", "scam", "never arrived", "wrong item"],
    ),
    (IntentKind::Payment, &["pay", "paid", "payment", "card", "transfer", "invoice", "receipt"]),
    (IntentKind::Delivery, &["delivery", "deliver", "shipping", "ship", "courier", "address", "post office"]),
    (IntentKind::Size, &["size", "sizes", "fit", "length", "waist", "color", "colour"]),
    (IntentKind::Price, &["price", "cost", "how much", "discount", "cheaper", "sale"]),
    (IntentKind::Photo, &["photo", "picture", "image", "screenshot", "this one"]),
    (
        IntentKind::Product,
        &["dress", "coat", "jacket", "shirt", "skirt", "pants", "jeans", "shoes", "bag", "catalog", "collection", "show me"],
    ),
    (IntentKind::Greeting, &["hello", "hi", "hey", "good morning", "good evening"]),
    (
        IntentKind::OutOfDomain,
        &["weather", "politics", "bitcoin", "homework", "recipe", "football", "write code"],
    ),
];

#[derive(Clone, Debug, Default)]
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str, has_image: bool) -> IntentClassification {
        let normalized_text = normalize_text(text);
        let tokens = tokenize(&normalized_text);

        if has_image && tokens.len() <= 6 {
            return IntentClassification {
                intent: IntentKind::Photo,
                confidence: 0.9,
                matched_terms: vec!["<image>".to_string()],
            };
        }

        let mut best: Option<(IntentKind, Vec<String>)> = None;
        for (intent, terms) in KEYWORDS {
            let matched = terms
                .iter()
                .filter(|term| contains_term(&normalized_text, &tokens, term))
                .map(|term| term.to_string())
                .collect::<Vec<_>>();
            if matched.is_empty() {
                continue;
            }
            let better = best.as_ref().map_or(true, |(_, current)| matched.len() > current.len());
            if better {
                best = Some((*intent, matched));
            }
        }

        match best {
            Some((intent, matched_terms)) => IntentClassification {
                intent,
                confidence: confidence_score(matched_terms.len(), tokens.len()),
                matched_terms,
            },
            None if has_image => IntentClassification {
                intent: IntentKind::Photo,
                confidence: 0.7,
                matched_terms: vec!["<image>".to_string()],
            },
            None => IntentClassification::unknown(),
        }
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(
        &self,
        input: &str,
        has_image: bool,
        _state: &ConversationState,
    ) -> Result<IntentClassification> {
        Ok(self.extract(input, has_image))
    }
}

/// Multi-word terms match as substrings, single words only as whole tokens.
fn contains_term(normalized_text: &str, tokens: &[String], term: &str) -> bool {
    if term.contains(' ') {
        normalized_text.contains(term)
    } else {
        tokens.iter().any(|token| token == term)
    }
}

fn confidence_score(matches: usize, token_count: usize) -> f64 {
    let base = 0.55 + 0.15 * matches.min(3) as f64;
    // Long messages with a single hit are weaker evidence.
    let dilution = if token_count > 20 && matches == 1 { 0.15 } else { 0.0 };
    (base - dilution).clamp(0.0, 0.95)
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}
