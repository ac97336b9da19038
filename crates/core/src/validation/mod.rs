//! Output validation for generated responses.
//!
//! Every check contributes zero or more [`ValidationError`]s; an empty list
//! means the response may reach the user. Errors are fed back to the
//! responder on retry and summarized by category for diagnostics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{LanguagePolicy, ValidationConfig};
use crate::domain::response::AgentResponse;
use crate::errors::ErrorCategory;

pub const TOO_MANY_PRODUCTS: &str = "too_many_products";
pub const PRICE_OUT_OF_RANGE: &str = "price_out_of_range";
pub const DISALLOWED_URL_SCHEME: &str = "disallowed_url_scheme";
pub const HALLUCINATED_PRODUCT: &str = "hallucinated_product";
pub const SESSION_MISMATCH: &str = "session_mismatch";
pub const EMPTY_MESSAGES: &str = "empty_messages";
pub const BLANK_MESSAGE: &str = "blank_message";
pub const MISSING_PRODUCT_FIELD: &str = "missing_product_field";
pub const FORBIDDEN_TERM: &str = "forbidden_term";
pub const WRONG_LANGUAGE: &str = "wrong_language";
pub const UNPARSEABLE_RESPONSE: &str = "unparseable_response";

/// Letters needed before the language heuristic is trusted.
const LANGUAGE_SAMPLE_MIN: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: &str, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self { code: code.to_string(), category, message: message.into() }
    }

    pub fn schema(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Schema, message)
    }

    pub fn business(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Business, message)
    }

    pub fn safety(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Safety, message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.category.as_str(), self.code, self.message)
    }
}

/// What the gate knows about the turn the response belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationContext<'a> {
    pub session_id: &'a str,
}

#[derive(Clone, Debug)]
pub struct ValidationGate {
    config: ValidationConfig,
    max_retries: u32,
    forbidden_terms: Vec<String>,
}

impl ValidationGate {
    pub fn new(config: ValidationConfig, max_retries: u32) -> Self {
        let forbidden_terms = config
            .forbidden_terms
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        Self { config, max_retries, forbidden_terms }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn validate(
        &self,
        response: &AgentResponse,
        context: &ValidationContext<'_>,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        self.check_structure(response, &mut errors);
        self.check_session(response, context, &mut errors);
        self.check_product_count(response, &mut errors);
        self.check_prices(response, &mut errors);
        self.check_url_schemes(response, &mut errors);
        self.check_hallucinations(response, &mut errors);
        self.check_content_policy(response, &mut errors);
        errors
    }

    /// `retry_count` is the number of retries already spent this turn.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn retry_feedback(errors: &[ValidationError]) -> String {
        let mut feedback = String::from(
            "Your previous response was rejected. Fix every issue below and answer again:",
        );
        for error in errors {
            feedback.push_str("\n- ");
            feedback.push_str(&error.to_string());
        }
        feedback
    }

    pub fn categorize(errors: &[ValidationError]) -> BTreeMap<ErrorCategory, usize> {
        let mut counts = BTreeMap::new();
        for error in errors {
            *counts.entry(error.category).or_insert(0) += 1;
        }
        counts
    }

    /// The category that decides how the turn is handled: safety beats schema beats business.
    pub fn dominant_category(errors: &[ValidationError]) -> Option<ErrorCategory> {
        [ErrorCategory::Safety, ErrorCategory::Schema, ErrorCategory::Business]
            .into_iter()
            .find(|category| errors.iter().any(|error| error.category == *category))
            .or_else(|| errors.first().map(|error| error.category))
    }

    fn check_structure(&self, response: &AgentResponse, errors: &mut Vec<ValidationError>) {
        if response.messages.is_empty() {
            errors.push(ValidationError::schema(EMPTY_MESSAGES, "response contains no messages"));
        }
        for (index, message) in response.messages.iter().enumerate() {
            if message.trim().is_empty() {
                errors.push(ValidationError::schema(
                    BLANK_MESSAGE,
                    format!("message #{index} is blank"),
                ));
            }
        }
        for product in all_products(response) {
            if product.id.as_str().trim().is_empty() || product.name.trim().is_empty() {
                errors.push(ValidationError::schema(
                    MISSING_PRODUCT_FIELD,
                    "every product needs a non-empty id and name",
                ));
            }
        }
    }

    fn check_session(
        &self,
        response: &AgentResponse,
        context: &ValidationContext<'_>,
        errors: &mut Vec<ValidationError>,
    ) {
        if response.session_id != context.session_id {
            errors.push(ValidationError::schema(
                SESSION_MISMATCH,
                format!(
                    "response session `{}` does not match turn session `{}`",
                    response.session_id, context.session_id
                ),
            ));
        }
    }

    fn check_product_count(&self, response: &AgentResponse, errors: &mut Vec<ValidationError>) {
        let count = response.products.len();
        if count > self.config.max_products {
            errors.push(ValidationError::business(
                TOO_MANY_PRODUCTS,
                format!("{count} products offered, at most {} allowed", self.config.max_products),
            ));
        }
    }

    fn check_prices(&self, response: &AgentResponse, errors: &mut Vec<ValidationError>) {
        for product in all_products(response) {
            if product.price < self.config.min_price || product.price > self.config.max_price {
                errors.push(ValidationError::business(
                    PRICE_OUT_OF_RANGE,
                    format!(
                        "price {} of `{}` is outside {}..={}",
                        product.price,
                        product.id.as_str(),
                        self.config.min_price,
                        self.config.max_price
                    ),
                ));
            }
        }
    }

    fn check_url_schemes(&self, response: &AgentResponse, errors: &mut Vec<ValidationError>) {
        for product in all_products(response) {
            let Some(url) = product.photo_url.as_deref() else {
                continue;
            };
            let allowed = url_scheme(url).is_some_and(|scheme| {
                self.config
                    .allowed_url_schemes
                    .iter()
                    .any(|allowed| allowed.trim().eq_ignore_ascii_case(scheme))
            });
            if !allowed {
                errors.push(ValidationError::safety(
                    DISALLOWED_URL_SCHEME,
                    format!("photo url of `{}` uses a disallowed scheme", product.id.as_str()),
                ));
            }
        }
    }

    fn check_hallucinations(&self, response: &AgentResponse, errors: &mut Vec<ValidationError>) {
        let Some(tool_results) = &response.tool_results else {
            return;
        };
        let known: BTreeSet<&str> = tool_results.iter().map(|id| id.as_str()).collect();
        for product in all_products(response) {
            if !known.contains(product.id.as_str()) {
                errors.push(ValidationError::business(
                    HALLUCINATED_PRODUCT,
                    format!("product `{}` was not returned by the catalog", product.id.as_str()),
                ));
            }
        }
    }

    fn check_content_policy(&self, response: &AgentResponse, errors: &mut Vec<ValidationError>) {
        for message in &response.messages {
            let lowered = message.to_lowercase();
            if let Some(term) = self.forbidden_terms.iter().find(|term| lowered.contains(term.as_str())) {
                errors.push(ValidationError::safety(
                    FORBIDDEN_TERM,
                    format!("message contains forbidden term `{term}`"),
                ));
            }
        }

        if self.config.language == LanguagePolicy::Any {
            return;
        }
        let text = response.messages.join(" ");
        if !matches_language(&text, self.config.language) {
            errors.push(ValidationError::business(
                WRONG_LANGUAGE,
                format!("reply is not written in the expected {:?} script", self.config.language),
            ));
        }
    }
}

fn all_products(response: &AgentResponse) -> impl Iterator<Item = &crate::domain::product::Product> {
    response.products.iter().chain(response.selected_products.iter().flatten())
}

fn url_scheme(url: &str) -> Option<&str> {
    let (scheme, rest) = url.trim().split_once(':')?;
    let valid = !scheme.is_empty()
        && !rest.is_empty()
        && scheme.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Majority-of-letters script check. Short replies always pass.
fn matches_language(text: &str, policy: LanguagePolicy) -> bool {
    let mut letters = 0usize;
    let mut cyrillic = 0usize;
    for ch in text.chars().filter(|ch| ch.is_alphabetic()) {
        letters += 1;
        if ('\u{0400}'..='\u{04FF}').contains(&ch) {
            cyrillic += 1;
        }
    }
    if letters < LANGUAGE_SAMPLE_MIN {
        return true;
    }
    match policy {
        LanguagePolicy::Any => true,
        LanguagePolicy::Cyrillic => cyrillic * 2 >= letters,
        LanguagePolicy::Latin => cyrillic * 2 < letters,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{
        ValidationContext, ValidationError, ValidationGate, DISALLOWED_URL_SCHEME, EMPTY_MESSAGES,
        FORBIDDEN_TERM, HALLUCINATED_PRODUCT, PRICE_OUT_OF_RANGE, SESSION_MISMATCH,
        TOO_MANY_PRODUCTS, WRONG_LANGUAGE,
    };
    use crate::config::{LanguagePolicy, ValidationConfig};
    use crate::domain::product::{Product, ProductId};
    use crate::domain::response::AgentResponse;
    use crate::errors::ErrorCategory;
    use crate::flows::FlowState;

    fn gate() -> ValidationGate {
        ValidationGate::new(ValidationConfig::default(), 3)
    }

    fn ctx() -> ValidationContext<'static> {
        ValidationContext { session_id: "s1" }
    }

    fn codes(errors: &[ValidationError]) -> Vec<&str> {
        errors.iter().map(|error| error.code.as_str()).collect()
    }

    fn dress(price: i64) -> Product {
        Product::new("dress-1", "Linen dress", Decimal::new(price, 0))
    }

    #[test]
    fn clean_response_passes() {
        let response = AgentResponse::reply("s1", FlowState::Offer, "Linen dress, 1200")
            .with_products(vec![dress(1200).with_photo("https://cdn.shop/dress.jpg")])
            .with_tool_results(vec![ProductId("dress-1".to_string())]);
        assert!(gate().validate(&response, &ctx()).is_empty());
    }

    #[test]
    fn negative_price_is_a_business_error() {
        let response =
            AgentResponse::reply("s1", FlowState::Offer, "Great deal").with_products(vec![dress(-5)]);
        let errors = gate().validate(&response, &ctx());
        assert_eq!(codes(&errors), vec![PRICE_OUT_OF_RANGE]);
        assert_eq!(errors[0].category, ErrorCategory::Business);
    }

    #[test]
    fn selected_products_are_checked_too() {
        let mut response = AgentResponse::reply("s1", FlowState::Offer, "Added to your order");
        response.selected_products = Some(vec![dress(1_000_000)]);
        assert_eq!(codes(&gate().validate(&response, &ctx())), vec![PRICE_OUT_OF_RANGE]);
    }

    #[test]
    fn product_count_is_bounded() {
        let products = (0..11)
            .map(|index| Product::new(format!("p{index}"), "Scarf", Decimal::new(300, 0)))
            .collect();
        let response =
            AgentResponse::reply("s1", FlowState::Discovery, "Our scarves").with_products(products);
        assert_eq!(codes(&gate().validate(&response, &ctx())), vec![TOO_MANY_PRODUCTS]);
    }

    #[test]
    fn non_https_photo_url_is_rejected() {
        for url in ["http://cdn.shop/a.jpg", "javascript:alert(1)", "no-scheme.jpg"] {
            let response = AgentResponse::reply("s1", FlowState::Vision, "This one?")
                .with_products(vec![dress(900).with_photo(url)]);
            assert_eq!(
                codes(&gate().validate(&response, &ctx())),
                vec![DISALLOWED_URL_SCHEME],
                "{url}"
            );
        }
    }

    #[test]
    fn hallucination_check_needs_tool_results() {
        let without_tools = AgentResponse::reply("s1", FlowState::Discovery, "Try this")
            .with_products(vec![dress(900)]);
        assert!(gate().validate(&without_tools, &ctx()).is_empty());

        let with_tools = without_tools.with_tool_results(vec![ProductId("coat-7".to_string())]);
        assert_eq!(codes(&gate().validate(&with_tools, &ctx())), vec![HALLUCINATED_PRODUCT]);
    }

    #[test]
    fn structural_and_session_errors_are_schema() {
        let mut response = AgentResponse::reply("other", FlowState::Discovery, "hi");
        response.messages.clear();
        let errors = gate().validate(&response, &ctx());
        assert_eq!(codes(&errors), vec![EMPTY_MESSAGES, SESSION_MISMATCH]);
        assert!(errors.iter().all(|error| error.category == ErrorCategory::Schema));
    }

    #[test]
    fn forbidden_terms_and_language_policy() {
        let config = ValidationConfig {
            forbidden_terms: vec!["Guaranteed Cure".to_string()],
            language: LanguagePolicy::Cyrillic,
            ..ValidationConfig::default()
        };
        let gate = ValidationGate::new(config, 3);

        let response = AgentResponse::reply(
            "s1",
            FlowState::Discovery,
            "This dress is a guaranteed cure for bad moods",
        );
        let errors = gate.validate(&response, &ctx());
        assert_eq!(codes(&errors), vec![FORBIDDEN_TERM, WRONG_LANGUAGE]);

        let ukrainian = AgentResponse::reply("s1", FlowState::Discovery, "Ця сукня є у розмірах S та M");
        assert!(gate.validate(&ukrainian, &ctx()).is_empty());
    }

    #[test]
    fn retry_budget_and_feedback() {
        let gate = gate();
        assert!(gate.should_retry(0));
        assert!(gate.should_retry(2));
        assert!(!gate.should_retry(3));

        let errors = vec![
            ValidationError::business(PRICE_OUT_OF_RANGE, "price -5 is outside 0.01..=100000"),
            ValidationError::schema(SESSION_MISMATCH, "wrong session"),
        ];
        let feedback = ValidationGate::retry_feedback(&errors);
        assert!(feedback.contains("[business] price_out_of_range"));
        assert!(feedback.contains("[schema] session_mismatch"));

        let counts = ValidationGate::categorize(&errors);
        assert_eq!(counts.get(&ErrorCategory::Business), Some(&1));
        assert_eq!(counts.get(&ErrorCategory::Schema), Some(&1));
        assert_eq!(ValidationGate::dominant_category(&errors), Some(ErrorCategory::Schema));
        assert_eq!(ValidationGate::dominant_category(&[]), None);
    }
}
