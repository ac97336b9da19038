use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::CircuitBreakerConfig;
use crate::escalation::VisionEscalationPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub validation: ValidationConfig,
    pub escalation: EscalationConfig,
    pub breaker: BreakerConfig,
    pub idempotency: IdempotencyConfig,
    pub checkpoint: CheckpointConfig,
    pub notifications: NotificationConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub responder_timeout_secs: u64,
    /// Minimum classifier confidence before an intent may reroute the turn.
    pub intent_reroute_confidence: f64,
    /// Sent while a duplicate of an in-flight operation is still running.
    pub holding_message: String,
}

impl PipelineConfig {
    pub fn responder_timeout(&self) -> Duration {
        Duration::from_secs(self.responder_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguagePolicy {
    Any,
    Cyrillic,
    Latin,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidationConfig {
    pub max_products: usize,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub allowed_url_schemes: Vec<String>,
    pub forbidden_terms: Vec<String>,
    pub language: LanguagePolicy,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EscalationConfig {
    pub vision_confidence_threshold: f64,
    pub vision_hard_floor: f64,
    pub max_vision_no_match: u32,
    pub dedupe_capacity: usize,
    pub suppression_window_secs: u64,
    pub soft_message: String,
}

impl EscalationConfig {
    pub fn vision_policy(&self) -> VisionEscalationPolicy {
        VisionEscalationPolicy {
            confidence_threshold: self.vision_confidence_threshold,
            hard_floor: self.vision_hard_floor,
            max_no_match: self.max_vision_no_match,
        }
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl BreakerConfig {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            half_open_max_calls: self.half_open_max_calls,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdempotencyConfig {
    pub processing_timeout_secs: u64,
}

impl IdempotencyConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub max_messages: usize,
    pub max_message_chars: usize,
    /// Metadata keys copied verbatim by compaction.
    pub critical_metadata_keys: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub auth_token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub notifications_webhook_url: Option<String>,
    pub max_retries: Option<u32>,
    pub checkpoint_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_SOFT_MESSAGE: &str =
    "Thanks for your patience! I'm checking this with a colleague and will get back to you shortly.";
pub const DEFAULT_HOLDING_MESSAGE: &str =
    "We're still working on your previous request, one moment please.";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://closer.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            pipeline: PipelineConfig {
                max_retries: 3,
                responder_timeout_secs: 30,
                intent_reroute_confidence: 0.7,
                holding_message: DEFAULT_HOLDING_MESSAGE.to_string(),
            },
            validation: ValidationConfig::default(),
            escalation: EscalationConfig {
                vision_confidence_threshold: 0.6,
                vision_hard_floor: 0.3,
                max_vision_no_match: 2,
                dedupe_capacity: 1000,
                suppression_window_secs: 600,
                soft_message: DEFAULT_SOFT_MESSAGE.to_string(),
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                recovery_timeout_secs: 60,
                half_open_max_calls: 1,
            },
            idempotency: IdempotencyConfig { processing_timeout_secs: 300 },
            checkpoint: CheckpointConfig::default(),
            notifications: NotificationConfig {
                webhook_url: None,
                auth_token: None,
                timeout_secs: 10,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_products: 10,
            min_price: Decimal::new(1, 2),
            max_price: Decimal::new(100_000, 0),
            allowed_url_schemes: vec!["https".to_string()],
            forbidden_terms: Vec::new(),
            language: LanguagePolicy::Any,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: 200,
            max_message_chars: 4000,
            critical_metadata_keys: vec![
                "order_id".to_string(),
                "payment_confirmed".to_string(),
                "vision_no_match_count".to_string(),
            ],
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for LanguagePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "cyrillic" => Ok(Self::Cyrillic),
            "latin" => Ok(Self::Latin),
            other => Err(ConfigError::Validation(format!(
                "unsupported language policy `{other}` (expected any|cyrillic|latin)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("closer.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(max_retries) = pipeline.max_retries {
                self.pipeline.max_retries = max_retries;
            }
            if let Some(timeout) = pipeline.responder_timeout_secs {
                self.pipeline.responder_timeout_secs = timeout;
            }
            if let Some(confidence) = pipeline.intent_reroute_confidence {
                self.pipeline.intent_reroute_confidence = confidence;
            }
            if let Some(message) = pipeline.holding_message {
                self.pipeline.holding_message = message;
            }
        }

        if let Some(validation) = patch.validation {
            if let Some(max_products) = validation.max_products {
                self.validation.max_products = max_products;
            }
            if let Some(min_price) = validation.min_price {
                self.validation.min_price = min_price;
            }
            if let Some(max_price) = validation.max_price {
                self.validation.max_price = max_price;
            }
            if let Some(schemes) = validation.allowed_url_schemes {
                self.validation.allowed_url_schemes = schemes;
            }
            if let Some(terms) = validation.forbidden_terms {
                self.validation.forbidden_terms = terms;
            }
            if let Some(language) = validation.language {
                self.validation.language = language;
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(threshold) = escalation.vision_confidence_threshold {
                self.escalation.vision_confidence_threshold = threshold;
            }
            if let Some(floor) = escalation.vision_hard_floor {
                self.escalation.vision_hard_floor = floor;
            }
            if let Some(max_no_match) = escalation.max_vision_no_match {
                self.escalation.max_vision_no_match = max_no_match;
            }
            if let Some(capacity) = escalation.dedupe_capacity {
                self.escalation.dedupe_capacity = capacity;
            }
            if let Some(window) = escalation.suppression_window_secs {
                self.escalation.suppression_window_secs = window;
            }
            if let Some(message) = escalation.soft_message {
                self.escalation.soft_message = message;
            }
        }

        if let Some(breaker) = patch.breaker {
            if let Some(threshold) = breaker.failure_threshold {
                self.breaker.failure_threshold = threshold;
            }
            if let Some(recovery) = breaker.recovery_timeout_secs {
                self.breaker.recovery_timeout_secs = recovery;
            }
            if let Some(calls) = breaker.half_open_max_calls {
                self.breaker.half_open_max_calls = calls;
            }
        }

        if let Some(idempotency) = patch.idempotency {
            if let Some(timeout) = idempotency.processing_timeout_secs {
                self.idempotency.processing_timeout_secs = timeout;
            }
        }

        if let Some(checkpoint) = patch.checkpoint {
            if let Some(enabled) = checkpoint.enabled {
                self.checkpoint.enabled = enabled;
            }
            if let Some(max_messages) = checkpoint.max_messages {
                self.checkpoint.max_messages = max_messages;
            }
            if let Some(max_chars) = checkpoint.max_message_chars {
                self.checkpoint.max_message_chars = max_chars;
            }
            if let Some(keys) = checkpoint.critical_metadata_keys {
                self.checkpoint.critical_metadata_keys = keys;
            }
        }

        if let Some(notifications) = patch.notifications {
            if let Some(webhook_url) = notifications.webhook_url {
                self.notifications.webhook_url = Some(webhook_url);
            }
            if let Some(auth_token_value) = notifications.auth_token {
                self.notifications.auth_token = Some(secret_value(auth_token_value));
            }
            if let Some(timeout_secs) = notifications.timeout_secs {
                self.notifications.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CLOSER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CLOSER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("CLOSER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CLOSER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CLOSER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLOSER_PIPELINE_MAX_RETRIES") {
            self.pipeline.max_retries = parse_u32("CLOSER_PIPELINE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("CLOSER_PIPELINE_RESPONDER_TIMEOUT_SECS") {
            self.pipeline.responder_timeout_secs =
                parse_u64("CLOSER_PIPELINE_RESPONDER_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLOSER_VALIDATION_LANGUAGE") {
            self.validation.language = value.parse()?;
        }

        if let Some(value) = read_env("CLOSER_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = parse_u32("CLOSER_BREAKER_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CLOSER_BREAKER_RECOVERY_TIMEOUT_SECS") {
            self.breaker.recovery_timeout_secs =
                parse_u64("CLOSER_BREAKER_RECOVERY_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLOSER_IDEMPOTENCY_PROCESSING_TIMEOUT_SECS") {
            self.idempotency.processing_timeout_secs =
                parse_u64("CLOSER_IDEMPOTENCY_PROCESSING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLOSER_CHECKPOINT_ENABLED") {
            self.checkpoint.enabled = parse_bool("CLOSER_CHECKPOINT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CLOSER_CHECKPOINT_MAX_MESSAGES") {
            self.checkpoint.max_messages = parse_usize("CLOSER_CHECKPOINT_MAX_MESSAGES", &value)?;
        }

        if let Some(value) = read_env("CLOSER_NOTIFICATIONS_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(value);
        }
        if let Some(value) = read_env("CLOSER_NOTIFICATIONS_AUTH_TOKEN") {
            self.notifications.auth_token = Some(secret_value(value));
        }

        if let Some(value) = read_env("CLOSER_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CLOSER_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CLOSER_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CLOSER_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CLOSER_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CLOSER_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLOSER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CLOSER_SERVER_PORT") {
            self.server.port = parse_u16("CLOSER_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CLOSER_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CLOSER_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("CLOSER_LOGGING_LEVEL").or_else(|| read_env("CLOSER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CLOSER_LOGGING_FORMAT").or_else(|| read_env("CLOSER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(webhook_url) = overrides.notifications_webhook_url {
            self.notifications.webhook_url = Some(webhook_url);
        }
        if let Some(max_retries) = overrides.max_retries {
            self.pipeline.max_retries = max_retries;
        }
        if let Some(enabled) = overrides.checkpoint_enabled {
            self.checkpoint.enabled = enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_pipeline(&self.pipeline)?;
        validate_validation(&self.validation)?;
        validate_escalation(&self.escalation)?;
        validate_breaker(&self.breaker)?;
        validate_idempotency(&self.idempotency)?;
        validate_checkpoint(&self.checkpoint)?;
        validate_notifications(&self.notifications)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("closer.toml"), PathBuf::from("config/closer.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(invalid(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        ));
    }
    if database.max_connections == 0 {
        return Err(invalid("database.max_connections must be greater than zero"));
    }
    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(invalid("database.timeout_secs must be in range 1..=300"));
    }
    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.max_retries > 10 {
        return Err(invalid("pipeline.max_retries must be at most 10"));
    }
    if pipeline.responder_timeout_secs == 0 || pipeline.responder_timeout_secs > 300 {
        return Err(invalid("pipeline.responder_timeout_secs must be in range 1..=300"));
    }
    if !(0.0..=1.0).contains(&pipeline.intent_reroute_confidence) {
        return Err(invalid("pipeline.intent_reroute_confidence must be within 0.0..=1.0"));
    }
    if pipeline.holding_message.trim().is_empty() {
        return Err(invalid("pipeline.holding_message must not be empty"));
    }
    Ok(())
}

fn validate_validation(validation: &ValidationConfig) -> Result<(), ConfigError> {
    if validation.max_products == 0 {
        return Err(invalid("validation.max_products must be greater than zero"));
    }
    if validation.min_price.is_sign_negative() {
        return Err(invalid("validation.min_price must not be negative"));
    }
    if validation.min_price >= validation.max_price {
        return Err(invalid("validation.min_price must be lower than validation.max_price"));
    }
    if validation.allowed_url_schemes.iter().all(|scheme| scheme.trim().is_empty()) {
        return Err(invalid(
            "validation.allowed_url_schemes must list at least one scheme (e.g. [\"https\"])",
        ));
    }
    Ok(())
}

fn validate_escalation(escalation: &EscalationConfig) -> Result<(), ConfigError> {
    let floor = escalation.vision_hard_floor;
    let threshold = escalation.vision_confidence_threshold;
    if !(0.0..=1.0).contains(&floor) || !(0.0..=1.0).contains(&threshold) || floor > threshold {
        return Err(invalid(
            "escalation.vision_hard_floor and vision_confidence_threshold must satisfy 0 <= floor <= threshold <= 1",
        ));
    }
    if escalation.dedupe_capacity == 0 {
        return Err(invalid("escalation.dedupe_capacity must be greater than zero"));
    }
    if escalation.suppression_window_secs == 0 {
        return Err(invalid("escalation.suppression_window_secs must be greater than zero"));
    }
    if escalation.soft_message.trim().is_empty() {
        return Err(invalid("escalation.soft_message must not be empty"));
    }
    Ok(())
}

fn validate_breaker(breaker: &BreakerConfig) -> Result<(), ConfigError> {
    if breaker.failure_threshold == 0 {
        return Err(invalid("breaker.failure_threshold must be greater than zero"));
    }
    if breaker.recovery_timeout_secs == 0 {
        return Err(invalid("breaker.recovery_timeout_secs must be greater than zero"));
    }
    if breaker.half_open_max_calls == 0 {
        return Err(invalid("breaker.half_open_max_calls must be greater than zero"));
    }
    Ok(())
}

fn validate_idempotency(idempotency: &IdempotencyConfig) -> Result<(), ConfigError> {
    if idempotency.processing_timeout_secs == 0 {
        return Err(invalid("idempotency.processing_timeout_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_checkpoint(checkpoint: &CheckpointConfig) -> Result<(), ConfigError> {
    if checkpoint.max_messages == 0 {
        return Err(invalid("checkpoint.max_messages must be greater than zero"));
    }
    if checkpoint.max_message_chars < 64 {
        return Err(invalid("checkpoint.max_message_chars must be at least 64"));
    }
    Ok(())
}

fn validate_notifications(notifications: &NotificationConfig) -> Result<(), ConfigError> {
    if let Some(url) = &notifications.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(invalid("notifications.webhook_url must start with http:// or https://"));
        }
    }
    if notifications.timeout_secs == 0 || notifications.timeout_secs > 120 {
        return Err(invalid("notifications.timeout_secs must be in range 1..=120"));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(invalid("llm.timeout_secs must be in range 1..=300"));
    }
    if llm.model.trim().is_empty() {
        return Err(invalid("llm.model must not be empty"));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(invalid("llm.api_key is required for the openai provider"));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(invalid("llm.base_url is required for the ollama provider"));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(invalid("server.port must be greater than zero"));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(invalid("server.graceful_shutdown_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(invalid("logging.level must be one of trace|debug|info|warn|error")),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_env(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_env(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_env(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_env(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_env(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_env(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    pipeline: Option<PipelinePatch>,
    validation: Option<ValidationPatch>,
    escalation: Option<EscalationPatch>,
    breaker: Option<BreakerPatch>,
    idempotency: Option<IdempotencyPatch>,
    checkpoint: Option<CheckpointPatch>,
    notifications: Option<NotificationPatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    max_retries: Option<u32>,
    responder_timeout_secs: Option<u64>,
    intent_reroute_confidence: Option<f64>,
    holding_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ValidationPatch {
    max_products: Option<usize>,
    min_price: Option<Decimal>,
    max_price: Option<Decimal>,
    allowed_url_schemes: Option<Vec<String>>,
    forbidden_terms: Option<Vec<String>>,
    language: Option<LanguagePolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    vision_confidence_threshold: Option<f64>,
    vision_hard_floor: Option<f64>,
    max_vision_no_match: Option<u32>,
    dedupe_capacity: Option<usize>,
    suppression_window_secs: Option<u64>,
    soft_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BreakerPatch {
    failure_threshold: Option<u32>,
    recovery_timeout_secs: Option<u64>,
    half_open_max_calls: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct IdempotencyPatch {
    processing_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckpointPatch {
    enabled: Option<bool>,
    max_messages: Option<usize>,
    max_message_chars: Option<usize>,
    critical_metadata_keys: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationPatch {
    webhook_url: Option<String>,
    auth_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use rust_decimal::Decimal;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, LanguagePolicy, LlmProvider, LoadOptions,
        LogFormat,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_and_match_documented_values() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;

        ensure(config.pipeline.max_retries == 3, "max_retries defaults to 3")?;
        ensure(config.validation.max_products == 10, "max_products defaults to 10")?;
        ensure(config.validation.min_price == Decimal::new(1, 2), "min_price defaults to 0.01")?;
        ensure(config.breaker.failure_threshold == 5, "breaker threshold defaults to 5")?;
        ensure(config.checkpoint.max_messages == 200, "checkpoint keeps 200 messages")?;
        ensure(config.escalation.dedupe_capacity == 1000, "dedupe capacity defaults to 1000")?;
        ensure(
            config.idempotency.processing_timeout_secs == 300,
            "processing timeout defaults to 300s",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CLOSER_WEBHOOK_TOKEN", "token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("closer.toml");
            fs::write(
                &path,
                r#"
[notifications]
webhook_url = "https://ops.example.com/hooks/escalations"
auth_token = "${TEST_CLOSER_WEBHOOK_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config
                    .notifications
                    .auth_token
                    .as_ref()
                    .is_some_and(|token| token.expose_secret() == "token-from-env"),
                "webhook token should be loaded from environment",
            )
        })();

        clear_vars(&["TEST_CLOSER_WEBHOOK_TOKEN"]);
        result
    }

    #[test]
    fn file_sections_patch_pipeline_settings() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("closer.toml");
        fs::write(
            &path,
            r#"
[pipeline]
max_retries = 2

[validation]
max_price = 5000
forbidden_terms = ["guaranteed cure"]
language = "cyrillic"

[breaker]
failure_threshold = 2
recovery_timeout_secs = 5

[checkpoint]
enabled = false
max_messages = 50
"#,
        )
        .map_err(|err| err.to_string())?;

        let config =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.pipeline.max_retries == 2, "max_retries should come from file")?;
        ensure(config.validation.max_price == Decimal::new(5000, 0), "max_price from file")?;
        ensure(config.validation.language == LanguagePolicy::Cyrillic, "language from file")?;
        ensure(config.validation.forbidden_terms.len() == 1, "forbidden terms from file")?;
        ensure(
            config.breaker.to_breaker_config().recovery_timeout.as_secs() == 5,
            "breaker recovery from file",
        )?;
        ensure(!config.checkpoint.enabled, "checkpoint can be disabled from file")?;
        ensure(config.checkpoint.max_messages == 50, "checkpoint bound from file")
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSER_LOG_LEVEL", "warn");
        env::set_var("CLOSER_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["CLOSER_LOG_LEVEL", "CLOSER_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSER_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CLOSER_PIPELINE_MAX_RETRIES", "5");
        env::set_var("CLOSER_LLM_MODEL", "model-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("closer.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[pipeline]
max_retries = 1

[llm]
model = "model-from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.pipeline.max_retries == 5, "env max_retries should win over file")?;
            ensure(config.llm.model == "model-from-env", "env model should win over file")
        })();

        clear_vars(&["CLOSER_DATABASE_URL", "CLOSER_PIPELINE_MAX_RETRIES", "CLOSER_LLM_MODEL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSER_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["CLOSER_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSER_BREAKER_FAILURE_THRESHOLD", "many");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "CLOSER_BREAKER_FAILURE_THRESHOLD",
                "error should name the offending variable",
            ),
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected invalid override error".to_string()),
        };

        clear_vars(&["CLOSER_BREAKER_FAILURE_THRESHOLD"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSER_LLM_PROVIDER", "openai");
        env::set_var("CLOSER_LLM_API_KEY", "sk-secret-value");
        env::set_var("CLOSER_NOTIFICATIONS_AUTH_TOKEN", "hook-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should be openai")?;
            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("hook-secret-value"),
                "debug output should not contain webhook token",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&[
            "CLOSER_LLM_PROVIDER",
            "CLOSER_LLM_API_KEY",
            "CLOSER_NOTIFICATIONS_AUTH_TOKEN",
        ]);
        result
    }
}
