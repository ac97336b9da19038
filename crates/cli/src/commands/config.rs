use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use closer_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Sources {
    file_doc: Option<Value>,
    file_path: Option<PathBuf>,
}

impl Sources {
    fn detect() -> Self {
        let file_path = detect_config_path();
        let file_doc = load_config_file_doc(file_path.as_deref());
        Self { file_doc, file_path }
    }

    fn of(&self, key_path: &str) -> String {
        field_source(key_path, &env_key(key_path), self.file_doc.as_ref(), self.file_path.as_deref())
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let sources = Sources::detect();
    let fields: Vec<(&str, String)> = vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("pipeline.max_retries", config.pipeline.max_retries.to_string()),
        ("pipeline.responder_timeout_secs", config.pipeline.responder_timeout_secs.to_string()),
        ("validation.language", format!("{:?}", config.validation.language)),
        ("escalation.max_vision_no_match", config.escalation.max_vision_no_match.to_string()),
        (
            "escalation.suppression_window_secs",
            config.escalation.suppression_window_secs.to_string(),
        ),
        ("breaker.failure_threshold", config.breaker.failure_threshold.to_string()),
        ("breaker.recovery_timeout_secs", config.breaker.recovery_timeout_secs.to_string()),
        (
            "idempotency.processing_timeout_secs",
            config.idempotency.processing_timeout_secs.to_string(),
        ),
        ("checkpoint.enabled", config.checkpoint.enabled.to_string()),
        ("checkpoint.max_messages", config.checkpoint.max_messages.to_string()),
        (
            "notifications.webhook_url",
            config.notifications.webhook_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        (
            "notifications.auth_token",
            redact_optional(config.notifications.auth_token.as_ref().map(|t| t.expose_secret())),
        ),
        ("llm.provider", format!("{:?}", config.llm.provider)),
        ("llm.model", config.llm.model.clone()),
        ("llm.base_url", config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string())),
        ("llm.api_key", redact_optional(config.llm.api_key.as_ref().map(|k| k.expose_secret()))),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.port", config.server.port.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields.iter().map(|(key, value)| render_line(key, value, sources.of(key))));
    lines.join("\n")
}

/// `llm.api_key` is read from `CLOSER_LLM_API_KEY`.
fn env_key(key_path: &str) -> String {
    format!("CLOSER_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("closer.toml"), PathBuf::from("config/closer.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_optional(secret: Option<&str>) -> String {
    match secret.map(str::trim) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(value) => match value.split_once('-') {
            Some((prefix, _)) if prefix.len() <= 4 => format!("{prefix}-***"),
            _ => "<redacted>".to_string(),
        },
    }
}
