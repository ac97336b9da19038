use std::env;
use std::sync::{Mutex, OnceLock};

use closer_cli::commands::{doctor, ledger, migrate, session};
use closer_core::domain::conversation::{ConversationState, Message};
use closer_core::domain::idempotency::{ContentHash, IdempotencyRecord, IdempotencyStatus};
use closer_core::flows::FlowState;
use closer_core::store::{ConversationStore, IdempotencyStore};
use closer_db::{connect_with_settings, migrations, SqlConversationStore, SqlIdempotencyStore};
use serde_json::Value;

const MEMORY_ENV: &[(&str, &str)] = &[
    ("CLOSER_LLM_API_KEY", "sk-test"),
    ("CLOSER_DATABASE_URL", "sqlite::memory:"),
    ("CLOSER_DATABASE_MAX_CONNECTIONS", "1"),
];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(MEMORY_ENV, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload.get("data").is_none());
    });
}

#[test]
fn migrate_returns_config_failure_without_llm_key() {
    with_env(&[("CLOSER_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_flags_unmigrated_database() {
    with_env(MEMORY_ENV, || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "fail");
        let checks = payload["checks"].as_array().cloned().unwrap_or_default();
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("schema_version"), "fail");
    });
}

#[test]
fn doctor_passes_after_migrate_on_a_file_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("closer.db").display());

    with_env(&[("CLOSER_LLM_API_KEY", "sk-test"), ("CLOSER_DATABASE_URL", &url)], || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = doctor::run(false);
        assert_eq!(result.exit_code, 0, "{}", result.output);
        assert!(result.output.starts_with("doctor: all readiness checks passed"));
        assert!(result.output.contains("- [ok] schema_version: all 2 migrations applied"));
    });
}

#[test]
fn session_shows_state_and_ledger_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("closer.db").display());
    let hash = seed(&url);

    with_env(&[("CLOSER_LLM_API_KEY", "sk-test"), ("CLOSER_DATABASE_URL", &url)], || {
        let result = session::run("web-7");
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "session");
        assert_eq!(payload["data"]["current_state"], "OFFER");
        assert_eq!(payload["data"]["message_count"], 2);
        assert_eq!(payload["data"]["last_message"], "Here is your offer.");
        assert_eq!(payload["data"]["awaiting_approval"], false);
        assert_eq!(payload["data"]["ledger"][0]["hash"], hash.as_str());
        assert_eq!(payload["data"]["ledger"][0]["status"], "processed");

        let listing = parse_payload(&session::list(false, 10).output);
        assert_eq!(listing["data"][0]["session_id"], "web-7");
        let awaiting = parse_payload(&session::list(true, 10).output);
        assert_eq!(awaiting["data"], Value::Array(Vec::new()));
    });
}

#[test]
fn session_and_ledger_report_missing_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("closer.db").display());
    let hash = seed(&url);

    with_env(&[("CLOSER_LLM_API_KEY", "sk-test"), ("CLOSER_DATABASE_URL", &url)], || {
        let missing = session::run("nobody");
        assert_eq!(missing.exit_code, 6);
        assert_eq!(parse_payload(&missing.output)["error_class"], "not_found");

        let found = ledger::run(hash.as_str());
        assert_eq!(found.exit_code, 0, "{}", found.output);
        let payload = parse_payload(&found.output);
        assert_eq!(payload["message"], "record is processed");
        assert_eq!(payload["data"]["operation"], "vision_identification");

        let malformed = ledger::run("not-a-hash");
        assert_eq!(parse_payload(&malformed.output)["error_class"], "invalid_argument");

        let unknown = ledger::run("sha256:00");
        assert_eq!(parse_payload(&unknown.output)["error_class"], "not_found");
    });
}

fn seed(url: &str) -> ContentHash {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(async {
        let pool = connect_with_settings(url, 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");

        let mut state = ConversationState::new("web-7");
        state.current_state = FlowState::Offer;
        state.messages.push(Message::user("How much is the red dress?"));
        state.messages.push(Message::assistant("Here is your offer."));
        SqlConversationStore::new(pool.clone()).save(&state).await.expect("save state");

        let hash = ContentHash::compute("web-7", "vision_identification", &["photo-1"]);
        let mut record = IdempotencyRecord::processing(
            hash.clone(),
            state.session_id.clone(),
            "vision_identification",
        );
        record.status = IdempotencyStatus::Processed;
        SqlIdempotencyStore::new(pool.clone()).upsert(&record).await.expect("upsert");

        pool.close().await;
        hash
    })
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "CLOSER_DATABASE_URL",
        "CLOSER_DATABASE_MAX_CONNECTIONS",
        "CLOSER_DATABASE_TIMEOUT_SECS",
        "CLOSER_LLM_PROVIDER",
        "CLOSER_LLM_API_KEY",
        "CLOSER_LLM_BASE_URL",
        "CLOSER_LLM_MODEL",
        "CLOSER_LLM_TIMEOUT_SECS",
        "CLOSER_NOTIFICATIONS_WEBHOOK_URL",
        "CLOSER_NOTIFICATIONS_AUTH_TOKEN",
        "CLOSER_PIPELINE_MAX_RETRIES",
        "CLOSER_CHECKPOINT_ENABLED",
        "CLOSER_SERVER_BIND_ADDRESS",
        "CLOSER_SERVER_PORT",
        "CLOSER_LOGGING_LEVEL",
        "CLOSER_LOGGING_FORMAT",
        "CLOSER_LOG_LEVEL",
        "CLOSER_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
