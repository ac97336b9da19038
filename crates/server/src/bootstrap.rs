use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use closer_agent::{
    ConversationRuntime, KeywordIntentClassifier, KeywordModerator, LlmResponder,
    LogNotificationSender, LoggingOrderSubmitter, NotificationSender, PaymentResponder,
    PipelineComponents, PipelineExecutor, Responder, ResponderRegistry,
};
use closer_core::audit::{AuditEvent, AuditSink};
use closer_core::breaker::CircuitBreakerRegistry;
use closer_core::config::{AppConfig, ConfigError, LoadOptions};
use closer_core::flows::FlowState;
use closer_core::ledger::IdempotencyLedger;
use closer_db::{connect_with_config, migrations, DbPool, SqlConversationStore, SqlIdempotencyStore};

use crate::llm::ChatCompletionsClient;
use crate::notify::WebhookNotificationSender;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<ConversationRuntime>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("integration setup failed: {0}")]
    Integration(String),
}

/// Mirrors audit events into the structured log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = "audit.event.recorded",
            session_id = %event.session_id,
            trace_id = %event.trace_id,
            audit_event = %event.event_type,
            category = ?event.category,
            outcome = ?event.outcome,
            metadata = ?event.metadata,
            "audit"
        );
    }
}

const DISCOVERY_INSTRUCTIONS: &str =
    "Greet the customer, find out what they are looking for and suggest catalog items.";
const VISION_INSTRUCTIONS: &str = "Identify the product in the attached photo. Fill `vision` \
     with the catalog product name and your confidence; ask for another photo when unsure.";
const SIZE_INSTRUCTIONS: &str = "Confirm size and color for the selected product.";
const OFFER_INSTRUCTIONS: &str = "Present the final offer with price and ask for confirmation.";
const PAYMENT_INSTRUCTIONS: &str = "Collect delivery data and payment method, then ask the \
     customer to send the payment receipt (phase WAITING_FOR_PAYMENT_PROOF).";
const UPSELL_INSTRUCTIONS: &str = "Offer one matching accessory, then close the conversation.";
const COMPLAINT_INSTRUCTIONS: &str =
    "Apologize, collect the order details of the complaint and promise a follow-up.";
const OUT_OF_DOMAIN_INSTRUCTIONS: &str =
    "Politely explain that you can only help with the shop's products and orders.";

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let llm = ChatCompletionsClient::from_config(&config.llm)
        .map_err(|error| BootstrapError::Integration(error.to_string()))?;
    info!(
        event_name = "system.bootstrap.llm_configured",
        endpoint = %llm.endpoint(),
        model = %config.llm.model,
        "llm client configured"
    );
    let notifier: Arc<dyn NotificationSender> =
        match WebhookNotificationSender::from_config(&config.notifications)
            .map_err(|error| BootstrapError::Integration(error.to_string()))?
        {
            Some(webhook) => Arc::new(webhook),
            None => {
                warn!(
                    event_name = "system.bootstrap.notifications_log_only",
                    "no notification webhook configured, escalations are only logged"
                );
                Arc::new(LogNotificationSender)
            }
        };

    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.to_breaker_config()));
    let executor = PipelineExecutor::new(
        &config,
        PipelineComponents {
            moderator: Arc::new(KeywordModerator::default()),
            classifier: Arc::new(KeywordIntentClassifier::new()),
            responders: responders(&llm),
            ledger: IdempotencyLedger::new(
                Arc::new(SqlIdempotencyStore::new(db_pool.clone())),
                config.idempotency.processing_timeout(),
            ),
            breakers: Arc::clone(&breakers),
            notifier,
            catalog: None,
            audit: Arc::new(TracingAuditSink),
        },
    );
    let runtime = Arc::new(ConversationRuntime::new(
        Arc::new(executor),
        Arc::new(SqlConversationStore::new(db_pool.clone())),
        config.checkpoint.clone(),
    ));
    info!(event_name = "system.bootstrap.runtime_ready", "conversation runtime ready");

    Ok(Application { config, db_pool, runtime, breakers })
}

fn responders(llm: &ChatCompletionsClient) -> ResponderRegistry {
    let responder = |name: &'static str, instructions: &str| -> Arc<dyn Responder> {
        Arc::new(LlmResponder::new(llm.clone(), name, instructions))
    };

    let mut registry = ResponderRegistry::default();
    let discovery = responder("discovery", DISCOVERY_INSTRUCTIONS);
    registry.register_shared(FlowState::Init, Arc::clone(&discovery));
    registry.register_shared(FlowState::Discovery, Arc::clone(&discovery));
    registry.register(
        FlowState::Vision,
        LlmResponder::new(llm.clone(), "vision", VISION_INSTRUCTIONS)
            .idempotent_for_images("vision_identification"),
    );
    registry.register_shared(FlowState::SizeColor, responder("size_color", SIZE_INSTRUCTIONS));
    registry.register_shared(FlowState::Offer, responder("offer", OFFER_INSTRUCTIONS));
    registry.register(
        FlowState::PaymentDelivery,
        PaymentResponder::new(
            responder("payment_delivery", PAYMENT_INSTRUCTIONS),
            Arc::new(LoggingOrderSubmitter),
        ),
    );
    registry.register_shared(FlowState::Upsell, responder("upsell", UPSELL_INSTRUCTIONS));
    registry.register_shared(FlowState::Complaint, responder("complaint", COMPLAINT_INSTRUCTIONS));
    registry.register_shared(
        FlowState::OutOfDomain,
        responder("out_of_domain", OUT_OF_DOMAIN_INSTRUCTIONS),
    );
    registry.set_fallback(discovery);
    registry
}
