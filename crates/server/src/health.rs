use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use closer_core::breaker::{CircuitBreakerRegistry, CircuitState};
use closer_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    breakers: Arc<CircuitBreakerRegistry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    /// Informational; an open breaker does not make the service unready.
    pub dependencies: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, breakers: Arc<CircuitBreakerRegistry>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, breakers })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "closer-server runtime initialized".to_string(),
        },
        database,
        dependencies: dependency_check(&state.breakers),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn dependency_check(breakers: &CircuitBreakerRegistry) -> HealthCheck {
    let open = breakers
        .statuses()
        .into_iter()
        .filter(|(_, status)| status.state == CircuitState::Open)
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    if open.is_empty() {
        HealthCheck { status: "ready", detail: "no open circuits".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: format!("open circuits: {}", open.join(", ")) }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use closer_core::breaker::CircuitBreakerRegistry;
    use closer_db::connect_with_settings;

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("pool should connect");
        let breakers = Arc::new(CircuitBreakerRegistry::default());

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), breakers })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.dependencies.status, "ready");

        pool.close().await;
    }

    #[tokio::test]
    async fn open_circuit_is_reported_without_failing_readiness() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("pool should connect");
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let llm = breakers.get_or_create("llm");
        for _ in 0..5 {
            llm.record_failure("503");
        }

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), breakers })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.dependencies.status, "degraded");
        assert!(payload.dependencies.detail.contains("llm"));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) = health(State(HealthState {
            db_pool: pool,
            breakers: Arc::new(CircuitBreakerRegistry::default()),
        }))
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}
