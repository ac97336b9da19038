//! Call middleware for unreliable dependencies.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use closer_core::breaker::CircuitBreaker;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("circuit for `{dependency}` is open")]
    Open { dependency: String },
    #[error("call to `{dependency}` timed out after {timeout:?}")]
    Timeout { dependency: String, timeout: Duration },
    #[error("call to `{dependency}` failed: {source}")]
    Failed {
        dependency: String,
        #[source]
        source: anyhow::Error,
    },
}

impl CallError {
    pub fn dependency(&self) -> &str {
        match self {
            Self::Open { dependency }
            | Self::Timeout { dependency, .. }
            | Self::Failed { dependency, .. } => dependency,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Open { .. } => "dependency_unavailable",
            Self::Timeout { .. } => "dependency_timeout",
            Self::Failed { .. } => "dependency_failed",
        }
    }
}

/// Runs `call` under `breaker` with a deadline.
///
/// The breaker is asked before the call starts; timeouts and errors count as
/// failures, and the future is dropped on timeout so nothing is left pending.
pub async fn with_circuit_breaker<T, F>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    call: F,
) -> Result<T, CallError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let dependency = breaker.name().to_string();
    if !breaker.can_execute() {
        warn!(
            event_name = "resilience.call.rejected",
            dependency = %dependency,
            "circuit open, failing fast"
        );
        return Err(CallError::Open { dependency });
    }

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => {
            breaker.record_success();
            Ok(value)
        }
        Ok(Err(source)) => {
            breaker.record_failure(&source.to_string());
            Err(CallError::Failed { dependency, source })
        }
        Err(_) => {
            breaker.record_failure("timeout");
            warn!(
                event_name = "resilience.call.timeout",
                dependency = %dependency,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "dependency call timed out"
            );
            Err(CallError::Timeout { dependency, timeout })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use closer_core::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

    use super::{with_circuit_breaker, CallError};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        )
    }

    #[tokio::test]
    async fn success_passes_value_through() {
        let breaker = breaker(2);
        let value = with_circuit_breaker(&breaker, Duration::from_secs(1), async { Ok(7) })
            .await
            .expect("call succeeds");
        assert_eq!(value, 7);
        assert_eq!(breaker.get_status().failure_count, 0);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_and_opens_circuit() {
        let breaker = breaker(1);
        let result: Result<(), CallError> =
            with_circuit_breaker(&breaker, Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CallError::Timeout { .. })));
        assert_eq!(breaker.get_status().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_skips_the_call() {
        let breaker = breaker(1);
        breaker.record_failure("boom");
        let calls = AtomicUsize::new(0);

        let result = with_circuit_breaker(&breaker, Duration::from_secs(1), async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        let error = result.expect_err("circuit is open");
        assert!(error.is_open());
        assert_eq!(error.code(), "dependency_unavailable");
        assert_eq!(error.dependency(), "llm");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn errors_are_wrapped_with_dependency_name() {
        let breaker = breaker(3);
        let result: Result<(), CallError> =
            with_circuit_breaker(&breaker, Duration::from_secs(1), async {
                Err(anyhow::anyhow!("503 from upstream"))
            })
            .await;

        let error = result.expect_err("call fails");
        assert_eq!(error.to_string(), "call to `llm` failed: 503 from upstream");
        assert_eq!(breaker.get_status().failure_count, 1);
    }
}
