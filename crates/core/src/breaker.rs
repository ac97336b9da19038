//! Per-dependency circuit breakers.
//!
//! Each breaker keeps its whole state behind one mutex so that the
//! OPEN -> HALF_OPEN transition and probe-slot reservation in
//! [`CircuitBreaker::can_execute`] happen in a single critical section.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub can_execute: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
            opened_at: None,
            last_failure_time: None,
        }
    }

    fn recovery_elapsed(&self, now: Instant, timeout: Duration) -> bool {
        self.opened_at.map_or(true, |opened| now.saturating_duration_since(opened) >= timeout)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self { name: name.into(), config, inner: Mutex::new(BreakerInner::closed()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admits a call. Moves OPEN to HALF_OPEN once the recovery timeout has
    /// elapsed and reserves a probe slot while HALF_OPEN.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    pub(crate) fn can_execute_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !inner.recovery_elapsed(now, self.config.recovery_timeout) {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 1;
                info!(
                    event_name = "resilience.breaker.half_open",
                    dependency = %self.name,
                    "recovery timeout elapsed, admitting probe call"
                );
                true
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(
                event_name = "resilience.breaker.closed",
                dependency = %self.name,
                "probe succeeded, closing circuit"
            );
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self, error: &str) {
        self.record_failure_at(error, Instant::now());
    }

    pub(crate) fn record_failure_at(&self, error: &str, now: Instant) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        event_name = "resilience.breaker.opened",
                        dependency = %self.name,
                        failure_count = inner.failure_count,
                        error = %error,
                        "failure threshold reached, opening circuit"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_calls = 0;
                inner.opened_at = Some(now);
                warn!(
                    event_name = "resilience.breaker.reopened",
                    dependency = %self.name,
                    error = %error,
                    "probe failed, reopening circuit"
                );
            }
            CircuitState::Open => {
                inner.opened_at = Some(now);
            }
        }
    }

    /// Snapshot without side effects; `can_execute` reports what the next call would get.
    pub fn get_status(&self) -> BreakerStatus {
        self.get_status_at(Instant::now())
    }

    pub(crate) fn get_status_at(&self, now: Instant) -> BreakerStatus {
        let inner = self.lock();
        let can_execute = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.recovery_elapsed(now, self.config.recovery_timeout),
            CircuitState::HalfOpen => inner.half_open_calls < self.config.half_open_max_calls,
        };
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
            can_execute,
        }
    }

    pub fn reset(&self) {
        *self.lock() = BreakerInner::closed();
        info!(event_name = "resilience.breaker.reset", dependency = %self.name, "circuit reset");
    }
}

/// Process-wide set of breakers keyed by dependency name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        match self.breakers.lock() {
            Ok(breakers) => breakers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Returns `false` when no breaker exists under `name`.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        breakers.into_iter().map(|breaker| (breaker.name.clone(), breaker.get_status())).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(recovery_secs),
                half_open_max_calls: 1,
            },
        )
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let breaker = breaker(3, 60);
        let now = Instant::now();
        breaker.record_failure_at("timeout", now);
        breaker.record_failure_at("timeout", now);
        assert!(breaker.can_execute_at(now));
        breaker.record_failure_at("timeout", now);
        assert!(!breaker.can_execute_at(now));
        assert_eq!(breaker.get_status_at(now).state, CircuitState::Open);
    }

    #[test]
    fn recovers_through_half_open_probe() {
        let breaker = breaker(2, 60);
        let now = Instant::now();
        breaker.record_failure_at("boom", now);
        breaker.record_failure_at("boom", now);
        assert!(!breaker.can_execute_at(now + Duration::from_secs(59)));

        let later = now + Duration::from_secs(60);
        assert!(breaker.get_status_at(later).can_execute);
        assert_eq!(breaker.get_status_at(later).state, CircuitState::Open);
        assert!(breaker.can_execute_at(later));
        assert_eq!(breaker.get_status_at(later).state, CircuitState::HalfOpen);
        // single probe slot is taken
        assert!(!breaker.can_execute_at(later));

        breaker.record_success();
        let status = breaker.get_status_at(later);
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure_time.is_some());
    }

    #[test]
    fn failed_probe_reopens_and_restarts_timer() {
        let breaker = breaker(1, 30);
        let now = Instant::now();
        breaker.record_failure_at("boom", now);
        let probe_time = now + Duration::from_secs(30);
        assert!(breaker.can_execute_at(probe_time));
        breaker.record_failure_at("still down", probe_time);

        assert_eq!(breaker.get_status_at(probe_time).state, CircuitState::Open);
        assert!(!breaker.can_execute_at(probe_time + Duration::from_secs(29)));
        assert!(breaker.can_execute_at(probe_time + Duration::from_secs(30)));
    }

    #[test]
    fn success_in_closed_state_resets_consecutive_count() {
        let breaker = breaker(3, 60);
        let now = Instant::now();
        breaker.record_failure_at("a", now);
        breaker.record_failure_at("b", now);
        breaker.record_success();
        breaker.record_failure_at("c", now);
        breaker.record_failure_at("d", now);
        assert!(breaker.can_execute_at(now));
        assert_eq!(breaker.get_status_at(now).failure_count, 2);
    }

    #[test]
    fn concurrent_half_open_callers_get_one_probe() {
        let breaker = Arc::new(breaker(1, 0));
        breaker.record_failure("boom");

        let admitted: usize = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || breaker.can_execute())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap_or(false)))
            .sum();

        assert_eq!(admitted, 1);
    }

    #[test]
    fn registry_shares_one_breaker_per_dependency() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        let first = registry.get_or_create("notifications");
        let second = registry.get_or_create("notifications");
        assert!(Arc::ptr_eq(&first, &second));

        first.record_failure("webhook 503");
        assert!(!second.can_execute());
        assert_eq!(registry.statuses()["notifications"].state, CircuitState::Open);

        assert!(registry.reset("notifications"));
        assert!(second.can_execute());
        assert!(!registry.reset("missing"));
        assert!(registry.get("missing").is_none());
    }
}
