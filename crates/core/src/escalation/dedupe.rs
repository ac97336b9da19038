use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bounded set of escalation keys that recently triggered a notification.
///
/// A key is suppressed while it was last triggered less than `window` ago.
/// Duplicates refresh the key's position and timestamp, so a session that keeps
/// escalating stays quiet until it has been silent for a full window. When the
/// set is full the least recently triggered key is evicted.
#[derive(Debug)]
pub struct ActiveEscalations {
    capacity: usize,
    window: Duration,
    inner: Mutex<DedupeInner>,
}

#[derive(Debug, Default)]
struct DedupeInner {
    order: VecDeque<String>,
    seen: HashMap<String, Instant>,
}

impl DedupeInner {
    fn remove(&mut self, key: &str) {
        if self.seen.remove(key).is_some() {
            self.order.retain(|existing| existing != key);
        }
    }

    fn purge_expired(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.order.front() {
            let expired = self
                .seen
                .get(front)
                .map_or(true, |stamp| now.saturating_duration_since(*stamp) >= window);
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }
}

impl ActiveEscalations {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self { capacity: capacity.max(1), window, inner: Mutex::new(DedupeInner::default()) }
    }

    /// Returns `true` when the caller should dispatch a notification for `key`.
    pub fn try_insert(&self, key: &str) -> bool {
        self.try_insert_at(key, Instant::now())
    }

    pub fn try_insert_at(&self, key: &str, now: Instant) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.purge_expired(now, self.window);

        let duplicate = inner.seen.contains_key(key);
        inner.remove(key);
        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(evicted) => {
                    inner.seen.remove(&evicted);
                }
                None => break,
            }
        }
        inner.order.push_back(key.to_string());
        inner.seen.insert(key.to_string(), now);

        !duplicate
    }

    /// Forgets `key`, e.g. after an operator resolved the escalation.
    pub fn release(&self, key: &str) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.remove(key);
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.order.len(),
            Err(poisoned) => poisoned.into_inner().order.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::ActiveEscalations;

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let set = ActiveEscalations::new(10, Duration::from_secs(600));
        let now = Instant::now();
        assert!(set.try_insert_at("s1:price", now));
        assert!(!set.try_insert_at("s1:price", now + Duration::from_secs(5)));
        assert!(set.try_insert_at("s2:price", now + Duration::from_secs(5)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn key_is_allowed_again_after_quiet_window() {
        let set = ActiveEscalations::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(set.try_insert_at("s1:vision", now));
        assert!(set.try_insert_at("s1:vision", now + Duration::from_secs(61)));
    }

    #[test]
    fn duplicates_extend_the_window() {
        let set = ActiveEscalations::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(set.try_insert_at("k", now));
        assert!(!set.try_insert_at("k", now + Duration::from_secs(50)));
        assert!(!set.try_insert_at("k", now + Duration::from_secs(100)));
        assert!(set.try_insert_at("k", now + Duration::from_secs(161)));
    }

    #[test]
    fn capacity_evicts_least_recently_triggered_key() {
        let set = ActiveEscalations::new(2, Duration::from_secs(600));
        let now = Instant::now();
        assert!(set.try_insert_at("a", now));
        assert!(set.try_insert_at("b", now));
        // touching "a" makes "b" the eviction candidate
        assert!(!set.try_insert_at("a", now));
        assert!(set.try_insert_at("c", now));
        assert_eq!(set.len(), 2);
        assert!(!set.try_insert_at("a", now));
        assert!(set.try_insert_at("b", now));
    }

    #[test]
    fn release_allows_immediate_renotification() {
        let set = ActiveEscalations::new(4, Duration::from_secs(600));
        assert!(set.try_insert("s1:complaint"));
        set.release("s1:complaint");
        assert!(set.is_empty());
        assert!(set.try_insert("s1:complaint"));
    }
}
