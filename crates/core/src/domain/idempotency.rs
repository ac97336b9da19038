use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::conversation::SessionId;

/// Deterministic key of a side-effecting operation's logical input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub const PREFIX: &'static str = "sha256:";

    /// Hashes session, operation name and input parts. Every segment is length
    /// prefixed so `["ab", "c"]` and `["a", "bc"]` never collide.
    pub fn compute(session_id: &str, operation: &str, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for segment in [session_id, operation].into_iter().chain(parts.iter().copied()) {
            hasher.update((segment.len() as u64).to_be_bytes());
            hasher.update(segment.as_bytes());
        }
        Self(format!("{}{:x}", Self::PREFIX, hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Processed,
    Escalated,
    Blocked,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Escalated => "escalated",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "escalated" => Some(Self::Escalated),
            "blocked" => Some(Self::Blocked),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal records short-circuit duplicates. `Failed` may be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Escalated | Self::Blocked)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub hash: ContentHash,
    pub session_id: SessionId,
    pub operation: String,
    pub status: IdempotencyStatus,
    pub payload: Option<Value>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processing(hash: ContentHash, session_id: SessionId, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            hash,
            session_id,
            operation: operation.to_string(),
            status: IdempotencyStatus::Processing,
            payload: None,
            attempt_count: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentHash, IdempotencyStatus};

    #[test]
    fn status_round_trips_from_storage_encoding() {
        let cases = [
            IdempotencyStatus::Processing,
            IdempotencyStatus::Processed,
            IdempotencyStatus::Escalated,
            IdempotencyStatus::Blocked,
            IdempotencyStatus::Failed,
        ];
        for status in cases {
            assert_eq!(IdempotencyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(IdempotencyStatus::parse("done"), None);
    }

    #[test]
    fn only_settled_outcomes_are_terminal() {
        assert!(IdempotencyStatus::Processed.is_terminal());
        assert!(IdempotencyStatus::Escalated.is_terminal());
        assert!(IdempotencyStatus::Blocked.is_terminal());
        assert!(!IdempotencyStatus::Processing.is_terminal());
        assert!(!IdempotencyStatus::Failed.is_terminal());
    }

    #[test]
    fn content_hash_is_stable_and_segment_aware() {
        let first = ContentHash::compute("s1", "vision", &["https://cdn/a.jpg"]);
        let again = ContentHash::compute("s1", "vision", &["https://cdn/a.jpg"]);
        assert_eq!(first, again);
        assert!(first.as_str().starts_with("sha256:"));
        assert_eq!(first.as_str().len(), "sha256:".len() + 64);

        assert!(first.as_str()["sha256:".len()..]
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));

        assert_ne!(first, ContentHash::compute("s2", "vision", &["https://cdn/a.jpg"]));
        assert_ne!(
            ContentHash::compute("s1", "op", &["ab", "c"]),
            ContentHash::compute("s1", "op", &["a", "bc"])
        );
    }

    #[test]
    fn content_hash_matches_a_known_digest() {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for segment in ["s1", "op"] {
            hasher.update((segment.len() as u64).to_be_bytes());
            hasher.update(segment.as_bytes());
        }
        let expected = format!("sha256:{:x}", hasher.finalize());

        assert_eq!(ContentHash::compute("s1", "op", &[]).as_str(), expected);
    }
}
