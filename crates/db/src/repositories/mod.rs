use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use closer_core::store::StoreError;

pub mod conversation;
pub mod idempotency;
pub mod memory;

pub use conversation::SqlConversationStore;
pub use idempotency::SqlIdempotencyStore;
pub use memory::{InMemoryConversationStore, InMemoryIdempotencyStore};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => StoreError::Backend(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
            RepositoryError::Serialization(error) => StoreError::Decode(error.to_string()),
        }
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{format_timestamp, parse_timestamp, parse_u32, RepositoryError};
    use closer_core::store::StoreError;

    #[test]
    fn timestamps_round_trip_with_fixed_width() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid date");
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("valid date");
        let (early_text, late_text) = (format_timestamp(early), format_timestamp(late));

        assert_eq!(early_text.len(), late_text.len());
        assert!(early_text < late_text);
        assert_eq!(parse_timestamp("updated_at", early_text).expect("parse"), early);
    }

    #[test]
    fn decode_problems_surface_as_store_decode_errors() {
        assert!(matches!(parse_u32("attempt_count", -1), Err(RepositoryError::Decode(_))));
        let error = StoreError::from(RepositoryError::Decode("bad row".to_string()));
        assert_eq!(error, StoreError::Decode("bad row".to_string()));
    }
}
