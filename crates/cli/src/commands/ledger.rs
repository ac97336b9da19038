use closer_core::domain::idempotency::ContentHash;
use closer_db::SqlIdempotencyStore;

use crate::commands::{with_database, CommandResult};

pub fn run(hash: &str) -> CommandResult {
    let hash = ContentHash(hash.trim().to_string());
    if !hash.as_str().starts_with(ContentHash::PREFIX) {
        return CommandResult::failure(
            "ledger",
            "invalid_argument",
            format!("ledger hashes start with `{}`", ContentHash::PREFIX),
            6,
        );
    }

    let lookup = hash.clone();
    let result = with_database("ledger", |pool| async move {
        let record = SqlIdempotencyStore::new(pool)
            .find(&lookup)
            .await
            .map_err(|error| ("query", error.to_string(), 7u8))?;
        record
            .map(|record| {
                let status = record.status.as_str();
                serde_json::to_value(&record)
                    .map(|value| (status, value))
                    .map_err(|error| ("serialization", error.to_string(), 7u8))
            })
            .transpose()
    });

    match result {
        Ok(Some((status, record))) => {
            CommandResult::success_with_data("ledger", format!("record is {status}"), record)
        }
        Ok(None) => {
            CommandResult::failure("ledger", "not_found", format!("no ledger record `{hash}`"), 6)
        }
        Err(failure) => failure,
    }
}
