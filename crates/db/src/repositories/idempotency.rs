use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use closer_core::domain::conversation::SessionId;
use closer_core::domain::idempotency::{ContentHash, IdempotencyRecord, IdempotencyStatus};
use closer_core::store::{IdempotencyStore, Reservation, StoreError};

use super::{format_timestamp, parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

const RECORD_COLUMNS: &str =
    "hash, session_id, operation, status, payload_json, attempt_count, created_at, updated_at";

pub struct SqlIdempotencyStore {
    pool: DbPool,
}

impl SqlIdempotencyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, hash: &ContentHash) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM idempotency_ledger WHERE hash = ?"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    pub async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<IdempotencyRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM idempotency_ledger
             WHERE session_id = ?
             ORDER BY created_at ASC, hash ASC"
        ))
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn save(&self, record: &IdempotencyRecord) -> Result<(), RepositoryError> {
        let payload_json = record.payload.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO idempotency_ledger (
                hash,
                session_id,
                operation,
                status,
                payload_json,
                attempt_count,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(hash) DO UPDATE SET
                session_id = excluded.session_id,
                operation = excluded.operation,
                status = excluded.status,
                payload_json = excluded.payload_json,
                attempt_count = excluded.attempt_count,
                updated_at = excluded.updated_at",
        )
        .bind(record.hash.as_str())
        .bind(record.session_id.as_str())
        .bind(&record.operation)
        .bind(record.status.as_str())
        .bind(payload_json)
        .bind(i64::from(record.attempt_count))
        .bind(format_timestamp(record.created_at))
        .bind(format_timestamp(record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reserve(
        &self,
        claim: &IdempotencyRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<Reservation, RepositoryError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO idempotency_ledger (
                hash, session_id, operation, status, payload_json, attempt_count, created_at, updated_at
             ) VALUES (?, ?, ?, 'processing', NULL, 1, ?, ?)
             ON CONFLICT(hash) DO NOTHING
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(claim.hash.as_str())
        .bind(claim.session_id.as_str())
        .bind(&claim.operation)
        .bind(format_timestamp(claim.created_at))
        .bind(format_timestamp(claim.updated_at))
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(Reservation::Acquired(record_from_row(row)?));
        }

        let taken_over = sqlx::query(&format!(
            "UPDATE idempotency_ledger SET
                session_id = ?,
                operation = ?,
                status = 'processing',
                payload_json = NULL,
                attempt_count = attempt_count + 1,
                updated_at = ?
             WHERE hash = ?
               AND (status = 'failed' OR (status = 'processing' AND updated_at < ?))
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(claim.session_id.as_str())
        .bind(&claim.operation)
        .bind(format_timestamp(claim.updated_at))
        .bind(claim.hash.as_str())
        .bind(format_timestamp(stale_before))
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = taken_over {
            return Ok(Reservation::Acquired(record_from_row(row)?));
        }

        match self.find(&claim.hash).await? {
            Some(existing) => Ok(Reservation::Existing(existing)),
            None => Err(RepositoryError::Decode(format!(
                "ledger record `{}` disappeared during reservation",
                claim.hash
            ))),
        }
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for SqlIdempotencyStore {
    async fn get(&self, hash: &ContentHash) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.find(hash).await?)
    }

    async fn upsert(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        Ok(self.save(record).await?)
    }

    async fn try_reserve(
        &self,
        claim: &IdempotencyRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        Ok(self.reserve(claim, stale_before).await?)
    }
}

fn record_from_row(row: SqliteRow) -> Result<IdempotencyRecord, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = IdempotencyStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown idempotency status `{status_raw}`"))
    })?;
    let payload = row
        .try_get::<Option<String>, _>("payload_json")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(IdempotencyRecord {
        hash: ContentHash(row.try_get("hash")?),
        session_id: SessionId(row.try_get("session_id")?),
        operation: row.try_get("operation")?,
        status,
        payload,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use closer_core::domain::conversation::SessionId;
    use closer_core::domain::idempotency::{ContentHash, IdempotencyRecord, IdempotencyStatus};
    use closer_core::store::{IdempotencyStore, Reservation};

    use super::SqlIdempotencyStore;
    use crate::migrations;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn claim(hash: &str) -> IdempotencyRecord {
        IdempotencyRecord::processing(
            ContentHash(hash.to_string()),
            SessionId("s1".to_string()),
            "vision",
        )
    }

    #[tokio::test]
    async fn upsert_round_trips_and_keeps_created_at() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone());
        let mut record = claim("sha256:01");
        store.upsert(&record).await.expect("insert");

        let created_at = record.created_at;
        record.status = IdempotencyStatus::Processed;
        record.payload = Some(json!({"messages": ["found it"]}));
        record.created_at = created_at + Duration::hours(1);
        record.updated_at = Utc::now();
        store.upsert(&record).await.expect("update");

        let found = store.get(&record.hash).await.expect("get").expect("record exists");
        assert_eq!(found.status, IdempotencyStatus::Processed);
        assert_eq!(found.payload, Some(json!({"messages": ["found it"]})));
        assert_eq!(
            found.created_at.timestamp_micros(),
            created_at.timestamp_micros(),
            "created_at survives upsert"
        );

        pool.close().await;
    }

    #[tokio::test]
    async fn reserve_inserts_once_then_reports_existing() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone());
        let stale_before = Utc::now() - Duration::minutes(5);

        let first = store.try_reserve(&claim("sha256:02"), stale_before).await.expect("reserve");
        assert!(matches!(first, Reservation::Acquired(ref record) if record.attempt_count == 1));

        let second = store.try_reserve(&claim("sha256:02"), stale_before).await.expect("reserve");
        assert!(matches!(
            second,
            Reservation::Existing(ref record) if record.status == IdempotencyStatus::Processing
        ));

        pool.close().await;
    }

    #[tokio::test]
    async fn reserve_takes_over_failed_and_stale_records() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone());

        let mut failed = claim("sha256:03");
        failed.status = IdempotencyStatus::Failed;
        store.upsert(&failed).await.expect("seed failed");
        let retaken = store
            .try_reserve(&claim("sha256:03"), Utc::now() - Duration::minutes(5))
            .await
            .expect("reserve");
        assert!(matches!(retaken, Reservation::Acquired(ref record) if record.attempt_count == 2));

        let mut stale = claim("sha256:04");
        stale.updated_at = Utc::now() - Duration::minutes(30);
        store.upsert(&stale).await.expect("seed stale");
        let stolen = store
            .try_reserve(&claim("sha256:04"), Utc::now() - Duration::minutes(5))
            .await
            .expect("reserve");
        assert!(matches!(stolen, Reservation::Acquired(_)));

        let mut settled = claim("sha256:05");
        settled.status = IdempotencyStatus::Escalated;
        settled.updated_at = Utc::now() - Duration::days(3);
        store.upsert(&settled).await.expect("seed settled");
        let untouched = store
            .try_reserve(&claim("sha256:05"), Utc::now() - Duration::minutes(5))
            .await
            .expect("reserve");
        assert!(matches!(
            untouched,
            Reservation::Existing(ref record) if record.status == IdempotencyStatus::Escalated
        ));

        pool.close().await;
    }

    #[tokio::test]
    async fn lists_records_for_one_session() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone());
        store.upsert(&claim("sha256:10")).await.expect("insert");
        store.upsert(&claim("sha256:11")).await.expect("insert");
        let mut other = claim("sha256:12");
        other.session_id = SessionId("s2".to_string());
        store.upsert(&other).await.expect("insert");

        let records =
            store.list_for_session(&SessionId("s1".to_string())).await.expect("list");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.session_id.as_str() == "s1"));

        pool.close().await;
    }
}
