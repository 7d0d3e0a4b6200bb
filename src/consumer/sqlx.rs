use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    consumer::{ConsumptionRecord, ConsumptionStore},
    message::MessageId,
    outbox::sqlx::Error,
};

/// Postgres consumption store.
///
/// Records live in `consumption_records`, keyed by message id, so a
/// duplicate insert is a no-op rather than an error.
#[derive(Clone)]
pub struct PgConsumptionStore {
    pool: sqlx::PgPool,
}

impl PgConsumptionStore {
    /// Creates a new store and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS consumption_records (
                message_id UUID PRIMARY KEY,
                message_type TEXT,
                consumed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ConsumptionStore for PgConsumptionStore {
    type Error = Error;

    async fn is_consumed(&self, id: MessageId) -> Result<bool, Error> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM consumption_records WHERE message_id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    #[tracing::instrument(skip_all, fields(message_id = %record.message_id))]
    async fn record(&self, record: ConsumptionRecord) -> Result<bool, Error> {
        let result = sqlx::query(
            "INSERT INTO consumption_records (message_id, message_type, consumed_at) \
             VALUES ($1, $2, $3) ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(*record.message_id.as_uuid())
        .bind(&record.message_type)
        .bind(record.consumed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_before(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM consumption_records WHERE consumed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test]
    async fn duplicate_record_is_ignored(pool: PgPool) {
        let store = PgConsumptionStore::try_new(pool).await.unwrap();
        let id = MessageId::new();

        assert!(!store.is_consumed(id).await.unwrap());
        let record = ConsumptionRecord::new(id, Some("ORDER_CREATED".into()));
        assert!(store.record(record).await.unwrap());
        assert!(!store.record(ConsumptionRecord::new(id, None)).await.unwrap());
        assert!(store.is_consumed(id).await.unwrap());
    }

    #[sqlx::test]
    async fn purge_removes_old_records(pool: PgPool) {
        let store = PgConsumptionStore::try_new(pool).await.unwrap();
        let mut old = ConsumptionRecord::new(MessageId::new(), None);
        old.consumed_at = Utc::now() - chrono::Duration::days(30);
        store.record(old.clone()).await.unwrap();

        let purged = store
            .purge_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(!store.is_consumed(old.message_id).await.unwrap());
    }
}
