use ahash::AHasher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool, Row, postgres::PgRow};
use std::hash::{Hash, Hasher};

use crate::{
    message::{MessageId, MessageState, OutboxMessage},
    outbox::{AcknowledgeMessages, InsertMessages, InspectMessages, SelectPending},
};

/// Type alias for Postgres SqlxOutbox.
pub type PgSqlxOutbox = SqlxOutbox<sqlx::Postgres>;

const COLUMNS: &str = "id, destination, routing_key, payload, message_type, business_key, \
    state, attempt_count, version, created_at, last_attempt_at, next_attempt_at, last_error";

/// SQLx-based outbox driver.
///
/// One value serves both sides: business code inserts through the caller's
/// transaction, the relay polls and acknowledges through the pool.
pub struct SqlxOutbox<DB>
where
    DB: Database,
{
    pool: Pool<DB>,
    partition: Partition,
}

impl<DB> Clone for SqlxOutbox<DB>
where
    DB: Database,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            partition: self.partition,
        }
    }
}

/// Represents a partition configuration.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    pub id: u32,
    pub total: u32,
}

impl<DB> SqlxOutbox<DB>
where
    DB: Database,
{
    /// Creates a new uninitialized outbox with a SQLx pool.
    pub fn new_uninitialized(pool: Pool<DB>) -> Self {
        Self {
            pool,
            partition: Partition { id: 0, total: 1 },
        }
    }

    /// Restrict polling to one hash partition of the table.
    ///
    /// Rows are assigned a partition from their business key (or routing key)
    /// when inserted, so per-key ordering holds within a worker. Without
    /// partitions, concurrent relays rely on the version check alone.
    pub fn with_partitions(mut self, total: u32, partition_id: u32) -> Self {
        let total = total.max(1);
        self.partition = Partition {
            total,
            id: partition_id % total,
        };
        self
    }
}

impl SqlxOutbox<sqlx::Postgres> {
    /// Creates a new Postgres outbox and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::Pool<sqlx::Postgres>) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    /// Run a version-guarded update, reporting whether a row changed.
    async fn update(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<bool, Error> {
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl InsertMessages for SqlxOutbox<sqlx::Postgres> {
    type Error = Error;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(message_id = %message.id))]
    async fn insert_message(
        &self,
        message: OutboxMessage,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Error> {
        let key = message
            .business_key
            .as_deref()
            .unwrap_or(message.routing_key.as_str());
        let partition = calculate_partition(&key);

        sqlx::query(
            "INSERT INTO outbox_messages (id, partition, destination, routing_key, payload, \
             message_type, business_key, state, attempt_count, version, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(*message.id.as_uuid())
        .bind(partition)
        .bind(&message.destination)
        .bind(&message.routing_key)
        .bind(&message.payload)
        .bind(&message.message_type)
        .bind(&message.business_key)
        .bind(message.state.as_str())
        .bind(message.attempt_count as i32)
        .bind(message.version)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SelectPending for SqlxOutbox<sqlx::Postgres> {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(partition = ?self.partition))]
    async fn select_pending(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<OutboxMessage>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_messages \
             WHERE state IN ('PENDING', 'FAILED') \
             AND attempt_count < $1 \
             AND (next_attempt_at IS NULL OR next_attempt_at <= NOW()) \
             AND partition % $2 = $3 \
             ORDER BY created_at, seq LIMIT $4"
        ))
        .bind(max_attempts as i32)
        .bind(self.partition.total as i32)
        .bind(self.partition.id as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl AcknowledgeMessages for SqlxOutbox<sqlx::Postgres> {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn mark_sent(&self, id: MessageId, expected_version: i64) -> Result<bool, Error> {
        self.update(
            sqlx::query(
                "UPDATE outbox_messages \
                 SET state = 'SENT', last_attempt_at = NOW(), next_attempt_at = NULL, \
                 version = version + 1 \
                 WHERE id = $1 AND version = $2 AND state IN ('PENDING', 'FAILED')",
            )
            .bind(*id.as_uuid())
            .bind(expected_version),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn mark_confirmed(&self, id: MessageId, expected_version: i64) -> Result<bool, Error> {
        self.update(
            sqlx::query(
                "UPDATE outbox_messages SET state = 'CONFIRMED', version = version + 1 \
                 WHERE id = $1 AND version = $2 AND state = 'SENT'",
            )
            .bind(*id.as_uuid())
            .bind(expected_version),
        )
        .await
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_failed(
        &self,
        id: MessageId,
        expected_version: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        self.update(
            sqlx::query(
                "UPDATE outbox_messages \
                 SET state = 'FAILED', attempt_count = attempt_count + 1, \
                 last_attempt_at = NOW(), next_attempt_at = $3, last_error = $4, \
                 version = version + 1 \
                 WHERE id = $1 AND version = $2 AND state IN ('PENDING', 'SENT', 'FAILED')",
            )
            .bind(*id.as_uuid())
            .bind(expected_version)
            .bind(retry_at)
            .bind(error.to_owned()),
        )
        .await
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_dead(
        &self,
        id: MessageId,
        expected_version: i64,
        error: &str,
    ) -> Result<bool, Error> {
        self.update(
            sqlx::query(
                "UPDATE outbox_messages \
                 SET state = 'DEAD', attempt_count = attempt_count + 1, \
                 last_attempt_at = NOW(), next_attempt_at = NULL, last_error = $3, \
                 version = version + 1 \
                 WHERE id = $1 AND version = $2 AND state IN ('PENDING', 'SENT', 'FAILED')",
            )
            .bind(*id.as_uuid())
            .bind(expected_version)
            .bind(error.to_owned()),
        )
        .await
    }

    #[tracing::instrument(skip(self, error), fields(partition = ?self.partition))]
    async fn expire_unconfirmed(
        &self,
        sent_before: DateTime<Utc>,
        max_attempts: u32,
        error: &str,
    ) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
             SET state = CASE WHEN attempt_count + 1 >= $2 THEN 'DEAD' ELSE 'FAILED' END, \
             attempt_count = attempt_count + 1, next_attempt_at = NULL, last_error = $3, \
             version = version + 1 \
             WHERE state = 'SENT' AND last_attempt_at <= $1 \
             AND partition % $4 = $5",
        )
        .bind(sent_before)
        .bind(max_attempts as i32)
        .bind(error.to_owned())
        .bind(self.partition.total as i32)
        .bind(self.partition.id as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self), fields(partition = ?self.partition))]
    async fn bury_exhausted(&self, max_attempts: u32) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
             SET state = 'DEAD', next_attempt_at = NULL, \
             last_error = COALESCE(last_error, 'attempt budget exhausted'), \
             version = version + 1 \
             WHERE state IN ('PENDING', 'FAILED') AND attempt_count >= $1 \
             AND partition % $2 = $3",
        )
        .bind(max_attempts as i32)
        .bind(self.partition.total as i32)
        .bind(self.partition.id as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InspectMessages for SqlxOutbox<sqlx::Postgres> {
    type Error = Error;

    async fn find(&self, id: MessageId) -> Result<Option<OutboxMessage>, Error> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn dead_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_messages WHERE state = 'DEAD' \
             ORDER BY created_at, seq LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn requeue_dead(&self, id: MessageId) -> Result<bool, Error> {
        self.update(
            sqlx::query(
                "UPDATE outbox_messages \
                 SET state = 'PENDING', attempt_count = 0, next_attempt_at = NULL, \
                 version = version + 1 \
                 WHERE id = $1 AND state = 'DEAD'",
            )
            .bind(*id.as_uuid()),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn purge_confirmed(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE state = 'CONFIRMED' AND created_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, Error> {
    let id: uuid::Uuid = row.try_get("id")?;
    let state: String = row.try_get("state")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;

    Ok(OutboxMessage {
        id: MessageId::from(id),
        destination: row.try_get("destination")?,
        routing_key: row.try_get("routing_key")?,
        payload: row.try_get("payload")?,
        message_type: row.try_get("message_type")?,
        business_key: row.try_get("business_key")?,
        state: state.parse().map_err(Error::decode)?,
        attempt_count: u32::try_from(attempt_count).unwrap_or_default(),
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}

/// Ensures the outbox table and its indexes exist.
async fn create_table(pool: &sqlx::PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox_messages (
            seq BIGSERIAL,
            id UUID PRIMARY KEY,
            partition INT NOT NULL DEFAULT 0,
            destination TEXT NOT NULL,
            routing_key TEXT NOT NULL,
            payload BYTEA NOT NULL,
            message_type TEXT NOT NULL,
            business_key TEXT,
            state TEXT NOT NULL,
            attempt_count INT NOT NULL DEFAULT 0,
            version BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_attempt_at TIMESTAMPTZ,
            next_attempt_at TIMESTAMPTZ,
            last_error TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS outbox_messages_state_created_at \
         ON outbox_messages (state, created_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

/// Kinds of SQLx outbox errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    /// A stored row could not be mapped back to a message.
    Decode(String),
}

impl Error {
    fn decode(err: impl std::fmt::Display) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Decode(err.to_string()),
        }
    }

    pub fn kind(&self) -> &SqlxDriverErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxDriverErrorKind::Decode(err) => writeln!(f, "Decode error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Decode(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}

/// Calculates a partition from a key using a hash function.
fn calculate_partition<K: Hash>(key: &K) -> i32 {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % i32::MAX as u64) as i32
}
