//! Outbox abstractions and backend drivers.
//!
//! This module implements the *outbox pattern*: a message describing a
//! business change is persisted in the same local transaction as the change
//! itself, and delivered asynchronously by the [`Relay`](crate::Relay).
//!
//! The outbox is responsible for **durability and ordering**, while delivery
//! concerns are delegated to the relay and transport layers.
//!
//! ## Responsibilities
//!
//! - Persist messages atomically with application state
//! - Hand eligible messages to the relay in creation order
//! - Record delivery progress with version-checked single-row updates
//! - Keep dead messages queryable for operators
//!
//! ## Components
//!
//! - [`Outbox`]: Writer façade used inside business transactions
//! - [`OutboxSpec`]: Where and how a captured result is published
//! - [`InsertMessages`]: Trait for inserting messages inside a transaction
//! - [`SelectPending`]: Trait for fetching messages eligible for delivery
//! - [`AcknowledgeMessages`]: Trait for recording delivery progress
//! - [`InspectMessages`]: Trait for operator queries, replay and retention
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_core::future::BoxFuture;
use serde::Serialize;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::message::{MessageId, OutboxMessage};

/// Error returned by outbox write operations.
///
/// Any of these aborts the write: the caller must roll back its transaction.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Classification of outbox write errors.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The payload could not be encoded.
    Serialization(serde_json::Error),
    /// The backend failed to insert the message.
    Persistence(tower::BoxError),
    /// The business key path did not resolve against the captured result.
    BusinessKey(String),
    /// The wrapped business operation failed; nothing was inserted.
    Operation(tower::BoxError),
}

impl OutboxError {
    fn new(kind: OutboxErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub(crate) fn persistence(err: tower::BoxError) -> Self {
        Self::new(OutboxErrorKind::Persistence(err))
    }

    fn serialization(err: serde_json::Error) -> Self {
        Self::new(OutboxErrorKind::Serialization(err))
    }

    fn business_key(path: &str) -> Self {
        Self::new(OutboxErrorKind::BusinessKey(path.to_owned()))
    }

    fn operation(err: tower::BoxError) -> Self {
        Self::new(OutboxErrorKind::Operation(err))
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Serialization(err) => writeln!(f, "Serialization error: {err}"),
            OutboxErrorKind::Persistence(err) => writeln!(f, "Persistence error: {err}"),
            OutboxErrorKind::BusinessKey(path) => {
                writeln!(f, "Business key `{path}` not found in result")
            }
            OutboxErrorKind::Operation(err) => writeln!(f, "Business operation failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Serialization(err) => Some(err),
            OutboxErrorKind::Persistence(err) => Some(err.as_ref()),
            OutboxErrorKind::BusinessKey(_) => None,
            OutboxErrorKind::Operation(err) => Some(err.as_ref()),
        }
    }
}

/// How a business key is derived from a captured result.
#[derive(Clone)]
pub enum BusinessKey {
    /// Dot-separated field path over the JSON form of the result, e.g.
    /// `order_no` or `order.lines.0.sku`. Numeric segments index arrays.
    Path(String),
    /// Custom extraction over the JSON form of the result.
    Extract(Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>),
}

impl BusinessKey {
    pub fn path(path: impl Into<String>) -> Self {
        BusinessKey::Path(path.into())
    }

    pub fn extract<F>(f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Option<String> + Send + Sync + 'static,
    {
        BusinessKey::Extract(Arc::new(f))
    }

    fn resolve(&self, value: &serde_json::Value) -> Result<String, OutboxError> {
        match self {
            BusinessKey::Path(path) => {
                lookup_path(value, path).ok_or_else(|| OutboxError::business_key(path))
            }
            BusinessKey::Extract(f) => f(value).ok_or_else(|| OutboxError::business_key("<fn>")),
        }
    }
}

impl std::fmt::Debug for BusinessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusinessKey::Path(path) => f.debug_tuple("Path").field(path).finish(),
            BusinessKey::Extract(_) => f.write_str("Extract(..)"),
        }
    }
}

/// Resolve a field path; scalars are rendered as strings.
fn lookup_path(value: &serde_json::Value, path: &str) -> Option<String> {
    let target = path
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => {
                segment.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        })?;

    match target {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Publication settings for a captured business result.
#[derive(Debug, Clone)]
pub struct OutboxSpec {
    pub destination: String,
    pub routing_key: String,
    pub message_type: String,
    pub business_key: Option<BusinessKey>,
}

impl OutboxSpec {
    pub fn new(
        destination: impl Into<String>,
        routing_key: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            routing_key: routing_key.into(),
            message_type: message_type.into(),
            business_key: None,
        }
    }

    pub fn with_business_key(mut self, key: BusinessKey) -> Self {
        self.business_key = Some(key);
        self
    }

    /// Build the outbox row for `value`.
    fn message_for<T: Serialize>(&self, value: &T) -> Result<OutboxMessage, OutboxError> {
        let json = serde_json::to_value(value).map_err(OutboxError::serialization)?;
        let business_key = self
            .business_key
            .as_ref()
            .map(|key| key.resolve(&json))
            .transpose()?;
        let payload = serde_json::to_vec(&json).map_err(OutboxError::serialization)?;

        Ok(OutboxMessage::new(
            self.destination.clone(),
            self.routing_key.clone(),
            payload,
            self.message_type.clone(),
            business_key,
        ))
    }
}

/// Writer façade over an outbox backend.
///
/// Every method must be called while the caller's transaction is still open,
/// and every error must make the caller roll back. Nothing is sent to the
/// broker from here: delivery belongs to the relay, so a crash right after
/// commit cannot lose a message.
#[derive(Clone)]
pub struct Outbox<D>(D);

impl<D> Outbox<D>
where
    D: InsertMessages + Clone + Send + Sync,
    D::Error: Into<tower::BoxError>,
{
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Insert a pre-serialized message and return its id.
    ///
    /// The id may be attached to an immediate best-effort publish, but
    /// delivery is guaranteed by the relay regardless.
    #[instrument(skip(self, payload, tx))]
    pub async fn save_message(
        &self,
        destination: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>> + Send,
        message_type: &str,
        business_key: Option<&str>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<MessageId, OutboxError> {
        let message = OutboxMessage::new(
            destination,
            routing_key,
            payload,
            message_type,
            business_key.map(str::to_owned),
        );
        self.insert(message, tx).await
    }

    /// Serialize `event` as JSON and insert it according to `spec`.
    #[instrument(skip_all, fields(message_type = %spec.message_type))]
    pub async fn save_event<E>(
        &self,
        spec: &OutboxSpec,
        event: &E,
        tx: &mut D::Transaction<'_>,
    ) -> Result<MessageId, OutboxError>
    where
        E: Serialize + Sync,
    {
        let message = spec.message_for(event)?;
        self.insert(message, tx).await
    }

    /// Run a business operation and capture its result as an outbox message.
    ///
    /// `op` receives the open transaction. When it succeeds, its result is
    /// serialized as the payload, the business key is resolved from it, and
    /// the row is inserted in the same transaction before the result is
    /// returned. When it fails, nothing is inserted and the error is returned
    /// as [`OutboxErrorKind::Operation`].
    ///
    /// ```ignore
    /// let order = outbox
    ///     .intercept(&spec, &mut tx, |tx| Box::pin(async move { orders.create(req, tx).await }))
    ///     .await?;
    /// tx.commit().await?;
    /// ```
    #[instrument(skip_all, fields(message_type = %spec.message_type))]
    pub async fn intercept<'t, T, E, F>(
        &self,
        spec: &OutboxSpec,
        tx: &mut D::Transaction<'t>,
        op: F,
    ) -> Result<T, OutboxError>
    where
        T: Serialize + Send,
        E: Into<tower::BoxError>,
        F: for<'c> FnOnce(&'c mut D::Transaction<'t>) -> BoxFuture<'c, Result<T, E>>,
    {
        let result = op(tx).await.map_err(|e| OutboxError::operation(e.into()))?;
        let message = spec.message_for(&result)?;
        self.insert(message, tx).await?;
        Ok(result)
    }

    async fn insert(
        &self,
        message: OutboxMessage,
        tx: &mut D::Transaction<'_>,
    ) -> Result<MessageId, OutboxError> {
        let id = message.id;
        self.0
            .insert_message(message, tx)
            .await
            .map_err(|e| OutboxError::persistence(e.into()))?;
        tracing::debug!(message_id = %id, "Message stored in outbox");
        Ok(id)
    }
}

/// Trait for inserting messages into the outbox.
///
/// Implementations must write through the caller's transaction so the row
/// commits or rolls back together with the business change.
#[async_trait::async_trait]
pub trait InsertMessages {
    /// Backend-specific error type.
    type Error;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>: Send;

    /// Insert a message inside `tx`.
    async fn insert_message(
        &self,
        message: OutboxMessage,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for fetching messages eligible for delivery.
#[async_trait::async_trait]
pub trait SelectPending {
    /// Backend-specific error type.
    type Error;

    /// Return up to `limit` messages in `PENDING` or `FAILED` state with
    /// fewer than `max_attempts` failed attempts and an elapsed backoff,
    /// oldest first.
    async fn select_pending(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<OutboxMessage>, Self::Error>;
}

/// Trait for recording delivery progress.
///
/// Each update touches one row and applies only if the row still has
/// `expected_version` and a state the transition may leave. The boolean
/// result reports whether the update applied; `false` means a concurrent
/// worker already advanced the row, which is not an error.
#[async_trait::async_trait]
pub trait AcknowledgeMessages {
    /// Backend-specific error type.
    type Error;

    /// `PENDING|FAILED → SENT`.
    async fn mark_sent(&self, id: MessageId, expected_version: i64) -> Result<bool, Self::Error>;

    /// `SENT → CONFIRMED`.
    async fn mark_confirmed(
        &self,
        id: MessageId,
        expected_version: i64,
    ) -> Result<bool, Self::Error>;

    /// `PENDING|SENT|FAILED → FAILED`, incrementing the attempt count and
    /// gating the next attempt until `retry_at`.
    async fn mark_failed(
        &self,
        id: MessageId,
        expected_version: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// `PENDING|SENT|FAILED → DEAD`, incrementing the attempt count.
    async fn mark_dead(
        &self,
        id: MessageId,
        expected_version: i64,
        error: &str,
    ) -> Result<bool, Self::Error>;

    /// Count a failed attempt against every `SENT` row sent at or before
    /// `sent_before`: the row becomes `FAILED`, immediately eligible, or `DEAD`
    /// once its attempt count reaches `max_attempts`. Returns the rows moved.
    async fn expire_unconfirmed(
        &self,
        sent_before: DateTime<Utc>,
        max_attempts: u32,
        error: &str,
    ) -> Result<u64, Self::Error>;

    /// `PENDING|FAILED → DEAD` for rows whose attempt count already reached
    /// `max_attempts`, e.g. after the budget was lowered. Returns the rows
    /// moved.
    async fn bury_exhausted(&self, max_attempts: u32) -> Result<u64, Self::Error>;
}

/// Operator queries, manual replay and retention.
#[async_trait::async_trait]
pub trait InspectMessages {
    /// Backend-specific error type.
    type Error;

    /// Fetch a single message.
    async fn find(&self, id: MessageId) -> Result<Option<OutboxMessage>, Self::Error>;

    /// Messages that exhausted their retry budget, oldest first.
    async fn dead_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>, Self::Error>;

    /// `DEAD → PENDING` with a fresh retry budget. Returns `false` if the
    /// message is not dead.
    async fn requeue_dead(&self, id: MessageId) -> Result<bool, Self::Error>;

    /// Delete `CONFIRMED` messages created before `older_than`.
    async fn purge_confirmed(&self, older_than: DateTime<Utc>) -> Result<u64, Self::Error>;
}
