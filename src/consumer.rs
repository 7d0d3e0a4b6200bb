//! Idempotent consumption of relayed messages.
//!
//! Delivery is at-least-once: the relay may publish a message again after a
//! crash or a lost update, and brokers redeliver unacknowledged messages. The
//! [`IdempotentConsumer`] guard makes the business effect happen once per
//! [`MessageId`]:
//!
//! - A delivery without a message id is dead-lettered.
//! - A delivery whose id was already consumed is acknowledged and skipped.
//! - Otherwise the handler runs; on success the id is recorded, then the
//!   delivery is acknowledged.
//! - A failed handler leaves no record. The delivery is requeued until its
//!   redelivery budget is spent, then dead-lettered.
//!
//! Acknowledgement is always manual, so a crash during processing leaves the
//! delivery with the broker. Concurrent copies of one id are handled one at a
//! time, so the handler never runs twice for an id that succeeds.

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{message::MessageId, transport::Outbound};

pub use inmemory::InMemoryConsumptionStore;

const DEFAULT_MAX_REDELIVERIES: u32 = 3;
const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(600);

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub message_id: Option<MessageId>,
    pub message_type: Option<String>,
    pub business_key: Option<String>,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Previous deliveries reported by the broker, if it tracks them
    /// (RabbitMQ `x-delivery-count`).
    pub delivery_count: Option<u32>,
}

impl Inbound {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: None,
            message_type: None,
            business_key: None,
            routing_key: String::new(),
            payload: payload.into(),
            delivery_count: None,
        }
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = Some(count);
        self
    }
}

/// What the relay published, as a consumer would receive it.
impl From<Outbound> for Inbound {
    fn from(envelope: Outbound) -> Self {
        Self {
            message_id: Some(envelope.headers.message_id),
            message_type: Some(envelope.headers.message_type),
            business_key: envelope.headers.business_key,
            routing_key: envelope.headers.routing_key,
            payload: envelope.message.into_inner(),
            delivery_count: None,
        }
    }
}

/// Broker-side settlement of a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    type Error: Into<tower::BoxError>;

    async fn ack(&self) -> Result<(), Self::Error>;

    /// Reject the delivery. With `requeue == false` the broker routes it to
    /// the dead-letter exchange, if one is configured.
    async fn nack(&self, requeue: bool) -> Result<(), Self::Error>;
}

/// Business logic run once per message id.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Error: Into<tower::BoxError>;

    async fn handle(&self, message: &Inbound) -> Result<(), Self::Error>;
}

/// Proof that a message id has been processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionRecord {
    pub message_id: MessageId,
    pub message_type: Option<String>,
    pub consumed_at: DateTime<Utc>,
}

impl ConsumptionRecord {
    pub fn new(message_id: MessageId, message_type: Option<String>) -> Self {
        Self {
            message_id,
            message_type,
            consumed_at: Utc::now(),
        }
    }
}

/// Storage of processed message ids.
#[async_trait]
pub trait ConsumptionStore: Send + Sync {
    type Error: Into<tower::BoxError>;

    async fn is_consumed(&self, id: MessageId) -> Result<bool, Self::Error>;

    /// Store `record`. Returns `false` if the id was already recorded.
    async fn record(&self, record: ConsumptionRecord) -> Result<bool, Self::Error>;

    /// Delete records consumed before `older_than`.
    async fn purge_before(&self, older_than: DateTime<Utc>) -> Result<u64, Self::Error>;
}

/// Consumer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Redeliveries allowed after a failed handler before dead-lettering.
    pub max_redeliveries: u32,
    /// How long a locally counted failure is remembered when the broker does
    /// not report redeliveries.
    pub failure_ttl: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            failure_ttl: DEFAULT_FAILURE_TTL,
        }
    }
}

impl ConsumerConfig {
    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    pub fn with_failure_ttl(mut self, ttl: Duration) -> Self {
        self.failure_ttl = ttl;
        self
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled for the first time and acknowledged.
    Processed,
    /// Already consumed; acknowledged without running the handler.
    Duplicate,
    /// Handler failed; returned to the queue.
    Requeued { failures: u32 },
    /// Handler failed too often; rejected to the dead-letter exchange.
    DeadLettered { failures: u32 },
    /// No message id; rejected to the dead-letter exchange.
    Rejected,
}

/// Deduplicating guard around a [`MessageHandler`].
///
/// Copies of the same id handled concurrently by one guard are serialized:
/// the second copy waits for the first and then sees it as a duplicate.
#[derive(Clone)]
pub struct IdempotentConsumer<S> {
    store: S,
    config: ConsumerConfig,
    in_flight: Arc<Mutex<HashMap<MessageId, Arc<Mutex<()>>>>>,
    failures: Arc<Mutex<HashMap<MessageId, LocalFailures>>>,
}

/// Failures counted for a delivery whose broker does not report redeliveries.
#[derive(Debug, Clone, Copy)]
struct LocalFailures {
    count: u32,
    last_seen: Instant,
}

impl<S> IdempotentConsumer<S>
where
    S: ConsumptionStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: ConsumerConfig::default(),
            in_flight: Arc::default(),
            failures: Arc::default(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one delivery and settle it with `acker`.
    ///
    /// Errors are returned only when the consumption store or the broker
    /// fails; the delivery is then left unsettled for the broker to
    /// redeliver. Handler failures are reported through [`Outcome`].
    #[instrument(skip_all, fields(message_id = ?inbound.message_id))]
    pub async fn handle<A, H>(
        &self,
        inbound: &Inbound,
        acker: &A,
        handler: &H,
    ) -> Result<Outcome, ConsumerError>
    where
        A: Acker,
        H: MessageHandler,
    {
        let Some(id) = inbound.message_id else {
            tracing::warn!("Message without id rejected");
            acker.nack(false).await.map_err(ConsumerError::ack)?;
            return Ok(Outcome::Rejected);
        };

        let claim = self.claim(id).await;
        let outcome = self.handle_claimed(id, inbound, acker, handler).await;
        self.release(id, claim).await;
        outcome
    }

    async fn handle_claimed<A, H>(
        &self,
        id: MessageId,
        inbound: &Inbound,
        acker: &A,
        handler: &H,
    ) -> Result<Outcome, ConsumerError>
    where
        A: Acker,
        H: MessageHandler,
    {
        if self.store.is_consumed(id).await.map_err(ConsumerError::store)? {
            tracing::info!(message_id = %id, "Duplicate delivery suppressed");
            acker.ack().await.map_err(ConsumerError::ack)?;
            return Ok(Outcome::Duplicate);
        }

        match handler.handle(inbound).await {
            Ok(()) => {
                let record = ConsumptionRecord::new(id, inbound.message_type.clone());
                if !self.store.record(record).await.map_err(ConsumerError::store)? {
                    tracing::debug!(message_id = %id, "Message recorded concurrently");
                }
                self.failures.lock().await.remove(&id);
                acker.ack().await.map_err(ConsumerError::ack)?;
                tracing::debug!(message_id = %id, "Message processed");
                Ok(Outcome::Processed)
            }
            Err(error) => {
                let error: tower::BoxError = error.into();
                let failures = self.count_failure(id, inbound.delivery_count).await;

                if failures <= self.config.max_redeliveries {
                    tracing::warn!(
                        message_id = %id,
                        failures,
                        %error,
                        "Handler failed, requeueing"
                    );
                    acker.nack(true).await.map_err(ConsumerError::ack)?;
                    Ok(Outcome::Requeued { failures })
                } else {
                    tracing::error!(
                        message_id = %id,
                        failures,
                        %error,
                        "Handler failed, dead-lettering"
                    );
                    self.failures.lock().await.remove(&id);
                    acker.nack(false).await.map_err(ConsumerError::ack)?;
                    Ok(Outcome::DeadLettered { failures })
                }
            }
        }
    }

    /// Wait until no other copy of `id` is being handled by this guard.
    async fn claim(&self, id: MessageId) -> OwnedMutexGuard<()> {
        let slot = self.in_flight.lock().await.entry(id).or_default().clone();
        slot.lock_owned().await
    }

    async fn release(&self, id: MessageId, claim: OwnedMutexGuard<()>) {
        drop(claim);
        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(&id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            in_flight.remove(&id);
        }
    }

    /// Failures of this delivery so far, including the current one.
    ///
    /// The broker's redelivery count is used when present. Otherwise a local
    /// count is kept per id; entries idle for longer than
    /// [`ConsumerConfig::failure_ttl`] are forgotten.
    async fn count_failure(&self, id: MessageId, delivery_count: Option<u32>) -> u32 {
        if let Some(previous) = delivery_count {
            return previous.saturating_add(1);
        }

        let now = Instant::now();
        let ttl = self.config.failure_ttl;
        let mut failures = self.failures.lock().await;
        failures.retain(|_, entry| now.duration_since(entry.last_seen) <= ttl);

        let entry = failures.entry(id).or_insert(LocalFailures {
            count: 0,
            last_seen: now,
        });
        entry.count = entry.count.saturating_add(1);
        entry.last_seen = now;
        entry.count
    }

    /// Ids with a locally tracked failure count.
    #[cfg(test)]
    async fn tracked_failures(&self) -> usize {
        self.failures.lock().await.len()
    }
}

/// Error raised while settling a delivery.
#[derive(Debug)]
pub struct ConsumerError {
    context: SpanTrace,
    kind: ConsumerErrorKind,
}

/// Classification of consumer errors.
#[derive(Debug)]
pub enum ConsumerErrorKind {
    /// The consumption store failed.
    Store(tower::BoxError),
    /// The broker refused an ack or nack.
    Ack(tower::BoxError),
    /// The broker stream failed.
    Broker(tower::BoxError),
}

impl ConsumerError {
    fn new(kind: ConsumerErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn store(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ConsumerErrorKind::Store(err.into()))
    }

    fn ack(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ConsumerErrorKind::Ack(err.into()))
    }

    #[cfg_attr(not(feature = "rabbitmq"), allow(dead_code))]
    pub(crate) fn broker(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ConsumerErrorKind::Broker(err.into()))
    }

    pub fn kind(&self) -> &ConsumerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerErrorKind::Store(err) => writeln!(f, "Consumption store error: {err}"),
            ConsumerErrorKind::Ack(err) => writeln!(f, "Acknowledgement error: {err}"),
            ConsumerErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerErrorKind::Store(err)
            | ConsumerErrorKind::Ack(err)
            | ConsumerErrorKind::Broker(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Records how a delivery was settled.
    #[derive(Default)]
    struct RecordingAcker {
        settled: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        type Error = std::convert::Infallible;

        async fn ack(&self) -> Result<(), Self::Error> {
            self.settled.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), Self::Error> {
            let label = if requeue { "requeue" } else { "dead-letter" };
            self.settled.lock().unwrap().push(label);
            Ok(())
        }
    }

    /// Counts invocations and fails the first `fail_first` of them.
    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        type Error = std::io::Error;

        async fn handle(&self, _message: &Inbound) -> Result<(), Self::Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(std::io::Error::other("downstream unavailable"));
            }
            Ok(())
        }
    }

    fn inbound(id: MessageId) -> Inbound {
        Inbound::new(br#"{"order_no":"ORD-1"}"#.to_vec()).with_message_id(id)
    }

    #[tokio::test]
    async fn second_delivery_of_an_id_is_acked_without_handling() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default());
        let handler = CountingHandler::default();
        let acker = RecordingAcker::default();
        let id = MessageId::new();

        let first = consumer.handle(&inbound(id), &acker, &handler).await.unwrap();
        let second = consumer.handle(&inbound(id), &acker, &handler).await.unwrap();

        assert_eq!(first, Outcome::Processed);
        assert_eq!(second, Outcome::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*acker.settled.lock().unwrap(), ["ack", "ack"]);
    }

    #[tokio::test]
    async fn message_without_id_is_dead_lettered() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default());
        let handler = CountingHandler::default();
        let acker = RecordingAcker::default();

        let outcome = consumer
            .handle(&Inbound::new(b"{}".to_vec()), &acker, &handler)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*acker.settled.lock().unwrap(), ["dead-letter"]);
    }

    #[tokio::test]
    async fn failed_handler_is_requeued_then_dead_lettered() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default())
            .with_config(ConsumerConfig::default().with_max_redeliveries(2));
        let handler = CountingHandler {
            fail_first: usize::MAX,
            ..Default::default()
        };
        let acker = RecordingAcker::default();
        let id = MessageId::new();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(consumer.handle(&inbound(id), &acker, &handler).await.unwrap());
        }

        assert_eq!(
            outcomes,
            [
                Outcome::Requeued { failures: 1 },
                Outcome::Requeued { failures: 2 },
                Outcome::DeadLettered { failures: 3 },
            ]
        );
        assert!(!consumer.store().is_consumed(id).await.unwrap());
    }

    #[tokio::test]
    async fn broker_delivery_count_takes_precedence() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default());
        let handler = CountingHandler {
            fail_first: 1,
            ..Default::default()
        };
        let acker = RecordingAcker::default();

        let outcome = consumer
            .handle(&inbound(MessageId::new()).with_delivery_count(3), &acker, &handler)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::DeadLettered { failures: 4 });
    }

    #[tokio::test]
    async fn recovered_handler_records_the_id() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default());
        let handler = CountingHandler {
            fail_first: 1,
            ..Default::default()
        };
        let acker = RecordingAcker::default();
        let id = MessageId::new();

        consumer.handle(&inbound(id), &acker, &handler).await.unwrap();
        let outcome = consumer.handle(&inbound(id), &acker, &handler).await.unwrap();

        assert_eq!(outcome, Outcome::Processed);
        assert!(consumer.store().is_consumed(id).await.unwrap());
        assert_eq!(*acker.settled.lock().unwrap(), ["requeue", "ack"]);
    }

    /// Sleeps before succeeding, so concurrent copies overlap.
    #[derive(Default)]
    struct SlowHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        type Error = std::io::Error;

        async fn handle(&self, _message: &Inbound) -> Result<(), Self::Error> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_copies_of_an_id_run_the_handler_once() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default());
        let handler = SlowHandler::default();
        let acker = RecordingAcker::default();
        let id = MessageId::new();

        let (first, second) = (inbound(id), inbound(id));
        let (a, b) = tokio::join!(
            consumer.handle(&first, &acker, &handler),
            consumer.handle(&second, &acker, &handler),
        );

        let mut outcomes = [a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|outcome| *outcome == Outcome::Duplicate);
        assert_eq!(outcomes, [Outcome::Processed, Outcome::Duplicate]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(consumer.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn broker_counted_failures_are_not_tracked_locally() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default());
        let handler = CountingHandler {
            fail_first: usize::MAX,
            ..Default::default()
        };
        let acker = RecordingAcker::default();

        for _ in 0..100 {
            let delivery = inbound(MessageId::new()).with_delivery_count(0);
            consumer.handle(&delivery, &acker, &handler).await.unwrap();
        }

        assert_eq!(consumer.tracked_failures().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_local_failure_counts_are_forgotten() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default())
            .with_config(ConsumerConfig::default().with_failure_ttl(Duration::from_secs(1)));
        let handler = CountingHandler {
            fail_first: usize::MAX,
            ..Default::default()
        };
        let acker = RecordingAcker::default();
        let abandoned = MessageId::new();

        consumer.handle(&inbound(abandoned), &acker, &handler).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        consumer
            .handle(&inbound(MessageId::new()), &acker, &handler)
            .await
            .unwrap();

        assert_eq!(consumer.tracked_failures().await, 1);
        let restarted = consumer.handle(&inbound(abandoned), &acker, &handler).await.unwrap();
        assert_eq!(restarted, Outcome::Requeued { failures: 1 });
    }

    #[tokio::test]
    async fn maximal_broker_delivery_count_does_not_overflow() {
        let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::default());
        let handler = CountingHandler {
            fail_first: 1,
            ..Default::default()
        };
        let acker = RecordingAcker::default();

        let outcome = consumer
            .handle(
                &inbound(MessageId::new()).with_delivery_count(u32::MAX),
                &acker,
                &handler,
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::DeadLettered { failures: u32::MAX });
    }
}
