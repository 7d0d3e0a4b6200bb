//! Relay loop delivering outbox messages through a transport.
//!
//! This module implements the background *relay* that:
//!
//! - Polls the outbox for eligible messages, oldest first
//! - Publishes each one through a [`Transport`] under a timeout
//! - Records the outcome through the [`Acknowledger`]
//! - Exposes lifecycle hooks for observability and customization
//!
//! The relay runs until its [`CancellationToken`] is triggered. Pass failures
//! (an unreachable store, for example) are reported through the hook and
//! retried on the next pass; they never reach business callers.
//!
//! Several relays may poll the same store. Each update is version-checked, so
//! only one of them moves a given row forward; the others see
//! [`Acknowledgement::Stale`]. The broker may then receive the same message
//! twice, which consumers absorb through the message id.

mod poller;

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    acknowledger::{Acknowledgement, Acknowledger},
    delivery::{DeliveryPolicy, InvalidTransition},
    message::OutboxMessage,
    outbox::{AcknowledgeMessages, SelectPending},
    transport::{Delivery, Outbound, Transport, TransportError},
};

use poller::Poller;
pub use poller::RelayTrigger;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Maximum rows fetched per pass.
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// A publish that takes longer counts as a failed attempt.
    pub publish_timeout: Duration,
    /// A `SENT` row with no broker confirm for this long counts as a failed
    /// attempt and is published again.
    pub confirm_timeout: Duration,
    pub delivery: DeliveryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(poller::MIN_POLL_INTERVAL);
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }
}

/// Counts of what a single pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub fetched: usize,
    pub confirmed: usize,
    pub sent: usize,
    pub retrying: usize,
    pub dead: usize,
    pub stale: usize,
    /// `SENT` rows expired for lack of a confirm before fetching.
    pub unconfirmed: u64,
    /// Rows over the attempt budget made dead before fetching.
    pub exhausted: u64,
}

impl PassSummary {
    fn record(&mut self, ack: &Acknowledgement) {
        match ack {
            Acknowledgement::Confirmed => self.confirmed += 1,
            Acknowledgement::Sent => self.sent += 1,
            Acknowledgement::Retrying { .. } => self.retrying += 1,
            Acknowledgement::Dead { .. } => self.dead += 1,
            Acknowledgement::Stale => self.stale += 1,
        }
    }
}

/// Outbox relay.
///
/// Generic parameters:
/// - `D`: Outbox store implementation
/// - `HK`: Hook implementation for lifecycle events
/// - `T`: Transport service type
pub struct Relay<D, HK, T> {
    store: D,
    acknowledger: Acknowledger<D>,
    transport: Transport<T>,
    hook: HK,
    config: RelayConfig,
    trigger: RelayTrigger,
}

impl<D, T> Relay<D, DefaultRelayHook, T>
where
    D: SelectPending + AcknowledgeMessages + Clone + Send + Sync,
    <D as AcknowledgeMessages>::Error: Into<tower::BoxError>,
{
    /// Create a new relay with the default configuration and hook.
    pub fn new(store: D, transport: Transport<T>) -> Self {
        let config = RelayConfig::default();
        Self {
            acknowledger: Acknowledger::new(store.clone(), config.delivery.clone()),
            store,
            transport,
            hook: DefaultRelayHook,
            config,
            trigger: RelayTrigger::new(),
        }
    }
}

impl<D, HK, T> Relay<D, HK, T>
where
    D: SelectPending + AcknowledgeMessages + Clone + Send + Sync,
    <D as SelectPending>::Error: Into<tower::BoxError>,
    <D as AcknowledgeMessages>::Error: Into<tower::BoxError>,
    HK: RelayHook,
    T: Service<Outbound, Response = Delivery> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
{
    /// Replace the relay hook while keeping all other generics unchanged.
    ///
    /// This allows customizing behavior (logging, metrics, alerting on dead
    /// messages, etc.) without rebuilding the relay.
    pub fn with_hook<HK2: RelayHook>(self, hook: HK2) -> Relay<D, HK2, T> {
        Relay {
            store: self.store,
            acknowledger: self.acknowledger,
            transport: self.transport,
            hook,
            config: self.config,
            trigger: self.trigger,
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.acknowledger = Acknowledger::new(self.store.clone(), config.delivery.clone());
        self.config = config;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Handle that wakes this relay for an immediate pass.
    pub fn trigger(&self) -> RelayTrigger {
        self.trigger.clone()
    }

    /// Acknowledger sharing this relay's store and retry policy, for broker
    /// confirm callbacks and operator replay.
    pub fn acknowledger(&self) -> Acknowledger<D> {
        self.acknowledger.clone()
    }

    /// Run a single pass: sweep rows stuck in `SENT` or over budget, then
    /// fetch eligible rows and publish them in order.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&mut self) -> Result<PassSummary, RelayError> {
        let sweep = self.acknowledger.sweep(self.config.confirm_timeout).await?;
        let batch = self
            .store
            .select_pending(
                self.config.batch_size,
                self.config.delivery.max_attempts.max(1),
            )
            .await
            .map_err(|e| RelayError::store(e.into()))?;

        let mut summary = PassSummary {
            fetched: batch.len(),
            unconfirmed: sweep.unconfirmed,
            exhausted: sweep.exhausted,
            ..PassSummary::default()
        };

        for message in &batch {
            let ack = self.deliver(message).await?;
            summary.record(&ack);
        }

        Ok(summary)
    }

    async fn deliver(&mut self, message: &OutboxMessage) -> Result<Acknowledgement, RelayError> {
        self.hook.on_next_message(message);

        let timeout = self.config.publish_timeout;
        match self.transport.send_within(message.to_envelope(), timeout).await {
            Ok(delivery) => {
                let ack = self.acknowledger.published(message, delivery).await?;
                match ack {
                    Acknowledgement::Stale => self.hook.on_stale_message(message),
                    _ => self.hook.on_message_delivered(message, &ack),
                }
                Ok(ack)
            }
            Err(error) => {
                let ack = self
                    .acknowledger
                    .failed(message, &error.kind().to_string())
                    .await?;
                match ack {
                    Acknowledgement::Retrying {
                        attempt,
                        retry_after,
                    } => self
                        .hook
                        .on_message_retrying(message, attempt, retry_after, &error),
                    Acknowledgement::Dead { attempt } => {
                        self.hook.on_message_dead(message, attempt, &error)
                    }
                    _ => self.hook.on_stale_message(message),
                }
                Ok(ack)
            }
        }
    }

    /// Run the relay loop.
    ///
    /// The relay:
    /// - Runs a pass at startup, then on every poll tick or trigger
    /// - Reports pass errors through the hook and keeps going
    /// - Stops on cancellation, after finishing the pass in progress
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        self.hook.on_startup();

        let mut poller = Poller::new(self.config.poll_interval, self.trigger.clone(), cancel);
        while poller.next().await.is_some() {
            match self.run_once().await {
                Ok(summary) => self.hook.on_pass_complete(&summary),
                Err(error) => self.hook.on_pass_error(&error),
            }
        }

        self.hook.on_shutdown();
    }

    /// Run the relay loop on a background task.
    pub fn spawn(self, cancel: CancellationToken) -> RelayHandle
    where
        D: 'static,
        HK: 'static,
    {
        let cancel = cancel.child_token();
        let trigger = self.trigger.clone();
        let task = tokio::spawn(self.run(cancel.clone()));
        RelayHandle {
            trigger,
            cancel,
            task,
        }
    }
}

/// Handle to a relay started with [`Relay::spawn`].
pub struct RelayHandle {
    trigger: RelayTrigger,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn trigger(&self) -> RelayTrigger {
        self.trigger.clone()
    }

    /// Stop the relay and wait for its current pass to finish.
    pub async fn stop(self) -> Result<(), tokio::task::JoinError> {
        self.cancel.cancel();
        self.task.await
    }
}

/// Error that aborted a relay pass or an acknowledgement.
#[derive(Debug)]
pub struct RelayError {
    context: tracing_error::SpanTrace,
    kind: RelayErrorKind,
}

impl RelayError {
    pub(crate) fn store(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayErrorKind::Store(error),
        }
    }

    pub(crate) fn invalid_transition(error: InvalidTransition) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayErrorKind::InvalidTransition(error),
        }
    }

    pub fn kind(&self) -> &RelayErrorKind {
        &self.kind
    }
}

/// Classification of relay errors.
#[derive(Debug)]
pub enum RelayErrorKind {
    /// The outbox store failed; the pass is retried later.
    Store(tower::BoxError),
    /// A row was in a state the requested event does not apply to.
    InvalidTransition(InvalidTransition),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelayErrorKind::Store(err) => writeln!(f, "Outbox store error: {}", err),
            RelayErrorKind::InvalidTransition(err) => writeln!(f, "Invalid transition: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RelayErrorKind::Store(err) => Some(err.as_ref()),
            RelayErrorKind::InvalidTransition(err) => Some(err),
        }
    }
}

/// Hook trait for observing relay lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and alerting on dead messages.
pub trait RelayHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_next_message(&self, message: &OutboxMessage);
    fn on_message_delivered(&self, message: &OutboxMessage, ack: &Acknowledgement);
    fn on_message_retrying(
        &self,
        message: &OutboxMessage,
        attempt: u32,
        retry_after: Duration,
        error: &TransportError,
    );
    fn on_message_dead(&self, message: &OutboxMessage, attempt: u32, error: &TransportError);
    fn on_stale_message(&self, message: &OutboxMessage);
    fn on_pass_complete(&self, summary: &PassSummary);
    fn on_pass_error(&self, error: &RelayError);
}

/// Default relay hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultRelayHook;

impl RelayHook for DefaultRelayHook {
    fn on_startup(&self) {
        tracing::info!("Relay is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Relay is shutting down");
    }

    fn on_next_message(&self, message: &OutboxMessage) {
        tracing::debug!(
            message_id = %message.id,
            attempt_count = message.attempt_count,
            "Publishing message"
        );
    }

    fn on_message_delivered(&self, message: &OutboxMessage, ack: &Acknowledgement) {
        tracing::info!(
            message_id = %message.id,
            attempt_count = message.attempt_count,
            outcome = ?ack,
            "Message delivered"
        );
    }

    fn on_message_retrying(
        &self,
        message: &OutboxMessage,
        attempt: u32,
        retry_after: Duration,
        error: &TransportError,
    ) {
        tracing::warn!(
            message_id = %message.id,
            attempt_count = attempt,
            ?retry_after,
            error = %error.kind(),
            "Publish failed, message will be retried"
        );
    }

    fn on_message_dead(&self, message: &OutboxMessage, attempt: u32, error: &TransportError) {
        tracing::error!(
            message_id = %message.id,
            attempt_count = attempt,
            error = %error.kind(),
            "Retry budget exhausted, message is dead"
        );
    }

    fn on_stale_message(&self, message: &OutboxMessage) {
        tracing::debug!(message_id = %message.id, "Message already handled by another relay");
    }

    fn on_pass_complete(&self, summary: &PassSummary) {
        if summary.fetched > 0 || summary.unconfirmed > 0 || summary.exhausted > 0 {
            tracing::debug!(?summary, "Relay pass complete");
        }
    }

    fn on_pass_error(&self, error: &RelayError) {
        tracing::error!(?error, "Relay pass failed");
    }
}
