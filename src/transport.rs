//! Transport abstractions and broker backends.
//!
//! This module defines a Tower-compatible transport layer used by the relay to
//! publish outbox messages to a broker (e.g. RabbitMQ or Kafka, or an
//! in-memory queue in tests).
//!
//! The transport is built around Tower’s `Service` abstraction, enabling
//! middleware composition (tracing, rate limiting, payload wrapping, etc.)
//! while keeping sender implementations backend-agnostic.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete broker backends
//! - [`Delivery`]: What the broker acknowledged for a publish
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "cloud-events")]
pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::{Envelope, message::MessageHeaders};

pub use inmemory::InMemory;

/// Envelope handed to the broker by the relay.
pub type Outbound = Envelope<MessageHeaders, RawPayload>;

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The broker accepted the message but has not confirmed it yet. The
    /// confirmation is reported later through
    /// [`Acknowledger::confirm`](crate::acknowledger::Acknowledger::confirm);
    /// without one, the relay republishes the row after its confirm timeout.
    Sent,
    /// The broker confirmed the message (publisher confirm, Kafka ack).
    Confirmed,
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for publishing envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<S> Service<Outbound> for Transport<S>
where
    S: Service<Outbound, Response = Delivery> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    type Response = Delivery;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Delivery, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::sender(e.into()))
    }

    fn call(&mut self, req: Outbound) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::sender(e.into()))
        })
    }
}

impl<S> Transport<S>
where
    S: Service<Outbound, Response = Delivery> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    /// Publish an envelope through the transport.
    pub async fn send(&mut self, envelope: Outbound) -> Result<Delivery, TransportError> {
        let mut service = self.service.clone();
        std::future::poll_fn(|cx| service.poll_ready(cx))
            .await
            .map_err(|e| TransportError::sender(e.into()))?;
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::sender(e.into()))
    }

    /// Publish an envelope, failing with [`TransportErrorKind::Timeout`] if
    /// the broker does not answer within `timeout`.
    pub async fn send_within(
        &mut self,
        envelope: Outbound,
        timeout: Duration,
    ) -> Result<Delivery, TransportError> {
        tokio::time::timeout(timeout, self.send(envelope))
            .await
            .map_err(|_| TransportError::timeout(timeout))?
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the sender backend, including broker rejections.
    Sender(tower::BoxError),
    /// The broker did not answer in time.
    Timeout(Duration),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Timeout(after),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

/// Single-line description, as recorded in `last_error`.
impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Sender(err) => write!(f, "Sender error: {err}"),
            TransportErrorKind::Timeout(after) => write!(f, "Publish timed out after {after:?}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Timeout(_) => None,
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<Outbound> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = Delivery;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Delivery, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Outbound) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move { sender.send(req).await.map_err(Into::into) })
    }
}

/// Trait implemented by concrete broker backends.
///
/// A sender publishes an [`Outbound`] envelope to `headers.destination` with
/// `headers.routing_key`, and must attach `headers.message_id` as the broker
/// message id and `headers.correlation_id` as the correlation id so consumers
/// can deduplicate.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish an envelope using the underlying broker.
    async fn send(&mut self, envelope: Outbound) -> Result<Delivery, Self::Error>;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handling payloads.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for [u8] {
    fn to_bytes(&self) -> &[u8] {
        self
    }
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        self.0.to_bytes()
    }
}
