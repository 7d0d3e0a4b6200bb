//! The unit of guaranteed delivery.
//!
//! An [`OutboxMessage`] is created by the writer inside the business
//! transaction and afterwards mutated only by the relay. Its [`MessageId`] is
//! the idempotency token: it travels to the broker as both message id and
//! correlation id, and the consumer deduplicates on it.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Envelope, transport::RawPayload};

/// Globally unique, immutable message identifier.
///
/// Backed by a UUID v7, so ids generated by one process sort roughly by
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery state of an outbox row.
///
/// `Confirmed` and `Dead` are terminal for the relay. See
/// [`crate::delivery`] for the transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Pending,
    Sent,
    Confirmed,
    Failed,
    Dead,
}

impl MessageState {
    /// Stable textual form, as persisted by the SQL backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "PENDING",
            MessageState::Sent => "SENT",
            MessageState::Confirmed => "CONFIRMED",
            MessageState::Failed => "FAILED",
            MessageState::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Confirmed | MessageState::Dead)
    }

    /// Whether a row in this state may be picked up by a relay pass.
    pub fn is_eligible(&self) -> bool {
        matches!(self, MessageState::Pending | MessageState::Failed)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MessageState::Pending),
            "SENT" => Ok(MessageState::Sent),
            "CONFIRMED" => Ok(MessageState::Confirmed),
            "FAILED" => Ok(MessageState::Failed),
            "DEAD" => Ok(MessageState::Dead),
            other => Err(UnknownState(other.to_owned())),
        }
    }
}

/// Returned when a persisted state string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown outbox message state: {}", self.0)
    }
}

impl std::error::Error for UnknownState {}

/// A row of the outbox store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub destination: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_type: String,
    pub business_key: Option<String>,
    pub state: MessageState,
    /// Number of failed publish attempts.
    pub attempt_count: u32,
    /// Optimistic concurrency token, bumped on every update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Backoff gate: the row is not eligible before this instant.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// Build a fresh `PENDING` message with a newly generated id.
    pub fn new(
        destination: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        message_type: impl Into<String>,
        business_key: Option<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            destination: destination.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            message_type: message_type.into(),
            business_key,
            state: MessageState::Pending,
            attempt_count: 0,
            version: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether a relay pass at `now` may pick this row up.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.state.is_eligible()
            && self.attempt_count < max_attempts
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Broker-facing view of the message.
    pub fn headers(&self) -> MessageHeaders {
        MessageHeaders {
            message_id: self.id,
            correlation_id: self.id,
            destination: self.destination.clone(),
            routing_key: self.routing_key.clone(),
            message_type: self.message_type.clone(),
            business_key: self.business_key.clone(),
        }
    }

    pub fn to_envelope(&self) -> Envelope<MessageHeaders, RawPayload> {
        Envelope {
            headers: self.headers(),
            message: RawPayload::from(self.payload.clone()),
        }
    }
}

/// Metadata published alongside every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub message_id: MessageId,
    pub correlation_id: MessageId,
    pub destination: String,
    pub routing_key: String,
    pub message_type: String,
    pub business_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_its_persisted_form() {
        for state in [
            MessageState::Pending,
            MessageState::Sent,
            MessageState::Confirmed,
            MessageState::Failed,
            MessageState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<MessageState>(), Ok(state));
        }
        assert!("LOST".parse::<MessageState>().is_err());
    }

    #[test]
    fn headers_use_the_id_as_message_and_correlation_id() {
        let msg = OutboxMessage::new(
            "order.exchange",
            "order.created",
            b"{}".to_vec(),
            "ORDER_CREATED",
            None,
        );
        let headers = msg.headers();

        assert_eq!(headers.message_id, msg.id);
        assert_eq!(headers.correlation_id, msg.id);
        assert_eq!(headers.destination, "order.exchange");
    }

    #[test]
    fn backoff_gate_and_budget_control_eligibility() {
        let now = Utc::now();
        let mut msg = OutboxMessage::new("x", "y", Vec::new(), "T", None);
        assert!(msg.is_due(now, 3));

        msg.state = MessageState::Failed;
        msg.next_attempt_at = Some(now + chrono::Duration::seconds(10));
        assert!(!msg.is_due(now, 3));

        msg.next_attempt_at = Some(now);
        assert!(msg.is_due(now, 3));

        msg.attempt_count = 3;
        assert!(!msg.is_due(now, 3));

        msg.attempt_count = 0;
        msg.state = MessageState::Sent;
        assert!(!msg.is_due(now, 3));
    }
}
