use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties,
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::sync::Mutex;

use crate::transport::{Delivery, Outbound, Sender, ToBytes};

/// Persistent delivery mode (survives broker restarts on durable queues).
const PERSISTENT: u8 = 2;

/// RabbitMQ transport sender.
///
/// This sender publishes messages using a shared `lapin::Channel`.
///
/// ## Mapping
///
/// - `headers.destination` → exchange
/// - `headers.routing_key` → routing key
/// - `headers.message_id` → AMQP `message_id` and `correlation_id`
/// - `headers.message_type` → AMQP `type`
/// - `headers.business_key` → `x-business-key` header
///
/// The channel is wrapped in `Arc<Mutex<_>>` because `Sender::send` is async
/// and may be called concurrently.
#[derive(Clone)]
pub struct RabbitMq {
    channel: Arc<Mutex<lapin::Channel>>,
}

impl RabbitMq {
    /// Wrap a channel that already has publisher confirms enabled (or
    /// deliberately does not).
    ///
    /// Without confirms, a publish written to the channel is reported as
    /// [`Delivery::Confirmed`]; no broker ack will follow it.
    pub fn new(channel: lapin::Channel) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }

    /// Enable publisher confirms on `channel` and wrap it.
    ///
    /// With confirms enabled, every publish resolves to
    /// [`Delivery::Confirmed`] once the broker acks it.
    pub async fn with_confirms(channel: lapin::Channel) -> Result<Self, lapin::Error> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self::new(channel))
    }
}

#[async_trait]
impl Sender for RabbitMq {
    type Error = RabbitMqError;

    /// Publish a message to RabbitMQ.
    ///
    /// Waits for both the publish to be written and, if confirms are enabled,
    /// the broker confirmation. A broker `nack` is an error so the relay
    /// retries the message. On a channel without confirms the written publish
    /// is final.
    #[tracing::instrument(skip_all, fields(message_id = %envelope.headers.message_id))]
    async fn send(&mut self, envelope: Outbound) -> Result<Delivery, Self::Error> {
        let headers = &envelope.headers;
        let id = ShortString::from(headers.message_id.to_string());

        let mut amqp_headers = FieldTable::default();
        if let Some(key) = &headers.business_key {
            amqp_headers.insert(
                ShortString::from("x-business-key"),
                AMQPValue::LongString(key.clone().into()),
            );
        }

        let properties = BasicProperties::default()
            .with_message_id(id.clone())
            .with_correlation_id(id)
            .with_kind(ShortString::from(headers.message_type.clone()))
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT)
            .with_headers(amqp_headers);

        let channel = self.channel.lock().await;
        let confirmation = channel
            .basic_publish(
                &headers.destination,
                &headers.routing_key,
                BasicPublishOptions::default(),
                envelope.message.to_bytes(),
                properties,
            )
            .await?
            .await?;

        delivery_for(confirmation)
    }
}

fn delivery_for(confirmation: Confirmation) -> Result<Delivery, RabbitMqError> {
    match confirmation {
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(Delivery::Confirmed),
        Confirmation::Nack(_) => Err(RabbitMqError::Nacked),
    }
}

/// Errors returned by the RabbitMQ sender.
#[derive(Debug)]
pub enum RabbitMqError {
    Lapin(lapin::Error),
    /// The broker refused the message.
    Nacked,
}

impl std::fmt::Display for RabbitMqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RabbitMqError::Lapin(err) => write!(f, "AMQP error: {err}"),
            RabbitMqError::Nacked => write!(f, "Broker rejected the message"),
        }
    }
}

impl std::error::Error for RabbitMqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RabbitMqError::Lapin(err) => Some(err),
            RabbitMqError::Nacked => None,
        }
    }
}

impl From<lapin::Error> for RabbitMqError {
    fn from(err: lapin::Error) -> Self {
        RabbitMqError::Lapin(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_on_a_channel_without_confirms_is_final() {
        assert_eq!(
            delivery_for(Confirmation::NotRequested).unwrap(),
            Delivery::Confirmed
        );
        assert_eq!(
            delivery_for(Confirmation::Ack(None)).unwrap(),
            Delivery::Confirmed
        );
        assert!(matches!(
            delivery_for(Confirmation::Nack(None)),
            Err(RabbitMqError::Nacked)
        ));
    }
}
