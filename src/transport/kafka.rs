use async_trait::async_trait;
use rdkafka::{
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use std::time::Duration;

use crate::transport::{Delivery, Outbound, Sender, ToBytes};

/// Kafka transport sender.
///
/// This sender publishes messages to Kafka topics using a `FutureProducer`.
///
/// ## Mapping
///
/// - `headers.destination` → topic
/// - `headers.routing_key` → record key (partitioning and per-key ordering)
/// - `headers.message_id`, `correlation_id`, `message_type`, `business_key`
///   → record headers
///
/// A record is reported as [`Delivery::Confirmed`] once the broker has
/// acknowledged it according to the producer's `acks` setting.
#[derive(Clone)]
pub struct Kafka {
    /// Kafka producer handle
    producer: FutureProducer,
    /// Timeout for enqueueing a record when the local queue is full
    timeout: Duration,
}

impl Kafka {
    /// Create a new Kafka sender using the given `FutureProducer`.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sender for Kafka {
    type Error = rdkafka::error::KafkaError;

    #[tracing::instrument(skip_all, fields(message_id = %envelope.headers.message_id))]
    async fn send(&mut self, envelope: Outbound) -> Result<Delivery, Self::Error> {
        let headers = &envelope.headers;
        let message_id = headers.message_id.to_string();
        let correlation_id = headers.correlation_id.to_string();

        let mut record_headers = OwnedHeaders::new()
            .insert(Header {
                key: "message_id",
                value: Some(message_id.as_str()),
            })
            .insert(Header {
                key: "correlation_id",
                value: Some(correlation_id.as_str()),
            })
            .insert(Header {
                key: "message_type",
                value: Some(headers.message_type.as_str()),
            });
        if let Some(key) = &headers.business_key {
            record_headers = record_headers.insert(Header {
                key: "business_key",
                value: Some(key.as_str()),
            });
        }

        let record = FutureRecord::to(&headers.destination)
            .payload(envelope.message.to_bytes())
            .key(headers.routing_key.as_bytes())
            .headers(record_headers);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;

        Ok(Delivery::Confirmed)
    }
}
