use chrono::Utc;
use serde::Serialize;
use std::pin::Pin;
use tower::{Layer, Service};

use crate::{
    Envelope,
    transport::{Delivery, Outbound, RawPayload, ToBytes},
};

const SPEC_VERSION: &str = "1.0";

/// Tower `Service` wrapper that re-encodes payloads as JSON CloudEvents.
///
/// The outbox payload becomes the event `data`; the message id, type and
/// business key become the CloudEvents `id`, `type` and `subject`, so the
/// idempotency token survives the re-encoding.
#[derive(Clone)]
pub struct JsonCloudEventsService<T> {
    inner: T,
    source: String,
}

impl<T> Service<Outbound> for JsonCloudEventsService<T>
where
    T: Service<Outbound, Response = Delivery> + Clone + Send + 'static,
    <T as Service<Outbound>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = Delivery;
    type Error = tower::BoxError;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Outbound) -> Self::Future {
        let source = self.source.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let headers = &req.headers;
            let message = CloudEventsMessage {
                specversion: SPEC_VERSION.to_owned(),
                source,
                subject: headers.business_key.clone(),
                id: headers.message_id.to_string(),
                r#type: headers.message_type.clone(),
                datacontenttype: "application/json".to_owned(),
                data: payload_as_json(req.message.to_bytes()),
                time: Utc::now().to_rfc3339(),
            };

            let bytes = serde_json::to_vec(&message).map_err(Box::new)?;
            let envelope = Envelope {
                headers: req.headers,
                message: RawPayload::from(bytes),
            };

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Embed JSON payloads as-is; anything else is carried as a string.
fn payload_as_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Tower `Layer` that applies `JsonCloudEventsService` to a transport.
pub struct JsonCloudEventsLayer {
    source: String,
}

impl JsonCloudEventsLayer {
    /// Create a new layer specifying the CloudEvents `source` field.
    pub fn new(source: impl ToString) -> Self {
        Self {
            source: source.to_string(),
        }
    }
}

impl<S> Layer<S> for JsonCloudEventsLayer {
    type Service = JsonCloudEventsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonCloudEventsService {
            source: self.source.clone(),
            inner: service,
        }
    }
}

/// JSON CloudEvents message structure.
#[derive(Clone, Debug, Serialize)]
pub struct CloudEventsMessage {
    pub specversion: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub id: String,
    pub r#type: String,
    pub datacontenttype: String,
    pub data: serde_json::Value,
    pub time: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::OutboxMessage,
        transport::{InMemory, Transport},
    };

    #[tokio::test]
    async fn wraps_payload_and_keeps_the_message_id() {
        let broker = InMemory::new();
        let mut transport =
            Transport::new(broker.clone()).layer(JsonCloudEventsLayer::new("orders-service"));

        let msg = OutboxMessage::new(
            "order.exchange",
            "order.created",
            br#"{"order_no":"ORD-1"}"#.to_vec(),
            "ORDER_CREATED",
            Some("ORD-1".to_owned()),
        );
        transport.send(msg.to_envelope()).await.unwrap();

        let published = broker.take_published().await;
        let event: serde_json::Value =
            serde_json::from_slice(published[0].message.to_bytes()).unwrap();

        assert_eq!(event["id"], msg.id.to_string());
        assert_eq!(event["type"], "ORDER_CREATED");
        assert_eq!(event["subject"], "ORD-1");
        assert_eq!(event["source"], "orders-service");
        assert_eq!(event["data"]["order_no"], "ORD-1");
        assert_eq!(published[0].headers.message_id, msg.id);
    }
}
