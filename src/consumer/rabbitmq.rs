use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::{AMQPValue, FieldTable},
};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::consumer::{
    Acker, ConsumerError, ConsumptionStore, IdempotentConsumer, Inbound, MessageHandler,
};

/// Settles deliveries through the channel they arrived on.
#[async_trait]
impl Acker for lapin::acker::Acker {
    type Error = lapin::Error;

    async fn ack(&self) -> Result<(), lapin::Error> {
        lapin::acker::Acker::ack(self, BasicAckOptions::default()).await
    }

    async fn nack(&self, requeue: bool) -> Result<(), lapin::Error> {
        lapin::acker::Acker::nack(
            self,
            BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            },
        )
        .await
    }
}

/// Map an AMQP delivery to an [`Inbound`] message.
///
/// The message id is read from the AMQP `message_id` property; an absent or
/// malformed id leaves `message_id` empty so the guard dead-letters it.
pub fn inbound_from(delivery: &Delivery) -> Inbound {
    let properties = &delivery.properties;
    let headers = properties.headers().as_ref();

    Inbound {
        message_id: properties
            .message_id()
            .as_ref()
            .and_then(|id| id.as_str().parse().ok()),
        message_type: properties.kind().as_ref().map(|kind| kind.as_str().to_owned()),
        business_key: headers.and_then(|h| string_header(h, "x-business-key")),
        routing_key: delivery.routing_key.as_str().to_owned(),
        payload: delivery.data.clone(),
        delivery_count: headers.and_then(|h| count_header(h, "x-delivery-count")),
    }
}

fn header<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn string_header(table: &FieldTable, name: &str) -> Option<String> {
    match header(table, name)? {
        AMQPValue::LongString(value) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
        _ => None,
    }
}

fn count_header(table: &FieldTable, name: &str) -> Option<u32> {
    let count = match header(table, name)? {
        AMQPValue::LongLongInt(n) => *n,
        AMQPValue::LongInt(n) => i64::from(*n),
        AMQPValue::LongUInt(n) => i64::from(*n),
        AMQPValue::ShortInt(n) => i64::from(*n),
        AMQPValue::ShortUInt(n) => i64::from(*n),
        _ => return None,
    };
    u32::try_from(count).ok()
}

/// Consume deliveries until the stream ends or `cancel` fires.
///
/// Every delivery goes through `guard`, which settles it. Store and
/// acknowledgement errors are logged and the delivery is left to the broker;
/// a failing broker stream ends the loop with an error.
#[tracing::instrument(skip_all)]
pub async fn consume<S, H>(
    mut consumer: lapin::Consumer,
    guard: &IdempotentConsumer<S>,
    handler: &H,
    cancel: CancellationToken,
) -> Result<(), ConsumerError>
where
    S: ConsumptionStore,
    H: MessageHandler,
{
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            delivery = consumer.next() => delivery,
        };

        let delivery = match delivery {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => return Err(ConsumerError::broker(err)),
            None => return Ok(()),
        };

        let inbound = inbound_from(&delivery);
        if let Err(error) = guard.handle(&inbound, &delivery.acker, handler).await {
            tracing::error!(?error, "Delivery left unsettled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn delivery_count_accepts_any_integer_width() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("x-delivery-count"), AMQPValue::LongLongInt(2));
        assert_eq!(count_header(&table, "x-delivery-count"), Some(2));

        let mut table = FieldTable::default();
        table.insert(ShortString::from("x-delivery-count"), AMQPValue::LongInt(-1));
        assert_eq!(count_header(&table, "x-delivery-count"), None);
    }

    #[test]
    fn business_key_header_is_read_as_text() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("x-business-key"),
            AMQPValue::LongString("ORD-1".to_owned().into()),
        );
        assert_eq!(
            string_header(&table, "x-business-key").as_deref(),
            Some("ORD-1")
        );
        assert_eq!(string_header(&table, "missing"), None);
    }
}
