use std::time::Duration;

use async_trait::async_trait;
use courier::consumer::{Acker, Inbound, InMemoryConsumptionStore, MessageHandler};
use courier::outbox::inmemory::{InMemoryOutbox, InMemoryTransaction};
use courier::transport::InMemory;
use courier::{
    BackoffPolicy, BusinessKey, DeliveryPolicy, IdempotentConsumer, Outbox, OutboxError,
    OutboxSpec, Relay, RelayConfig, Transport,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Order {
    order_no: String,
    customer: Customer,
    quantity: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Customer {
    id: u64,
}

#[derive(Debug)]
struct InvalidOrder(String);

impl std::fmt::Display for InvalidOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid order {}", self.0)
    }
}

impl std::error::Error for InvalidOrder {}

struct OrderService {
    store: InMemoryOutbox,
    outbox: Outbox<InMemoryOutbox>,
    spec: OutboxSpec,
}

impl OrderService {
    fn new(store: InMemoryOutbox) -> Self {
        Self {
            outbox: Outbox::new(store.clone()),
            store,
            spec: OutboxSpec::new("order.exchange", "order.created", "ORDER_CREATED")
                .with_business_key(BusinessKey::path("order_no")),
        }
    }

    /// Create an order and capture it as an `ORDER_CREATED` message in the
    /// same transaction.
    async fn create(&self, order_no: &str, quantity: u32) -> Result<Order, OutboxError> {
        let mut tx = self.store.begin();
        let order = Order {
            order_no: order_no.to_owned(),
            customer: Customer { id: 7 },
            quantity,
        };

        let created = self
            .outbox
            .intercept(&self.spec, &mut tx, |_tx: &mut InMemoryTransaction| {
                Box::pin(async move {
                    if order.quantity == 0 {
                        return Err(InvalidOrder(order.order_no));
                    }
                    Ok(order)
                })
            })
            .await?;

        tx.commit().await;
        Ok(created)
    }
}

/// Settles deliveries by logging them.
struct LogAcker;

#[async_trait]
impl Acker for LogAcker {
    type Error = std::convert::Infallible;

    async fn ack(&self) -> Result<(), Self::Error> {
        tracing::info!("ack");
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), Self::Error> {
        tracing::info!(requeue, "nack");
        Ok(())
    }
}

struct ShipOrder;

#[async_trait]
impl MessageHandler for ShipOrder {
    type Error = serde_json::Error;

    async fn handle(&self, message: &Inbound) -> Result<(), Self::Error> {
        let order: Order = serde_json::from_slice(&message.payload)?;
        tracing::info!(order_no = %order.order_no, quantity = order.quantity, "Shipping order");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(ErrorLayer::default())
        .init();

    let store = InMemoryOutbox::default();
    let broker = InMemory::new();
    let service = OrderService::new(store.clone());

    // First two publishes fail: the relay backs off and retries.
    broker.fail_next(2).await;

    let config = RelayConfig::default()
        .with_poll_interval(Duration::from_millis(200))
        .with_delivery(
            DeliveryPolicy::default().with_backoff(BackoffPolicy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(2),
            )),
        );
    let relay = Relay::new(store.clone(), Transport::new(broker.clone())).with_config(config);
    let handle = relay.spawn(CancellationToken::new());

    for (order_no, quantity) in [("ORD-1", 2), ("ORD-2", 0), ("ORD-3", 1)] {
        match service.create(order_no, quantity).await {
            Ok(order) => {
                tracing::info!(order_no = %order.order_no, "Order created");
                handle.trigger().notify();
            }
            Err(error) => tracing::warn!(%error, "Order rejected, nothing published"),
        }
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.stop().await?;

    let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::new());
    let published = broker.take_published().await;
    // Deliver everything twice, as a broker would after a lost ack.
    for envelope in published.iter().chain(published.iter()) {
        let inbound = Inbound::from(envelope.clone());
        let outcome = consumer.handle(&inbound, &LogAcker, &ShipOrder).await?;
        tracing::info!(message_id = ?inbound.message_id, ?outcome, "Delivery settled");
    }

    for message in store.snapshot().await {
        tracing::info!(
            message_id = %message.id,
            state = %message.state,
            attempt_count = message.attempt_count,
            "Outbox row"
        );
    }

    Ok(())
}
