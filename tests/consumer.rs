use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use courier::consumer::{Acker, InMemoryConsumptionStore, Inbound, MessageHandler};
use courier::outbox::inmemory::InMemoryOutbox;
use courier::transport::InMemory;
use courier::{
    ConsumerConfig, IdempotentConsumer, MessageState, Outbox, OutboxSpec, Outcome, Relay,
    Transport,
};
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Serialize)]
struct PaymentCaptured {
    payment_id: u64,
}

/// Records how each delivery was settled.
#[derive(Default)]
struct BrokerDelivery {
    settled: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl Acker for BrokerDelivery {
    type Error = std::convert::Infallible;

    async fn ack(&self) -> Result<(), Self::Error> {
        self.settled.lock().await.push("ack");
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), Self::Error> {
        let settled = if requeue { "requeue" } else { "dead-letter" };
        self.settled.lock().await.push(settled);
        Ok(())
    }
}

/// Credits an account once per call; fails while `broken` is set.
#[derive(Default, Clone)]
struct CreditAccount {
    credits: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl MessageHandler for CreditAccount {
    type Error = std::io::Error;

    async fn handle(&self, _message: &Inbound) -> Result<(), Self::Error> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("ledger unavailable"));
        }
        self.credits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn relay_one_payment(store: &InMemoryOutbox, broker: &InMemory) {
    let spec = OutboxSpec::new("payments", "payment.captured", "PAYMENT_CAPTURED");
    let mut tx = store.begin();
    Outbox::new(store.clone())
        .save_event(&spec, &PaymentCaptured { payment_id: 42 }, &mut tx)
        .await
        .unwrap();
    tx.commit().await;

    let mut relay = Relay::new(store.clone(), Transport::new(broker.clone()));
    assert_eq!(relay.run_once().await.unwrap().confirmed, 1);
}

#[tokio::test]
async fn redelivered_message_takes_effect_once() {
    let store = InMemoryOutbox::default();
    let broker = InMemory::new();
    relay_one_payment(&store, &broker).await;
    let envelope = broker.take_published().await.remove(0);

    let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::new());
    let handler = CreditAccount::default();
    let delivery = BrokerDelivery::default();

    let first = consumer
        .handle(&Inbound::from(envelope.clone()), &delivery, &handler)
        .await
        .unwrap();
    let second = consumer
        .handle(&Inbound::from(envelope), &delivery, &handler)
        .await
        .unwrap();

    assert_eq!(first, Outcome::Processed);
    assert_eq!(second, Outcome::Duplicate);
    assert_eq!(handler.credits.load(Ordering::SeqCst), 1);
    assert_eq!(*delivery.settled.lock().await, ["ack", "ack"]);
    assert_eq!(consumer.store().len().await, 1);
}

#[tokio::test]
async fn republished_after_a_crash_is_deduplicated() {
    let store = InMemoryOutbox::default();
    let spec = OutboxSpec::new("payments", "payment.captured", "PAYMENT_CAPTURED");
    let mut tx = store.begin();
    Outbox::new(store.clone())
        .save_event(&spec, &PaymentCaptured { payment_id: 7 }, &mut tx)
        .await
        .unwrap();
    tx.commit().await;

    // A relay publishes the row and dies before acknowledging it.
    let broker = InMemory::new();
    let row = store.snapshot().await.remove(0);
    Transport::new(broker.clone())
        .send(row.to_envelope())
        .await
        .unwrap();
    assert_eq!(store.snapshot().await[0].state, MessageState::Pending);

    // Its replacement publishes the same message again.
    let mut relay = Relay::new(store.clone(), Transport::new(broker.clone()));
    assert_eq!(relay.run_once().await.unwrap().confirmed, 1);

    let published = broker.take_published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(
        published[0].headers.message_id,
        published[1].headers.message_id
    );

    let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::new());
    let handler = CreditAccount::default();
    let mut outcomes = Vec::new();
    for envelope in published {
        let outcome = consumer
            .handle(&Inbound::from(envelope), &BrokerDelivery::default(), &handler)
            .await
            .unwrap();
        outcomes.push(outcome);
    }

    assert_eq!(outcomes, [Outcome::Processed, Outcome::Duplicate]);
    assert_eq!(handler.credits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_handler_is_dead_lettered_after_its_redeliveries() {
    let store = InMemoryOutbox::default();
    let broker = InMemory::new();
    relay_one_payment(&store, &broker).await;
    let inbound = Inbound::from(broker.take_published().await.remove(0));

    let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::new())
        .with_config(ConsumerConfig::default().with_max_redeliveries(2));
    let handler = CreditAccount::default();
    handler.broken.store(true, Ordering::SeqCst);
    let delivery = BrokerDelivery::default();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(consumer.handle(&inbound, &delivery, &handler).await.unwrap());
    }

    assert_eq!(
        outcomes,
        [
            Outcome::Requeued { failures: 1 },
            Outcome::Requeued { failures: 2 },
            Outcome::DeadLettered { failures: 3 },
        ]
    );
    assert_eq!(
        *delivery.settled.lock().await,
        ["requeue", "requeue", "dead-letter"]
    );
    assert!(consumer.store().is_empty().await);
}

#[tokio::test]
async fn handler_recovering_within_its_redeliveries_is_processed() {
    let store = InMemoryOutbox::default();
    let broker = InMemory::new();
    relay_one_payment(&store, &broker).await;
    let inbound = Inbound::from(broker.take_published().await.remove(0));

    let consumer = IdempotentConsumer::new(InMemoryConsumptionStore::new());
    let handler = CreditAccount::default();
    let delivery = BrokerDelivery::default();

    handler.broken.store(true, Ordering::SeqCst);
    let failed = consumer.handle(&inbound, &delivery, &handler).await.unwrap();
    handler.broken.store(false, Ordering::SeqCst);
    let recovered = consumer
        .handle(&inbound.clone().with_delivery_count(1), &delivery, &handler)
        .await
        .unwrap();

    assert_eq!(failed, Outcome::Requeued { failures: 1 });
    assert_eq!(recovered, Outcome::Processed);
    assert_eq!(handler.credits.load(Ordering::SeqCst), 1);
    assert_eq!(*delivery.settled.lock().await, ["requeue", "ack"]);
}
