#![doc = include_str!("../README.md")]

pub mod acknowledger;
pub mod consumer;
pub mod delivery;
pub mod envelope;
pub mod message;
pub mod outbox;
pub mod relay;
pub mod transport;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use message::{MessageHeaders, MessageId, MessageState, OutboxMessage};

#[doc(inline)]
pub use outbox::{BusinessKey, Outbox, OutboxError, OutboxErrorKind, OutboxSpec};

#[doc(inline)]
pub use delivery::{BackoffPolicy, DeliveryPolicy};

#[doc(inline)]
pub use acknowledger::{Acknowledgement, Acknowledger, Sweep};

#[doc(inline)]
pub use transport::{Delivery, Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use relay::{
    DefaultRelayHook, PassSummary, Relay, RelayConfig, RelayError, RelayErrorKind, RelayHandle,
    RelayHook, RelayTrigger,
};

#[doc(inline)]
pub use consumer::{ConsumerConfig, IdempotentConsumer, Outcome};
