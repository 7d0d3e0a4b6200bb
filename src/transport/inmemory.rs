use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

use crate::transport::{Delivery, Outbound, Sender};

/// In-memory broker for testing or local pipelines.
///
/// Published envelopes are stored in a shared queue. It is useful for:
/// - Unit and integration testing
/// - Simulating broker outages with scripted failures
/// - Debugging message flows
///
/// Clones share the same queue and script.
#[derive(Clone, Default)]
pub struct InMemory {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    published: Vec<Outbound>,
    script: VecDeque<Scripted>,
    confirms: bool,
}

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Fail,
    Hang,
}

impl InMemory {
    /// A broker that reports every publish as confirmed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                confirms: true,
                ..State::default()
            })),
        }
    }

    /// A broker without publisher confirms: publishes are reported as
    /// [`Delivery::Sent`].
    pub fn without_confirms() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail.
    pub async fn fail_next(&self, count: usize) {
        let mut state = self.inner.lock().await;
        state.script.extend(std::iter::repeat_n(Scripted::Fail, count));
    }

    /// Make the next publish never complete, as an unreachable broker would.
    pub async fn hang_next(&self) {
        self.inner.lock().await.script.push_back(Scripted::Hang);
    }

    /// Return all envelopes published so far and clear the queue.
    pub async fn take_published(&self) -> Vec<Outbound> {
        std::mem::take(&mut self.inner.lock().await.published)
    }

    /// Number of envelopes published so far.
    pub async fn published_len(&self) -> usize {
        self.inner.lock().await.published.len()
    }
}

#[async_trait::async_trait]
impl Sender for InMemory {
    type Error = std::io::Error;

    /// "Publish" a message by appending it to the in-memory queue.
    #[tracing::instrument(skip_all, fields(message_id = %envelope.headers.message_id))]
    async fn send(&mut self, envelope: Outbound) -> Result<Delivery, Self::Error> {
        let mut state = self.inner.lock().await;

        match state.script.pop_front() {
            Some(Scripted::Fail) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "in-memory broker unavailable",
                ));
            }
            Some(Scripted::Hang) => {
                drop(state);
                return std::future::pending().await;
            }
            None => {}
        }

        tracing::info!(
            destination = %envelope.headers.destination,
            routing_key = %envelope.headers.routing_key,
            "Message published to in-memory broker",
        );
        state.published.push(envelope);

        Ok(if state.confirms {
            Delivery::Confirmed
        } else {
            Delivery::Sent
        })
    }
}
