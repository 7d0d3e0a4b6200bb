//! Persisting delivery outcomes.
//!
//! The [`Acknowledger`] turns what happened to a publish into a
//! [`DeliveryEvent`], runs it through the state machine and writes the result
//! back with a version-checked update. It is used by the relay after every
//! publish, and directly by broker callbacks that confirm a message later.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{
    delivery::{DeliveryEvent, DeliveryPolicy},
    message::{MessageId, MessageState, OutboxMessage},
    outbox::{AcknowledgeMessages, InspectMessages},
    relay::RelayError,
    transport::Delivery,
};

/// What an acknowledgement did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Accepted by the broker; waiting for a confirm.
    Sent,
    Confirmed,
    /// Back in the retry pool after `attempt` failures.
    Retrying { attempt: u32, retry_after: Duration },
    /// Retry budget exhausted after `attempt` failures.
    Dead { attempt: u32 },
    /// The row was already advanced by another worker; nothing was written.
    Stale,
}

/// Rows moved by [`Acknowledger::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
    /// `SENT` rows whose confirm never arrived, counted as a failed attempt.
    pub unconfirmed: u64,
    /// Retryable rows already over the attempt budget, now dead.
    pub exhausted: u64,
}

/// Applies delivery outcomes to an outbox store.
#[derive(Clone)]
pub struct Acknowledger<D> {
    store: D,
    policy: DeliveryPolicy,
}

impl<D> Acknowledger<D>
where
    D: AcknowledgeMessages + Send + Sync,
    <D as AcknowledgeMessages>::Error: Into<tower::BoxError>,
{
    pub fn new(store: D, policy: DeliveryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Record a successful publish of `message` as it was read by the relay.
    #[instrument(skip_all, fields(message_id = %message.id, attempt_count = message.attempt_count))]
    pub async fn published(
        &self,
        message: &OutboxMessage,
        delivery: Delivery,
    ) -> Result<Acknowledgement, RelayError> {
        let sent = self.transition(message.state, DeliveryEvent::Published, message)?;
        if !self.store_result(self.store.mark_sent(message.id, message.version).await)? {
            return Ok(Acknowledgement::Stale);
        }
        tracing::debug!(state = %sent, "Message marked as sent");

        if delivery == Delivery::Sent {
            return Ok(Acknowledgement::Sent);
        }

        self.transition(sent, DeliveryEvent::Confirmed, message)?;
        let confirmed = self.store_result(
            self.store
                .mark_confirmed(message.id, message.version + 1)
                .await,
        )?;
        Ok(if confirmed {
            Acknowledgement::Confirmed
        } else {
            Acknowledgement::Sent
        })
    }

    /// Record a failed publish attempt of `message`.
    ///
    /// The row goes back to the retry pool with a backoff gate, or becomes
    /// dead once its retry budget is spent. It is never dropped.
    #[instrument(skip_all, fields(message_id = %message.id, attempt_count = message.attempt_count))]
    pub async fn failed(
        &self,
        message: &OutboxMessage,
        error: &str,
    ) -> Result<Acknowledgement, RelayError> {
        let next = message
            .state
            .apply(DeliveryEvent::PublishFailed, message.attempt_count, &self.policy)
            .map_err(RelayError::invalid_transition)?;

        let applied = match next.retry_after {
            Some(retry_after) => {
                let retry_at = retry_at(Utc::now(), retry_after);
                self.store
                    .mark_failed(message.id, message.version, error, retry_at)
                    .await
            }
            None => self.store.mark_dead(message.id, message.version, error).await,
        };
        if !self.store_result(applied)? {
            return Ok(Acknowledgement::Stale);
        }

        Ok(match next.retry_after {
            Some(retry_after) => Acknowledgement::Retrying {
                attempt: next.attempt_count,
                retry_after,
            },
            None => Acknowledgement::Dead {
                attempt: next.attempt_count,
            },
        })
    }

    /// Settle rows the regular publish path can no longer reach.
    ///
    /// A `SENT` row last published more than `confirm_timeout` ago is treated
    /// as a failed attempt, so it is republished or becomes dead. Retryable
    /// rows whose attempt count already meets the budget are made dead.
    #[instrument(skip(self))]
    pub async fn sweep(&self, confirm_timeout: Duration) -> Result<Sweep, RelayError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let sent_before = chrono::Duration::from_std(confirm_timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let unconfirmed = self
            .store
            .expire_unconfirmed(sent_before, max_attempts, "no broker confirm within timeout")
            .await
            .map_err(|e| RelayError::store(e.into()))?;
        let exhausted = self
            .store
            .bury_exhausted(max_attempts)
            .await
            .map_err(|e| RelayError::store(e.into()))?;

        let sweep = Sweep {
            unconfirmed,
            exhausted,
        };
        if sweep != Sweep::default() {
            tracing::warn!(unconfirmed, exhausted, "Swept undeliverable messages");
        }
        Ok(sweep)
    }

    fn transition(
        &self,
        from: MessageState,
        event: DeliveryEvent,
        message: &OutboxMessage,
    ) -> Result<MessageState, RelayError> {
        from.apply(event, message.attempt_count, &self.policy)
            .map(|t| t.state)
            .map_err(RelayError::invalid_transition)
    }

    fn store_result<E: Into<tower::BoxError>>(
        &self,
        result: Result<bool, E>,
    ) -> Result<bool, RelayError> {
        result.map_err(|e| RelayError::store(e.into()))
    }
}

impl<D> Acknowledger<D>
where
    D: AcknowledgeMessages + InspectMessages + Send + Sync,
    <D as AcknowledgeMessages>::Error: Into<tower::BoxError>,
    <D as InspectMessages>::Error: Into<tower::BoxError>,
{
    /// Record a broker confirm that arrived after the publish returned.
    ///
    /// Late or repeated confirms for a row that is already confirmed, or no
    /// longer exists, are reported as [`Acknowledgement::Stale`].
    #[instrument(skip(self))]
    pub async fn confirm(&self, id: MessageId) -> Result<Acknowledgement, RelayError> {
        let Some(message) = self.find(id).await? else {
            return Ok(Acknowledgement::Stale);
        };
        if message.state == MessageState::Confirmed {
            return Ok(Acknowledgement::Stale);
        }

        self.transition(message.state, DeliveryEvent::Confirmed, &message)?;
        let confirmed =
            self.store_result(self.store.mark_confirmed(id, message.version).await)?;
        Ok(if confirmed {
            tracing::info!(message_id = %id, "Message confirmed by broker");
            Acknowledgement::Confirmed
        } else {
            Acknowledgement::Stale
        })
    }

    /// Put a dead message back in the delivery pool with a fresh retry
    /// budget. Returns `false` if the message does not exist.
    #[instrument(skip(self))]
    pub async fn replay(&self, id: MessageId) -> Result<bool, RelayError> {
        let Some(message) = self.find(id).await? else {
            return Ok(false);
        };
        self.transition(message.state, DeliveryEvent::Replayed, &message)?;

        let requeued = self
            .store
            .requeue_dead(id)
            .await
            .map_err(|e| RelayError::store(e.into()))?;
        if requeued {
            tracing::info!(message_id = %id, "Dead message replayed");
        }
        Ok(requeued)
    }

    async fn find(&self, id: MessageId) -> Result<Option<OutboxMessage>, RelayError> {
        InspectMessages::find(&self.store, id)
            .await
            .map_err(|e| RelayError::store(e.into()))
    }
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
