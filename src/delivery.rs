//! Delivery state machine.
//!
//! Every outbox row moves through the following states:
//!
//! ```text
//! PENDING --publish ok--------> SENT --broker confirm--> CONFIRMED
//! PENDING --publish failed----> FAILED
//! SENT    --publish failed----> FAILED
//! SENT    --confirm timeout---> FAILED | DEAD
//! FAILED  --publish ok--------> SENT
//! FAILED  --publish failed----> FAILED  (attempts < max, after backoff)
//!                          \--> DEAD    (attempts >= max)
//! DEAD    --operator replay---> PENDING
//! ```
//!
//! Transitions are pure: [`MessageState::apply`] returns the next state, the
//! new attempt count and, for retries, the delay before the row becomes
//! eligible again. Persisting the result is the job of
//! [`crate::acknowledger::Acknowledger`].

use std::{fmt, time::Duration};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

use crate::message::MessageState;

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 300_000;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Something that happened to a message during delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// The broker accepted the publish.
    Published,
    /// The broker confirmed a previously accepted publish.
    Confirmed,
    /// The publish failed, was rejected, or timed out.
    PublishFailed,
    /// An operator asked for a dead message to be delivered again.
    Replayed,
}

/// Result of applying a [`DeliveryEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: MessageState,
    pub attempt_count: u32,
    /// Set when the message goes back to the retry pool.
    pub retry_after: Option<Duration>,
}

/// Returned when an event does not apply to the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: MessageState,
    pub event: DeliveryEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot apply {:?} to a {} message", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

impl MessageState {
    /// Apply `event` to a message in this state that has already failed
    /// `attempt_count` times.
    pub fn apply(
        self,
        event: DeliveryEvent,
        attempt_count: u32,
        policy: &DeliveryPolicy,
    ) -> Result<Transition, InvalidTransition> {
        let stay = |state| Transition {
            state,
            attempt_count,
            retry_after: None,
        };

        match (self, event) {
            (Self::Pending | Self::Failed, DeliveryEvent::Published) => Ok(stay(Self::Sent)),
            (Self::Sent, DeliveryEvent::Confirmed) => Ok(stay(Self::Confirmed)),
            (Self::Pending | Self::Sent | Self::Failed, DeliveryEvent::PublishFailed) => {
                let attempts = attempt_count.saturating_add(1);
                if attempts >= policy.max_attempts {
                    Ok(Transition {
                        state: Self::Dead,
                        attempt_count: attempts,
                        retry_after: None,
                    })
                } else {
                    Ok(Transition {
                        state: Self::Failed,
                        attempt_count: attempts,
                        retry_after: Some(policy.backoff.delay_for(attempts)),
                    })
                }
            }
            (Self::Dead, DeliveryEvent::Replayed) => Ok(Transition {
                state: Self::Pending,
                attempt_count: 0,
                retry_after: None,
            }),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

/// Retry budget and backoff used by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Failed attempts after which a message is declared dead. Never below 1.
    #[serde(default = "default_max_attempts", deserialize_with = "at_least_one")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl DeliveryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Bounded exponential backoff.
///
/// ```text
/// attempt   delay (base = 1s, max = 5m)
///    1          1s
///    2          2s
///    3          4s
///    ...
///    9        256s
///   10+       300s
/// ```
///
/// A non-zero `jitter_factor` spreads each delay by up to ± that fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Fraction in `0.0..=1.0`.
    #[serde(default = "default_jitter", deserialize_with = "unit_fraction")]
    pub jitter_factor: f64,
}

fn default_base_delay() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER_FACTOR
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn at_least_one<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(u32::deserialize(deserializer)?.max(1))
}

fn unit_fraction<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(clamp_jitter(f64::deserialize(deserializer)?))
}

/// NaN counts as no jitter.
fn clamp_jitter(factor: f64) -> f64 {
    if factor.is_nan() {
        0.0
    } else {
        factor.clamp(0.0, 1.0)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic backoff without jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            jitter_factor: 0.0,
        }
    }

    /// Retry immediately on the next pass.
    pub fn none() -> Self {
        Self::exponential(Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = clamp_jitter(factor);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        let jitter = clamp_jitter(self.jitter_factor);
        if jitter == 0.0 || delay == 0 {
            return Duration::from_millis(delay);
        }

        let spread = delay as f64 * jitter;
        let jittered = delay as f64 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeliveryEvent::{Published, PublishFailed, Replayed};
    use MessageState::{Dead, Failed, Pending, Sent};

    fn policy(max_attempts: u32) -> DeliveryPolicy {
        DeliveryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffPolicy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(10),
            ))
    }

    #[test]
    fn happy_path_goes_pending_sent_confirmed() {
        let p = policy(3);

        let sent = Pending.apply(Published, 0, &p).unwrap();
        assert_eq!(sent.state, Sent);
        assert_eq!(sent.attempt_count, 0);

        let confirmed = Sent.apply(DeliveryEvent::Confirmed, 0, &p).unwrap();
        assert_eq!(confirmed.state, MessageState::Confirmed);
    }

    #[test]
    fn failures_back_off_until_the_budget_is_exhausted() {
        let p = policy(3);

        let first = Pending.apply(PublishFailed, 0, &p).unwrap();
        assert_eq!(first.state, Failed);
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.retry_after, Some(Duration::from_secs(1)));

        let second = Failed.apply(PublishFailed, 1, &p).unwrap();
        assert_eq!(second.retry_after, Some(Duration::from_secs(2)));

        let third = Failed.apply(PublishFailed, 2, &p).unwrap();
        assert_eq!(third.state, Dead);
        assert_eq!(third.attempt_count, 3);
        assert_eq!(third.retry_after, None);
    }

    #[test]
    fn failed_message_can_be_sent_on_retry() {
        let t = Failed.apply(Published, 2, &policy(5)).unwrap();
        assert_eq!(t.state, Sent);
        assert_eq!(t.attempt_count, 2);
    }

    #[test]
    fn terminal_states_reject_relay_events() {
        let p = policy(3);
        for event in [Published, DeliveryEvent::Confirmed, PublishFailed] {
            assert!(MessageState::Confirmed.apply(event, 0, &p).is_err());
            assert!(Dead.apply(event, 3, &p).is_err());
        }
        assert!(Pending.apply(DeliveryEvent::Confirmed, 0, &p).is_err());
        assert!(Sent.apply(Published, 0, &p).is_err());
    }

    #[test]
    fn replay_resets_a_dead_message() {
        let t = Dead.apply(Replayed, 5, &policy(5)).unwrap();
        assert_eq!(t.state, Pending);
        assert_eq!(t.attempt_count, 0);
        assert!(Pending.apply(Replayed, 0, &policy(5)).is_err());
    }

    #[test]
    fn backoff_is_capped() {
        let backoff =
            BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(200), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = BackoffPolicy::exponential(Duration::from_secs(10), Duration::from_secs(60))
            .with_jitter(0.2);
        for _ in 0..100 {
            let delay = backoff.delay_for(1);
            assert!(delay >= Duration::from_secs(8) && delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let p: DeliveryPolicy =
            serde_json::from_str(r#"{"backoff": {"base_delay_ms": 50}}"#).unwrap();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.backoff.base_delay_ms, 50);
        assert_eq!(p.backoff.max_delay_ms, 300_000);
    }

    #[test]
    fn zero_attempt_budget_deserializes_as_one() {
        let p: DeliveryPolicy = serde_json::from_str(r#"{"max_attempts": 0}"#).unwrap();
        assert_eq!(p.max_attempts, 1);

        let t = Pending.apply(PublishFailed, 0, &p).unwrap();
        assert_eq!(t.state, Dead);
        assert_eq!(t.attempt_count, 1);
    }

    #[test]
    fn out_of_range_jitter_is_clamped() {
        let wild: BackoffPolicy =
            serde_json::from_str(r#"{"base_delay_ms": 1000, "jitter_factor": 7.5}"#).unwrap();
        assert_eq!(wild.jitter_factor, 1.0);
        for attempt in 1..20 {
            assert!(wild.delay_for(attempt) <= Duration::from_millis(600_000));
        }

        let negative: BackoffPolicy =
            serde_json::from_str(r#"{"jitter_factor": -2.0}"#).unwrap();
        assert_eq!(negative.jitter_factor, 0.0);
        assert_eq!(negative.delay_for(1), Duration::from_millis(1000));

        let raw = BackoffPolicy {
            jitter_factor: f64::NAN,
            ..BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(1))
        };
        assert_eq!(raw.delay_for(1), Duration::from_secs(1));
    }
}
