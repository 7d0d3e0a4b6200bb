use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Notify,
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Shortest poll interval; `tokio::time::interval` rejects zero.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Wakes a relay immediately instead of waiting for the next poll tick.
///
/// Intended as a commit hook: call [`notify`](RelayTrigger::notify) after the
/// business transaction commits. A notification sent while the relay is busy
/// is kept, so the relay runs one more pass afterwards.
#[derive(Clone, Debug, Default)]
pub struct RelayTrigger(Arc<Notify>);

impl RelayTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_one();
    }

    async fn notified(&self) {
        self.0.notified().await
    }
}

/// Why the relay woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Tick,
    Triggered,
}

/// Wake-up source of the relay loop: a fixed interval, a [`RelayTrigger`],
/// or cancellation.
///
/// The first tick fires immediately, so a freshly started relay picks up rows
/// left behind by a previous process.
pub(crate) struct Poller {
    ticker: Interval,
    trigger: RelayTrigger,
    cancel: CancellationToken,
}

impl Poller {
    pub(crate) fn new(interval: Duration, trigger: RelayTrigger, cancel: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            trigger,
            cancel,
        }
    }

    /// Wait for the next reason to run a pass; `None` once cancelled.
    pub(crate) async fn next(&mut self) -> Option<Wake> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = self.trigger.notified() => {
                // A triggered pass resets the schedule.
                self.ticker.reset();
                Some(Wake::Triggered)
            }
            _ = self.ticker.tick() => Some(Wake::Tick),
        }
    }
}
