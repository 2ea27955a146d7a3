//! Cooperative session countdown
//!
//! Wakes once per period, recomputes the remainder from the absolute
//! deadline and reports it. Cancellation is checked before every tick, so
//! a cancel that lands before tick N means tick N is never reported.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::SharedClock;
use crate::session::remaining_until;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// How a countdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    /// The deadline was reached
    Expired,
    /// The token was cancelled first
    Cancelled,
}

pub struct Countdown {
    deadline: DateTime<Utc>,
    period: Duration,
    clock: SharedClock,
}

impl Countdown {
    pub fn new(deadline: DateTime<Utc>, clock: SharedClock) -> Self {
        Self {
            deadline,
            period: DEFAULT_PERIOD,
            clock,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Run until the deadline passes or `cancel` fires
    ///
    /// `on_tick` receives the seconds still remaining; it is not called
    /// for the final, expiring tick.
    pub async fn run<F>(self, cancel: CancellationToken, mut on_tick: F) -> CountdownOutcome
    where
        F: FnMut(u64),
    {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("countdown cancelled");
                    return CountdownOutcome::Cancelled;
                }
                _ = ticker.tick() => {
                    let remaining = remaining_until(self.deadline, self.clock.now());
                    if remaining == 0 {
                        debug!("countdown expired");
                        return CountdownOutcome::Expired;
                    }
                    on_tick(remaining);
                }
            }
        }
    }
}
