use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

/// Fixed-period snapshot refresh. The caller gates ticks on the connection
/// being up; `restart` on every connect keeps a long disconnected stretch
/// from producing a burst of catch-up ticks.
pub struct RefreshScheduler {
    interval: Interval,
}

impl RefreshScheduler {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn restart(&mut self) {
        self.interval.reset();
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// At most one pending reconnect attempt
#[derive(Default)]
pub struct ReconnectTimer {
    pending: Option<Pin<Box<Sleep>>>,
}

impl ReconnectTimer {
    /// Arms the timer unless an attempt is already scheduled
    pub fn arm(&mut self, delay: Duration) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(Box::pin(sleep(delay)));
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves when the armed delay elapses; never resolves while disarmed
    pub async fn fired(&mut self) {
        match self.pending.as_mut() {
            Some(delay) => {
                delay.await;
                self.pending = None;
            }
            None => future::pending::<()>().await,
        }
    }
}
