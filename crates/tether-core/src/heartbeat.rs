use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::types::FIVE_SECONDS;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(FIVE_SECONDS);

/// Periodic pulse driving expiry sweeps, publish retries and pending
/// subscription checks.
#[derive(Debug, Clone, Copy)]
pub struct HeartBeat {
    interval: Duration,
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::new(HEARTBEAT_INTERVAL)
    }
}

impl HeartBeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ticker whose first pulse comes one interval from now.
    pub fn start(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_pulse_after_one_interval() {
        let beat = HeartBeat::new(Duration::from_secs(5));
        let start = Instant::now();
        let mut ticker = beat.start();

        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
