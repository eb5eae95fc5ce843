//! Global pacing for calls to the generative service.
//!
//! One [`OutboundThrottle`] is shared by every worker, so it bounds the
//! aggregate call rate no matter how many workers are running.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::consts::THROTTLE_MARGIN;
use crate::error::PipelineError;

/// With a rate of zero nothing should get through; tick once an hour.
const STALLED_INTERVAL: Duration = Duration::from_secs(3600);

pub struct OutboundThrottle {
    ticker: Mutex<Interval>,
    period: Duration,
}

impl OutboundThrottle {
    /// A throttle admitting roughly `rate_per_sec` calls per second.
    ///
    /// Must be created inside a tokio runtime.
    pub fn new(rate_per_sec: u32) -> Self {
        let period = Self::period_for(rate_per_sec);
        let mut ticker = tokio::time::interval(period);
        // Idle time never banks a burst: one late tick, then full spacing again.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(rate_per_sec, ?period, "outbound throttle configured");
        Self {
            ticker: Mutex::new(ticker),
            period,
        }
    }

    /// Tick spacing for a target rate: `1000ms / rate` plus a safety margin.
    pub fn period_for(rate_per_sec: u32) -> Duration {
        if rate_per_sec == 0 {
            return STALLED_INTERVAL;
        }
        Duration::from_millis(1000 / u64::from(rate_per_sec)) + THROTTLE_MARGIN
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until the next tick, or until `cancel` fires.
    ///
    /// Waiters queue on a fair lock, so they are served in arrival order and
    /// each tick releases exactly one of them.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = async {
                let mut ticker = self.ticker.lock().await;
                ticker.tick().await;
            } => Ok(()),
        }
    }
}
