// =============================================================================
// Rolling-window rate limiter for trade submissions
// =============================================================================
//
// Strict rolling window: an acquisition succeeds only while the number of
// acquisitions in the trailing window is below the cap. Timestamps are
// pruned on every call. Only the trade-executor task calls try_acquire, so
// the lock is uncontended in practice.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Counts events in a trailing window and rejects once the cap is reached.
pub struct RollingRateLimiter {
    window: Duration,
    max_events: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RollingRateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            window,
            max_events,
            timestamps: Mutex::new(VecDeque::with_capacity(max_events)),
        }
    }

    /// Standard limiter: `max_per_minute` events in a rolling 60 s window.
    pub fn per_minute(max_per_minute: usize) -> Self {
        Self::new(max_per_minute, Duration::from_secs(60))
    }

    /// Try to record one event now. Returns `false` without recording when
    /// the window is already at capacity.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();

        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_events {
            debug!(
                in_window = timestamps.len(),
                cap = self.max_events,
                "rate limit reached"
            );
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Events currently inside the window.
    pub fn current_count(&self) -> usize {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len()
    }
}
