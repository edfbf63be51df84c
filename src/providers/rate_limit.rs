//! Call pacing for rate-limited endpoints.
//!
//! The open platform throttles listing and download-link calls per account.
//! A `RateLimiter` hands out one slot per interval; callers wait their turn
//! in arrival order.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Allow at most `calls_per_sec` calls per second; 0 means unlimited.
    pub fn per_second(calls_per_sec: u32) -> Self {
        let interval = if calls_per_sec == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / calls_per_sec
        };
        Self::with_interval(interval)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::with_interval(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the next slot is free and claim it.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        // Held across the sleep so waiters are served in order
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next_slot {
            Some(slot) if slot > now => {
                trace!("rate limit: waiting {:?}", slot - now);
                sleep_until(slot).await;
                slot
            }
            _ => now,
        };
        *next_slot = Some(slot + self.interval);
    }
}
