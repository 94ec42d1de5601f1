//! Minimum-interval rate limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::clock::Clock;

/// Default minimum interval between request starts.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Spaces request starts at least `min_interval` apart.
///
/// If the caller already spent longer than the interval since the previous
/// start (a slow response, heavy processing), [`RateLimiter::acquire`]
/// returns immediately.
pub struct RateLimiter {
    min_interval: Duration,
    clock: Arc<dyn Clock>,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval,
            clock,
            last_start: Mutex::new(None),
        }
    }

    /// The configured interval.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a request may start, then records the start. Returns how
    /// long it waited.
    pub async fn acquire(&self) -> Duration {
        let mut last_start = self.last_start.lock().await;

        let wait = last_start.map_or(Duration::ZERO, |last| {
            self.min_interval
                .saturating_sub(self.clock.now().saturating_duration_since(last))
        });

        if !wait.is_zero() {
            log::trace!("Rate limiter waiting {wait:?}");
            self.clock.sleep(wait).await;
        }

        *last_start = Some(self.clock.now());
        wait
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn waits_out_the_remaining_interval() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(Duration::from_secs(2), clock.clone());

        assert_eq!(limiter.acquire().await, Duration::ZERO);

        clock.advance(Duration::from_millis(500));
        assert_eq!(limiter.acquire().await, Duration::from_millis(1500));

        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1500)]);
    }

    #[tokio::test]
    async fn slow_cycle_adds_no_wait() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(Duration::from_secs(2), clock.clone());

        limiter.acquire().await;
        clock.advance(Duration::from_secs(3));
        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(Duration::ZERO, clock.clone());
        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }
}
