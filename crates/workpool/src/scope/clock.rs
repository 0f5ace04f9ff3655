//! Time source used for deadlines and durations

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

/// Source of "now" and of deadline sleeps
///
/// Scopes and the pool read time only through this trait so deadline
/// behaviour can be driven by hand in tests.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant
    fn now(&self) -> Instant;

    /// Resolve once `now() >= deadline`
    async fn sleep_until(&self, deadline: Instant);
}

/// Real time, via `tokio::time`
///
/// Honours tokio's paused clock (`tokio::time::pause`) in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Clock that only moves when [`ManualClock::advance`] is called
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use workpool::{CancellationScope, ManualClock};
///
/// let clock = Arc::new(ManualClock::new());
/// let scope = CancellationScope::with_clock(clock.clone())
///     .with_timeout(Duration::from_secs(5));
///
/// assert!(!scope.is_cancelled());
/// clock.advance(Duration::from_secs(5));
/// assert!(scope.is_cancelled());
/// ```
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: watch::Sender<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (elapsed, _) = watch::channel(Duration::ZERO);
        Self {
            origin: Instant::now(),
            elapsed,
        }
    }

    /// Move time forward and wake every sleeper whose deadline has passed
    pub fn advance(&self, by: Duration) {
        self.elapsed.send_modify(|elapsed| *elapsed += by);
    }

    /// Total time advanced so far
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.borrow()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.borrow()
    }

    async fn sleep_until(&self, deadline: Instant) {
        let mut rx = self.elapsed.subscribe();
        loop {
            if self.origin + *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as the clock; unreachable while borrowed.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::from_millis(250));
        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now() - start, Duration::from_millis(500));
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_manual_sleep_wakes_on_advance() {
        let clock = Arc::new(ManualClock::new());
        let deadline = clock.now() + Duration::from_secs(10);

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep_until(deadline).await })
        };

        clock.advance(Duration::from_secs(3));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(7));
        sleeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_sleep_past_deadline_returns_immediately() {
        let clock = ManualClock::new();
        let deadline = clock.now();
        clock.sleep_until(deadline).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep_until(start + Duration::from_secs(30)).await;
        assert!(clock.now() - start >= Duration::from_secs(30));
    }
}
