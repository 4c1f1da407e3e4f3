//! Rate-limit governance from response headers.
//!
//! The governor only reacts: it makes callers wait for the reset when the
//! quota is exhausted or a 429 is observed, and otherwise returns zero.
//! Shrinking the call rate as `remaining` approaches zero is not done here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use hybridcap_core::Clock;

/// Longest reset wait the executor sleeps through by default.
pub const DEFAULT_MAX_RESET_WAIT: Duration = Duration::from_secs(3_600);

/// Last observed quota. Overwritten on every response carrying rate headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RateLimitGovernor {
    clock: Arc<dyn Clock>,
    max_reset_wait: Duration,
    info: Mutex<Option<RateLimitInfo>>,
}

impl RateLimitGovernor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_reset_wait(clock, DEFAULT_MAX_RESET_WAIT)
    }

    pub fn with_max_reset_wait(clock: Arc<dyn Clock>, max_reset_wait: Duration) -> Self {
        Self {
            clock,
            max_reset_wait,
            info: Mutex::new(None),
        }
    }

    fn info(&self) -> MutexGuard<'_, Option<RateLimitInfo>> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_headers(&self, limit: u64, remaining: u64, reset_at: DateTime<Utc>) {
        debug!(limit, remaining, %reset_at, "rate limit observed");
        *self.info() = Some(RateLimitInfo {
            limit,
            remaining,
            reset_at,
        });
    }

    pub fn current(&self) -> Option<RateLimitInfo> {
        *self.info()
    }

    pub fn max_reset_wait(&self) -> Duration {
        self.max_reset_wait
    }

    /// Time until the observed quota resets (zero when unknown or past).
    pub fn reset_wait(&self) -> Duration {
        let Some(info) = self.current() else {
            return Duration::ZERO;
        };
        (info.reset_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Wait required before the next outbound call.
    ///
    /// Non-zero only when the quota is exhausted and the reset lies ahead.
    pub fn wait_before_next_call(&self) -> Duration {
        match self.current() {
            Some(info) if info.remaining == 0 => self.reset_wait(),
            _ => Duration::ZERO,
        }
    }

    /// Wait after a rate-limited response: the longest of the reset wait, the
    /// computed backoff and any `retry-after` the server sent. No call can
    /// succeed before the reset, whatever the backoff schedule says.
    pub fn rate_limited_wait(&self, backoff: Duration, retry_after: Option<Duration>) -> Duration {
        self.reset_wait()
            .max(backoff)
            .max(retry_after.unwrap_or(Duration::ZERO))
    }

    /// True when `wait` is longer than the executor may sleep.
    pub fn exceeds_max_wait(&self, wait: Duration) -> bool {
        wait > self.max_reset_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridcap_core::ManualClock;

    fn governor() -> (RateLimitGovernor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (RateLimitGovernor::new(clock.clone()), clock)
    }

    #[test]
    fn unknown_quota_never_waits() {
        let (gov, _) = governor();
        assert_eq!(gov.current(), None);
        assert_eq!(gov.wait_before_next_call(), Duration::ZERO);
        assert_eq!(
            gov.rate_limited_wait(Duration::from_secs(2), None),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn low_but_not_exhausted_quota_does_not_throttle() {
        let (gov, clock) = governor();
        gov.record_headers(5_000, 1, clock.now() + chrono::Duration::seconds(600));
        assert_eq!(gov.wait_before_next_call(), Duration::ZERO);
    }

    #[test]
    fn exhausted_quota_waits_for_reset() {
        let (gov, clock) = governor();
        gov.record_headers(5_000, 0, clock.now() + chrono::Duration::seconds(90));
        assert_eq!(gov.wait_before_next_call(), Duration::from_secs(90));

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(gov.wait_before_next_call(), Duration::ZERO);
    }

    #[test]
    fn rate_limited_wait_takes_the_longer_delay() {
        let (gov, clock) = governor();
        gov.record_headers(5_000, 0, clock.now() + chrono::Duration::milliseconds(45_000));

        let wait = gov.rate_limited_wait(Duration::from_millis(4_000), None);
        assert_eq!(wait, Duration::from_millis(45_000));

        let wait = gov.rate_limited_wait(Duration::from_millis(60_000), None);
        assert_eq!(wait, Duration::from_millis(60_000));

        let wait = gov.rate_limited_wait(Duration::ZERO, Some(Duration::from_secs(120)));
        assert_eq!(wait, Duration::from_secs(120));
    }

    #[test]
    fn latest_headers_overwrite_previous() {
        let (gov, clock) = governor();
        gov.record_headers(5_000, 0, clock.now() + chrono::Duration::seconds(30));
        gov.record_headers(5_000, 4_999, clock.now() + chrono::Duration::seconds(3_600));
        assert_eq!(gov.current().map(|i| i.remaining), Some(4_999));
        assert_eq!(gov.wait_before_next_call(), Duration::ZERO);
    }

    #[test]
    fn max_wait_guard() {
        let clock = Arc::new(ManualClock::starting_now());
        let gov = RateLimitGovernor::with_max_reset_wait(clock, Duration::from_secs(60));
        assert!(!gov.exceeds_max_wait(Duration::from_secs(60)));
        assert!(gov.exceeds_max_wait(Duration::from_secs(61)));
    }
}
