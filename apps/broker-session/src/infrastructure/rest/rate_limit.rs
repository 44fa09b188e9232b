//! 429 backoff for broker REST calls.
//!
//! Every 429 response advances a shared retry counter and opens a backoff
//! window. Callers wait for the window before sending; a success resets the
//! counter.
//!
//! # Delay
//!
//! `delay(n) = max(base_delay * 2^(n-1), Retry-After)` for the n-th
//! consecutive 429, so with the defaults the schedule is 1, 2, 4, 8, 16 s
//! unless the server asks for longer.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Rate-limit retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Retries allowed after consecutive 429s before giving up.
    pub max_retries: u32,
    /// Upper bound on any single wait, including server-supplied ones.
    pub max_delay: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 5,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RateLimitPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
            max_delay: Duration::from_secs(300),
        }
    }

    /// Delay for the `attempt`-th consecutive 429 (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let computed = self.base_delay.saturating_mul(1u32 << exponent);
        retry_after
            .map_or(computed, |server| computed.max(server))
            .min(self.max_delay)
    }
}

/// Snapshot of the shared rate-limit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    /// Consecutive 429s seen.
    pub retry_count: u32,
    /// End of the active backoff window.
    pub backoff_until: Option<Instant>,
}

/// What to do after a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Wait `delay`, then resend.
    Retry {
        /// 1-based retry number.
        attempt: u32,
        /// Wait before resending.
        delay: Duration,
    },
    /// Retries exhausted.
    GiveUp {
        /// 429s seen, including this one.
        attempts: u32,
    },
}

/// Shared 429 backoff state.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(RateLimitState {
                retry_count: 0,
                backoff_until: None,
            }),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn state(&self) -> RateLimitState {
        *self.state.lock()
    }

    /// Time left in the backoff window, if one is active.
    #[must_use]
    pub fn remaining_backoff(&self) -> Option<Duration> {
        let until = self.state.lock().backoff_until?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Sleep until the active backoff window, if any, has passed.
    pub async fn wait(&self) {
        let until = self.state.lock().backoff_until;
        if let Some(until) = until
            && until > Instant::now()
        {
            tracing::debug!(
                wait_ms = until.saturating_duration_since(Instant::now()).as_millis(),
                "Waiting for rate-limit backoff"
            );
            tokio::time::sleep_until(until.into()).await;
        }
    }

    /// Register a 429 and decide whether to retry.
    ///
    /// Exhaustion clears the counters so the next call starts fresh.
    pub fn on_rate_limited(&self, retry_after: Option<Duration>) -> RateLimitDecision {
        let mut state = self.state.lock();
        state.retry_count += 1;
        let attempt = state.retry_count;

        if attempt > self.policy.max_retries {
            state.retry_count = 0;
            state.backoff_until = None;
            return RateLimitDecision::GiveUp { attempts: attempt };
        }

        let delay = self.policy.delay_for(attempt, retry_after);
        state.backoff_until = Some(Instant::now() + delay);
        RateLimitDecision::Retry { attempt, delay }
    }

    /// Clear the counters after a successful call.
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        state.retry_count = 0;
        state.backoff_until = None;
    }
}

/// Extract Retry-After duration from HTTP headers.
pub struct RetryAfterExtractor;

impl RetryAfterExtractor {
    /// Parse Retry-After header value.
    ///
    /// Supports both delta-seconds (e.g., "120") and HTTP-date format. Dates
    /// in the past yield a zero delay.
    #[must_use]
    pub fn parse(value: &str) -> Option<Duration> {
        Self::parse_at(value, Utc::now())
    }

    /// [`RetryAfterExtractor::parse`] against an explicit clock.
    #[must_use]
    pub fn parse_at(value: &str, now: DateTime<Utc>) -> Option<Duration> {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }

        let date = DateTime::parse_from_rfc2822(value).ok()?;
        Some(
            (date.with_timezone(&Utc) - now)
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Read and parse the header from a response.
    #[must_use]
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;

    #[test_case(1, None => Duration::from_secs(1) ; "first retry")]
    #[test_case(2, None => Duration::from_secs(2) ; "second retry")]
    #[test_case(3, None => Duration::from_secs(4) ; "third retry")]
    #[test_case(5, None => Duration::from_secs(16) ; "fifth retry")]
    #[test_case(1, Some(Duration::from_secs(3)) => Duration::from_secs(3) ; "retry after larger")]
    #[test_case(4, Some(Duration::from_secs(3)) => Duration::from_secs(8) ; "computed larger")]
    fn delay_schedule(attempt: u32, retry_after: Option<Duration>) -> Duration {
        RateLimitPolicy::default().delay_for(attempt, retry_after)
    }

    #[test]
    fn delay_is_capped() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(10_000))),
            Duration::from_secs(300)
        );
        assert_eq!(policy.delay_for(40, None), Duration::from_secs(300));
    }

    #[test]
    fn retries_until_exhausted_then_resets() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(Duration::from_millis(1), 2));

        assert!(matches!(
            limiter.on_rate_limited(None),
            RateLimitDecision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            limiter.on_rate_limited(None),
            RateLimitDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(
            limiter.on_rate_limited(None),
            RateLimitDecision::GiveUp { attempts: 3 }
        );
        assert_eq!(limiter.state().retry_count, 0);
        assert!(limiter.state().backoff_until.is_none());
    }

    #[test]
    fn success_clears_state() {
        let limiter = RateLimiter::new(RateLimitPolicy::default());
        let _ = limiter.on_rate_limited(Some(Duration::from_secs(3)));
        assert!(limiter.remaining_backoff().is_some());

        limiter.on_success();

        assert_eq!(limiter.state().retry_count, 0);
        assert!(limiter.remaining_backoff().is_none());
    }

    #[tokio::test]
    async fn wait_sleeps_for_backoff_window() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(Duration::from_millis(50), 5));
        let _ = limiter.on_rate_limited(None);

        let start = Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn wait_returns_immediately_without_backoff() {
        let limiter = RateLimiter::new(RateLimitPolicy::default());
        let start = Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn parse_seconds() {
        assert_eq!(RetryAfterExtractor::parse("3"), Some(Duration::from_secs(3)));
        assert_eq!(RetryAfterExtractor::parse(" 120 "), Some(Duration::from_secs(120)));
    }

    #[test]
    fn parse_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            RetryAfterExtractor::parse_at("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn parse_past_date_is_zero() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            RetryAfterExtractor::parse_at("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn parse_garbage() {
        assert!(RetryAfterExtractor::parse("soon").is_none());
        assert!(RetryAfterExtractor::parse("").is_none());
    }
}
