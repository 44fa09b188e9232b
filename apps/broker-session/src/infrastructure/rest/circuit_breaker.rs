//! Circuit breaker for the broker REST gateway.
//!
//! Stops all outbound calls after a run of consecutive failures and lets
//! them through again once a cooldown has passed.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN   (consecutive_errors >= max_consecutive_errors)
//! OPEN   → CLOSED (now >= cooldown_until, or manual reset)
//! ```
//!
//! Opening resets `consecutive_errors`, so after the cooldown a full new run
//! of failures is needed to open again. There is no half-open probing.
//!
//! # Configuration
//!
//! - `max_consecutive_errors`: failures in a row that open the circuit (default: 5)
//! - `cooldown`: time to stay open (default: 15 minutes)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::infrastructure::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without network I/O.
    Open,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_consecutive_errors: u32,
    /// Duration to stay in `OPEN` state.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            cooldown: Duration::from_secs(15 * 60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(max_consecutive_errors: u32, cooldown: Duration) -> Self {
        Self {
            max_consecutive_errors,
            cooldown,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_errors: u32,
    is_open: bool,
    cooldown_until: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                consecutive_errors: 0,
                is_open: false,
                cooldown_until: None,
                last_success: None,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    /// Get the service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, closing the circuit first if its cooldown has elapsed.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock();
        self.close_if_cooled_down(&mut inner, Instant::now());
        if inner.is_open {
            CircuitBreakerState::Open
        } else {
            CircuitBreakerState::Closed
        }
    }

    /// Whether calls are currently rejected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitBreakerState::Open
    }

    /// Time left until the circuit closes, `None` when closed.
    #[must_use]
    pub fn retry_in(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.close_if_cooled_down(&mut inner, now);
        if !inner.is_open {
            return None;
        }
        Some(
            inner
                .cooldown_until
                .map_or(Duration::ZERO, |until| until.saturating_duration_since(now)),
        )
    }

    /// Consecutive failures since the last success or opening.
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().consecutive_errors
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_errors = 0;
        inner.last_success = Some(Utc::now());
    }

    /// Record a failed call, opening the circuit at the threshold.
    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.close_if_cooled_down(&mut inner, now);

        if inner.is_open {
            drop(inner);
            tracing::debug!(name = %self.name, "Failure recorded while circuit is OPEN");
            return;
        }

        inner.consecutive_errors += 1;
        if inner.consecutive_errors >= self.config.max_consecutive_errors {
            let errors = inner.consecutive_errors;
            Self::open(&mut inner, now, self.config.cooldown);
            drop(inner);
            self.on_opened(errors);
        }
    }

    /// Manually close the circuit and clear the failure count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let was_open = inner.is_open;
        inner.is_open = false;
        inner.cooldown_until = None;
        inner.consecutive_errors = 0;
        drop(inner);

        if was_open {
            tracing::info!(name = %self.name, from = "OPEN", to = "CLOSED", "Circuit breaker reset");
        }
    }

    /// Get metrics for this circuit breaker.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.close_if_cooled_down(&mut inner, now);

        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: if inner.is_open {
                CircuitBreakerState::Open
            } else {
                CircuitBreakerState::Closed
            },
            consecutive_errors: inner.consecutive_errors,
            max_consecutive_errors: self.config.max_consecutive_errors,
            cooldown_remaining: inner
                .cooldown_until
                .filter(|_| inner.is_open)
                .map(|until| until.saturating_duration_since(now)),
            last_success: inner.last_success,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }

    fn open(inner: &mut BreakerInner, now: Instant, cooldown: Duration) {
        inner.is_open = true;
        inner.consecutive_errors = 0;
        inner.cooldown_until = Some(now + cooldown);
    }

    fn on_opened(&self, errors: u32) {
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_opened();
        tracing::warn!(
            name = %self.name,
            consecutive_errors = errors,
            cooldown_secs = self.config.cooldown.as_secs(),
            from = "CLOSED",
            to = "OPEN",
            "Circuit breaker opened"
        );
    }

    fn close_if_cooled_down(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.is_open
            && let Some(until) = inner.cooldown_until
            && now >= until
        {
            inner.is_open = false;
            inner.cooldown_until = None;
            inner.consecutive_errors = 0;
            tracing::info!(
                name = %self.name,
                from = "OPEN",
                to = "CLOSED",
                "Circuit breaker cooldown elapsed"
            );
        }
    }
}

/// Metrics for a circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Service name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Failures since the last success or opening.
    pub consecutive_errors: u32,
    /// Threshold that opens the circuit.
    pub max_consecutive_errors: u32,
    /// Time left in `OPEN` state.
    pub cooldown_remaining: Option<Duration>,
    /// Wall-clock time of the last successful call.
    pub last_success: Option<DateTime<Utc>>,
    /// Total calls.
    pub total_calls: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Times the circuit opened.
    pub times_opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::new(max, cooldown))
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.max_consecutive_errors, 5);
        assert_eq!(config.cooldown, Duration::from_secs(900));
    }

    #[test]
    fn test_initial_state_is_closed() {
        let breaker = breaker(5, Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert!(!breaker.is_open());
        assert!(breaker.retry_in().is_none());
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker(5, Duration::from_secs(60));

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_errors(), 4);

        breaker.record_failure();

        assert!(breaker.is_open());
        assert_eq!(breaker.consecutive_errors(), 0);
        assert!(breaker.retry_in().unwrap() > Duration::from_secs(59));
    }

    #[test]
    fn test_success_interrupts_failure_run() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_errors(), 2);
    }

    #[test]
    fn test_closes_after_cooldown_and_success_resets() {
        let breaker = breaker(2, Duration::from_millis(10));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(20));

        assert!(!breaker.is_open());
        breaker.record_failure();
        assert_eq!(breaker.consecutive_errors(), 1);
        breaker.record_success();
        assert_eq!(breaker.consecutive_errors(), 0);
        assert!(breaker.metrics().last_success.is_some());
    }

    #[test]
    fn test_failures_while_open_do_not_extend_cooldown() {
        let breaker = breaker(1, Duration::from_millis(30));
        breaker.record_failure();
        let before = breaker.retry_in().unwrap();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.retry_in().unwrap() <= before);
        assert_eq!(breaker.metrics().times_opened, 1);
    }

    #[test]
    fn test_manual_reset() {
        let breaker = breaker(1, Duration::from_secs(3600));
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.reset();

        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[test]
    fn test_metrics() {
        let breaker = breaker(2, Duration::from_secs(60));
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        let metrics = breaker.metrics();
        assert_eq!(metrics.name, "test");
        assert_eq!(metrics.state, CircuitBreakerState::Open);
        assert_eq!(metrics.total_calls, 3);
        assert_eq!(metrics.total_failures, 2);
        assert_eq!(metrics.times_opened, 1);
        assert!(metrics.cooldown_remaining.is_some());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitBreakerState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitBreakerState::Open.to_string(), "OPEN");
    }
}
