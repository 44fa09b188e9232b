//! Session Metrics
//!
//! Counters and gauges published through the `metrics` facade. Nothing is
//! exported unless the host process installs a recorder; call
//! [`describe_metrics`] after installing one to attach help text.
//!
//! # Metrics Categories
//!
//! - **Requests**: REST calls, failures by kind, rate-limit retries
//! - **Circuit**: breaker openings
//! - **Tokens**: refreshes performed vs adopted from a sibling process
//! - **Streaming**: frames decoded/dropped, heartbeats, callback panics

use metrics::{counter, describe_counter, describe_gauge, gauge};

// =============================================================================
// Metric Registration
// =============================================================================

/// Attach descriptions to every session metric.
pub fn describe_metrics() {
    describe_counter!(
        "broker_session_requests_total",
        "REST requests sent to the broker gateway"
    );
    describe_counter!(
        "broker_session_request_failures_total",
        "REST requests that ended in an error, by kind"
    );
    describe_counter!(
        "broker_session_rate_limit_retries_total",
        "Requests retried after a 429 response"
    );
    describe_counter!(
        "broker_session_circuit_opened_total",
        "Times the circuit breaker opened"
    );
    describe_counter!(
        "broker_session_token_refreshes_total",
        "Token refreshes, by outcome"
    );
    describe_counter!(
        "broker_session_frames_decoded_total",
        "Streaming frames decoded"
    );
    describe_counter!(
        "broker_session_frames_dropped_total",
        "Streaming frames discarded as malformed or unroutable"
    );
    describe_counter!(
        "broker_session_heartbeats_total",
        "Streaming heartbeat control messages received"
    );
    describe_counter!(
        "broker_session_callback_panics_total",
        "Price callbacks that panicked"
    );
    describe_gauge!(
        "broker_session_stream_connected",
        "1 while the streaming socket is connected"
    );
    describe_gauge!(
        "broker_session_subscriptions",
        "Active price subscriptions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// How a token refresh request was satisfied.
#[derive(Debug, Clone, Copy)]
pub enum RefreshOutcome {
    /// This process called the token endpoint.
    Performed,
    /// A sibling process had already refreshed; its tokens were adopted.
    Adopted,
    /// The refresh failed.
    Failed,
}

impl RefreshOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Performed => "performed",
            Self::Adopted => "adopted",
            Self::Failed => "failed",
        }
    }
}

/// Record an outbound REST request.
pub fn record_request(method: &str) {
    counter!("broker_session_requests_total", "method" => method.to_string()).increment(1);
}

/// Record a failed REST request.
pub fn record_request_failure(kind: &'static str) {
    counter!("broker_session_request_failures_total", "kind" => kind).increment(1);
}

/// Record a 429 retry.
pub fn record_rate_limit_retry() {
    counter!("broker_session_rate_limit_retries_total").increment(1);
}

/// Record the circuit breaker opening.
pub fn record_circuit_opened() {
    counter!("broker_session_circuit_opened_total").increment(1);
}

/// Record a token refresh outcome.
pub fn record_token_refresh(outcome: RefreshOutcome) {
    counter!("broker_session_token_refreshes_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record decoded streaming frames.
pub fn record_frames_decoded(count: u64) {
    counter!("broker_session_frames_decoded_total").increment(count);
}

/// Record a dropped streaming frame.
pub fn record_frame_dropped(reason: &'static str) {
    counter!("broker_session_frames_dropped_total", "reason" => reason).increment(1);
}

/// Record a heartbeat control message.
pub fn record_heartbeat() {
    counter!("broker_session_heartbeats_total").increment(1);
}

/// Record a panicking price callback.
pub fn record_callback_panic() {
    counter!("broker_session_callback_panics_total").increment(1);
}

/// Update the streaming connection gauge.
pub fn set_stream_connected(connected: bool) {
    gauge!("broker_session_stream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the subscription count gauge.
pub fn set_subscriptions(count: usize) {
    gauge!("broker_session_subscriptions").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_outcome_as_str() {
        assert_eq!(RefreshOutcome::Performed.as_str(), "performed");
        assert_eq!(RefreshOutcome::Adopted.as_str(), "adopted");
        assert_eq!(RefreshOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        describe_metrics();
        record_request("GET");
        record_request_failure("timeout");
        record_token_refresh(RefreshOutcome::Adopted);
        set_subscriptions(3);
    }
}
