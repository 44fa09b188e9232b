//! REST executor error types.

use std::time::Duration;

use thiserror::Error;

/// Errors from [`RequestExecutor`](super::RequestExecutor).
#[derive(Debug, Error, Clone)]
pub enum ApiError {
    /// Circuit breaker is open; no request was sent.
    #[error("Circuit breaker open, retry in {}s", retry_in.as_secs())]
    CircuitOpen {
        /// Time until the breaker closes.
        retry_in: Duration,
    },

    /// 429 retries exhausted.
    #[error("Rate limited after {attempts} attempts")]
    RateLimited {
        /// 429 responses received.
        attempts: u32,
    },

    /// 401 persisted after a forced token refresh.
    #[error("Unauthorized after token refresh")]
    Unauthorized,

    /// No valid access token could be obtained.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// Request exceeded the configured timeout.
    #[error("Request timed out")]
    Timeout,

    /// Transport failure (DNS, connect, TLS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// Response body was not the expected JSON.
    #[error("Response decode error: {0}")]
    Decode(String),

    /// Request could not be built.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Short label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::AuthenticationFailed => "authentication_failed",
            Self::Status { .. } => "status",
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// HTTP status, when the failure came from a response.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Unauthorized => Some(401),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_message_shows_seconds() {
        let err = ApiError::CircuitOpen {
            retry_in: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "Circuit breaker open, retry in 42s");
        assert_eq!(err.kind(), "circuit_open");
    }

    #[test]
    fn status_is_exposed() {
        let err = ApiError::Status {
            status: 503,
            body: String::new(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(ApiError::Unauthorized.status(), Some(401));
        assert_eq!(ApiError::Timeout.status(), None);
    }

    #[test]
    fn json_error_maps_to_decode() {
        let err: ApiError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
