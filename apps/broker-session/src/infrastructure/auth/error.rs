//! Authentication error types.

use std::time::Duration;

use thiserror::Error;

use crate::application::ports::TokenStoreError;

/// Errors from the shared token cache and refresh lock.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Lock not acquired within the timeout. Retryable.
    #[error("Token lock not acquired after {}ms", waited.as_millis())]
    LockTimeout {
        /// Time spent polling.
        waited: Duration,
    },

    /// Cache or lock file I/O failed.
    #[error("Token cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache file could not be encoded.
    #[error("Token cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token endpoint rejected the refresh token (4xx). The refresh token is
    /// unusable and a new authorization is required.
    #[error("Refresh token rejected: HTTP {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Refresh failed for a transient reason.
    #[error("Token refresh failed: {0}")]
    Refresh(String),
}

impl TokenError {
    /// Whether retrying later may succeed without user interaction.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Refresh(_) | Self::Io(_))
    }
}

/// Errors from [`Authenticator`](super::Authenticator).
#[derive(Debug, Error)]
pub enum AuthError {
    /// Redirect arrived without a `code` parameter.
    #[error("Authorization callback carried no code")]
    MissingCode,

    /// Redirect `state` did not match the one sent.
    #[error("Authorization callback state mismatch")]
    StateMismatch,

    /// No redirect within the allowed time.
    #[error("No authorization callback within {}s", waited.as_secs())]
    CallbackTimeout {
        /// Time waited.
        waited: Duration,
    },

    /// Redirect listener could not be started.
    #[error("Failed to bind redirect listener: {0}")]
    CallbackBind(String),

    /// Authorization server returned an `error` parameter.
    #[error("Authorization denied: {0}")]
    Denied(String),

    /// Token endpoint returned a non-success status.
    #[error("Token exchange failed: HTTP {status}: {body}")]
    Exchange {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Token endpoint unreachable.
    #[error("Network error: {0}")]
    Network(String),

    /// Token endpoint response was not the expected JSON.
    #[error("Token response decode error: {0}")]
    Decode(String),

    /// Shared cache or refresh lock failure.
    #[error(transparent)]
    Coordinator(#[from] TokenError),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] TokenStoreError),

    /// No refresh token and the interactive flow is disabled.
    #[error("No refresh token available and interactive authorization is disabled")]
    InteractiveDisabled,

    /// OAuth settings are unusable.
    #[error("Invalid OAuth configuration: {0}")]
    InvalidConfig(String),
}
