//! OAuth Token Set
//!
//! The access/refresh token pair shared by every bot process through the
//! local token cache file. A token set is never mutated in place; each
//! refresh produces a new one that supersedes the old.
//!
//! # Cache File Format
//!
//! ```json
//! {
//!   "access_token": "...",
//!   "refresh_token": "...",
//!   "token_expiry": "2026-01-15T10:00:00Z",
//!   "app_key": "...",
//!   "app_secret": "..."
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh token pair plus the application credentials it was issued for.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Bearer token sent on every REST call and the WebSocket handshake.
    pub access_token: String,
    /// Single-use refresh token.
    pub refresh_token: String,
    /// Instant after which the access token must not be used.
    #[serde(rename = "token_expiry")]
    pub expiry: DateTime<Utc>,
    /// Application key (OAuth client id).
    pub app_key: String,
    /// Application secret (OAuth client secret).
    pub app_secret: String,
}

impl TokenSet {
    /// Build a token set from a token endpoint grant.
    ///
    /// The stored expiry is pulled in by `safety_margin` so that a token is
    /// retired before the server would reject it.
    #[must_use]
    pub fn issue(
        access_token: String,
        refresh_token: String,
        expires_in: Duration,
        safety_margin: Duration,
        app_key: String,
        app_secret: String,
    ) -> Self {
        Self::issue_at(
            Utc::now(),
            access_token,
            refresh_token,
            expires_in,
            safety_margin,
            app_key,
            app_secret,
        )
    }

    /// Same as [`TokenSet::issue`] with an explicit issue time.
    #[must_use]
    pub fn issue_at(
        now: DateTime<Utc>,
        access_token: String,
        refresh_token: String,
        expires_in: Duration,
        safety_margin: Duration,
        app_key: String,
        app_secret: String,
    ) -> Self {
        let lifetime = expires_in.saturating_sub(safety_margin);
        Self {
            access_token,
            refresh_token,
            expiry: now + to_time_delta(lifetime),
            app_key,
            app_secret,
        }
    }

    /// `now + buffer < expiry`.
    #[must_use]
    pub fn is_valid(&self, buffer: Duration) -> bool {
        self.is_valid_at(Utc::now(), buffer)
    }

    /// Validity check against an explicit clock reading.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + to_time_delta(buffer) < self.expiry
    }

    /// Whether this set was issued after `other` (later expiry).
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.expiry > other.expiry
    }

    /// Whether a refresh grant can be attempted with this set.
    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Time left until expiry, zero if already expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        (self.expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("expiry", &self.expiry)
            .field("app_key", &self.app_key)
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}

/// Show only the last four characters of a secret.
pub(crate) fn redact(secret: &str) -> String {
    let tail: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 4 {
        "[REDACTED]".to_string()
    } else {
        format!("[REDACTED]...{tail}")
    }
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
