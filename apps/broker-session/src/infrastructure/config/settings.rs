//! Session Configuration Settings
//!
//! Configuration types for the broker session, loaded from environment
//! variables. Every component takes its own settings struct so it can be
//! built and tested without the full configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::infrastructure::rest::{CircuitBreakerConfig, RateLimitPolicy};

/// Broker environment (simulation vs live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Simulation gateway.
    #[default]
    Simulation,
    /// Live gateway (real money).
    Live,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" => Self::Live,
            _ => Self::Simulation,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Simulation => "sim",
            Self::Live => "live",
        }
    }
}

/// Application and account credentials.
#[derive(Clone)]
pub struct Credentials {
    app_key: String,
    app_secret: String,
    account_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(app_key: String, app_secret: String, account_key: String) -> Self {
        Self {
            app_key,
            app_secret,
            account_key,
        }
    }

    /// OAuth client id.
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// OAuth client secret.
    #[must_use]
    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }

    /// Account the price subscriptions are created under.
    #[must_use]
    pub fn account_key(&self) -> &str {
        &self.account_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &"[REDACTED]")
            .field("app_secret", &"[REDACTED]")
            .field("account_key", &"[REDACTED]")
            .finish()
    }
}

/// OAuth endpoints and interactive-flow settings.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    /// Authorization endpoint opened in the browser.
    pub auth_url: String,
    /// Token endpoint for code exchange and refresh.
    pub token_url: String,
    /// Local port the redirect listener binds to.
    pub redirect_port: u16,
    /// Maximum wait for the browser redirect.
    pub callback_timeout: Duration,
    /// Subtracted from `expires_in` when computing the stored expiry.
    pub expiry_safety_margin: Duration,
    /// Token endpoint request timeout.
    pub request_timeout: Duration,
    /// Whether the authorization-code flow may be started when no refresh
    /// token is available. Headless bots turn this off.
    pub allow_interactive: bool,
}

impl OAuthSettings {
    /// `http://localhost:{port}/callback`.
    #[must_use]
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.redirect_port)
    }

    /// Defaults for the given environment.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        let host = if environment.is_live() {
            "https://live.logonvalidation.net"
        } else {
            "https://sim.logonvalidation.net"
        };
        Self {
            auth_url: format!("{host}/authorize"),
            token_url: format!("{host}/token"),
            ..Self::default()
        }
    }

    /// Override both endpoints.
    #[must_use]
    pub fn with_endpoints(mut self, auth_url: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self.token_url = token_url.into();
        self
    }

    /// Override the redirect port.
    #[must_use]
    pub const fn with_redirect_port(mut self, port: u16) -> Self {
        self.redirect_port = port;
        self
    }

    /// Override the callback wait.
    #[must_use]
    pub const fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Enable or disable the interactive flow.
    #[must_use]
    pub const fn with_interactive(mut self, allow: bool) -> Self {
        self.allow_interactive = allow;
        self
    }
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            auth_url: "https://sim.logonvalidation.net/authorize".to_string(),
            token_url: "https://sim.logonvalidation.net/token".to_string(),
            redirect_port: 8765,
            callback_timeout: Duration::from_secs(120),
            expiry_safety_margin: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            allow_interactive: true,
        }
    }
}

/// Shared token cache file and lock settings.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Token cache file. The lock file is its `.lock` sibling.
    pub cache_path: PathBuf,
    /// How long an in-process read of the cache file is reused.
    pub cache_ttl: Duration,
    /// Lock acquisition polling interval.
    pub lock_poll_interval: Duration,
    /// Give up acquiring the lock after this long.
    pub lock_timeout: Duration,
    /// Validity buffer applied when deciding whether a cached set is usable.
    pub validity_buffer: Duration,
}

impl CoordinatorSettings {
    /// Settings for a cache file at `path` with default timings.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: path.into(),
            ..Self::default()
        }
    }

    /// Path of the advisory lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.cache_path)
    }

    /// Override the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Override the lock polling interval.
    #[must_use]
    pub const fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Override the in-process memo TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Override the validity buffer.
    #[must_use]
    pub const fn with_validity_buffer(mut self, buffer: Duration) -> Self {
        self.validity_buffer = buffer;
        self
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from(".broker_tokens.json"),
            cache_ttl: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(30),
            validity_buffer: Duration::from_secs(60),
        }
    }
}

fn lock_path_for(cache_path: &Path) -> PathBuf {
    let mut name = cache_path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".lock");
    cache_path.with_file_name(name)
}

/// REST gateway settings.
#[derive(Debug, Clone)]
pub struct RestSettings {
    /// OpenAPI base URL (no trailing slash).
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl RestSettings {
    /// Defaults for the given environment.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        let base_url = if environment.is_live() {
            "https://gateway.saxobank.com/openapi"
        } else {
            "https://gateway.saxobank.com/sim/openapi"
        };
        Self {
            base_url: base_url.to_string(),
            ..Self::default()
        }
    }

    /// Override the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            base_url: "https://gateway.saxobank.com/sim/openapi".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// WebSocket streaming settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Streaming connect URL (without the `contextId` query).
    pub url: String,
    /// Ping interval.
    pub ping_interval: Duration,
    /// Pong wait before the connection is considered dead.
    pub pong_timeout: Duration,
    /// Heartbeat age above which the stream is unhealthy.
    pub heartbeat_stale_after: Duration,
    /// Field groups requested for every subscription.
    pub field_groups: Vec<String>,
    /// Wait for the reader task to finish on stop.
    pub shutdown_timeout: Duration,
}

impl StreamSettings {
    /// Defaults for the given environment.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        let url = if environment.is_live() {
            "wss://streaming.saxobank.com/openapi/streamingws/connect"
        } else {
            "wss://streaming.saxobank.com/sim/openapi/streamingws/connect"
        };
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    /// Override the connect URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Override the requested field groups.
    #[must_use]
    pub fn with_field_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Override the heartbeat staleness threshold.
    #[must_use]
    pub const fn with_heartbeat_stale_after(mut self, threshold: Duration) -> Self {
        self.heartbeat_stale_after = threshold;
        self
    }

    /// Override the ping cadence.
    #[must_use]
    pub const fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.pong_timeout = timeout;
        self
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://streaming.saxobank.com/sim/openapi/streamingws/connect".to_string(),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
            heartbeat_stale_after: Duration::from_secs(60),
            field_groups: vec!["Quote".to_string()],
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker environment.
    pub environment: Environment,
    /// Application and account credentials.
    pub credentials: Credentials,
    /// OAuth settings.
    pub oauth: OAuthSettings,
    /// Token cache coordination settings.
    pub coordinator: CoordinatorSettings,
    /// REST gateway settings.
    pub rest: RestSettings,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// 429 backoff policy.
    pub rate_limit: RateLimitPolicy,
    /// Streaming settings.
    pub stream: StreamSettings,
}

impl SessionConfig {
    /// Configuration with default settings for the given credentials.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        let environment = Environment::default();
        Self {
            environment,
            credentials,
            oauth: OAuthSettings::for_environment(environment),
            coordinator: CoordinatorSettings::default(),
            rest: RestSettings::for_environment(environment),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitPolicy::default(),
            stream: StreamSettings::for_environment(environment),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_key = required(&lookup, "BROKER_APP_KEY")?;
        let app_secret = required(&lookup, "BROKER_APP_SECRET")?;
        let account_key = required(&lookup, "BROKER_ACCOUNT_KEY")?;

        let environment = lookup("BROKER_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let oauth_defaults = OAuthSettings::for_environment(environment);
        let oauth = OAuthSettings {
            auth_url: lookup("BROKER_AUTH_URL").unwrap_or(oauth_defaults.auth_url),
            token_url: lookup("BROKER_TOKEN_URL").unwrap_or(oauth_defaults.token_url),
            redirect_port: parse_or(&lookup, "BROKER_REDIRECT_PORT", oauth_defaults.redirect_port),
            allow_interactive: parse_or(
                &lookup,
                "BROKER_ALLOW_INTERACTIVE",
                oauth_defaults.allow_interactive,
            ),
            ..oauth_defaults
        };

        let coordinator = CoordinatorSettings {
            cache_path: lookup("BROKER_TOKEN_CACHE_PATH")
                .map_or_else(|| CoordinatorSettings::default().cache_path, PathBuf::from),
            ..CoordinatorSettings::default()
        };

        let rest_defaults = RestSettings::for_environment(environment);
        let rest = RestSettings {
            request_timeout: duration_secs_or(
                &lookup,
                "BROKER_REQUEST_TIMEOUT_SECS",
                rest_defaults.request_timeout,
            ),
            ..rest_defaults
        };
        let rest = match lookup("BROKER_REST_URL") {
            Some(url) => rest.with_base_url(url),
            None => rest,
        };

        let circuit_breaker = CircuitBreakerConfig {
            max_consecutive_errors: parse_or(
                &lookup,
                "BROKER_CIRCUIT_MAX_ERRORS",
                CircuitBreakerConfig::default().max_consecutive_errors,
            ),
            cooldown: duration_secs_or(
                &lookup,
                "BROKER_CIRCUIT_COOLDOWN_SECS",
                CircuitBreakerConfig::default().cooldown,
            ),
        };

        let rate_limit = RateLimitPolicy {
            max_retries: parse_or(
                &lookup,
                "BROKER_RATE_LIMIT_MAX_RETRIES",
                RateLimitPolicy::default().max_retries,
            ),
            ..RateLimitPolicy::default()
        };

        let stream_defaults = StreamSettings::for_environment(environment);
        let stream = StreamSettings {
            url: lookup("BROKER_STREAM_URL").unwrap_or(stream_defaults.url),
            heartbeat_stale_after: duration_secs_or(
                &lookup,
                "BROKER_HEARTBEAT_STALE_SECS",
                stream_defaults.heartbeat_stale_after,
            ),
            ..stream_defaults
        };

        Ok(Self {
            environment,
            credentials: Credentials::new(app_key, app_secret, account_key),
            oauth,
            coordinator,
            rest,
            circuit_breaker,
            rate_limit,
            stream,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn duration_secs_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

/// Parse a comma-separated list of instrument ids, skipping blanks.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] on the first entry that is not a
/// positive integer.
pub fn parse_uic_list(key: &str, raw: &str) -> Result<Vec<u64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: s.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("BROKER_APP_KEY", "key"),
        ("BROKER_APP_SECRET", "secret"),
        ("BROKER_ACCOUNT_KEY", "account"),
    ];

    #[test]
    fn missing_required_variable_is_reported() {
        let err = SessionConfig::from_lookup(lookup_from(&REQUIRED[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "BROKER_ACCOUNT_KEY"));
    }

    #[test]
    fn empty_required_variable_is_reported() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("BROKER_APP_KEY", "  ");
        let err = SessionConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(ref k) if k == "BROKER_APP_KEY"));
    }

    #[test]
    fn defaults_apply_when_optional_values_absent() {
        let config = SessionConfig::from_lookup(lookup_from(&REQUIRED)).unwrap();

        assert_eq!(config.environment, Environment::Simulation);
        assert_eq!(config.oauth.redirect_port, 8765);
        assert_eq!(config.oauth.redirect_uri(), "http://localhost:8765/callback");
        assert_eq!(config.coordinator.cache_path, PathBuf::from(".broker_tokens.json"));
        assert_eq!(config.coordinator.lock_path(), PathBuf::from(".broker_tokens.json.lock"));
        assert_eq!(config.circuit_breaker.max_consecutive_errors, 5);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(900));
        assert_eq!(config.rate_limit.max_retries, 5);
        assert_eq!(config.rest.request_timeout, Duration::from_secs(30));
        assert_eq!(config.stream.heartbeat_stale_after, Duration::from_secs(60));
        assert_eq!(config.stream.field_groups, vec!["Quote".to_string()]);
        assert_eq!(config.credentials.account_key(), "account");
    }

    #[test]
    fn overrides_are_applied() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("BROKER_ENV", "live"),
            ("BROKER_REST_URL", "http://127.0.0.1:9000/"),
            ("BROKER_REDIRECT_PORT", "9999"),
            ("BROKER_TOKEN_CACHE_PATH", "/tmp/tokens.json"),
            ("BROKER_CIRCUIT_MAX_ERRORS", "8"),
            ("BROKER_CIRCUIT_COOLDOWN_SECS", "60"),
            ("BROKER_RATE_LIMIT_MAX_RETRIES", "2"),
            ("BROKER_HEARTBEAT_STALE_SECS", "30"),
        ]);
        let config = SessionConfig::from_lookup(lookup_from(&pairs)).unwrap();

        assert!(config.environment.is_live());
        assert_eq!(config.rest.base_url, "http://127.0.0.1:9000");
        assert!(config.oauth.token_url.starts_with("https://live."));
        assert_eq!(config.oauth.redirect_port, 9999);
        assert_eq!(config.coordinator.lock_path(), PathBuf::from("/tmp/tokens.json.lock"));
        assert_eq!(config.circuit_breaker.max_consecutive_errors, 8);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_retries, 2);
        assert_eq!(config.stream.heartbeat_stale_after, Duration::from_secs(30));
        assert!(config.stream.url.contains("/openapi/streamingws"));
    }

    #[test]
    fn unparsable_optional_values_fall_back_to_defaults() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("BROKER_REDIRECT_PORT", "not-a-port"));
        let config = SessionConfig::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.oauth.redirect_port, 8765);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("k-123".into(), "s-456".into(), "a-789".into());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("k-123"));
        assert!(!debug.contains("s-456"));
        assert!(!debug.contains("a-789"));
    }

    #[test]
    fn uic_list_parsing() {
        assert_eq!(parse_uic_list("X", "36590, 211,,").unwrap(), vec![36590, 211]);
        assert!(parse_uic_list("X", "12,abc").is_err());
        assert!(parse_uic_list("X", "").unwrap().is_empty());
    }
}
