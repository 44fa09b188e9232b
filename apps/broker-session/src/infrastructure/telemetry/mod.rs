//! Tracing Initialization
//!
//! Installs a `tracing-subscriber` registry with an env filter and a fmt
//! layer. Library code only emits events; the binary (or the embedding bot)
//! decides whether to call [`init`].
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: extra filter directives, merged with the defaults
//! - `BROKER_LOG_JSON`: set to "true" for JSON output (default: false)
//!
//! # Usage
//!
//! ```ignore
//! use broker_session::infrastructure::telemetry;
//!
//! let _guard = telemetry::init();
//! tracing::info!("session starting");
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default directive for this crate.
const DEFAULT_DIRECTIVE: &str = "broker_session=info";

/// Keeps telemetry alive for the lifetime of the program.
#[derive(Debug)]
pub struct TelemetryGuard {
    _private: (),
}

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Directives applied on top of `RUST_LOG`.
    pub directives: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            directives: vec![
                DEFAULT_DIRECTIVE.to_string(),
                "hyper=warn".to_string(),
                "reqwest=warn".to_string(),
                "tungstenite=warn".to_string(),
            ],
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let json = std::env::var("BROKER_LOG_JSON")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            json,
            ..Self::default()
        }
    }

    /// Build the env filter: `RUST_LOG` plus the configured directives.
    /// Invalid directives are skipped.
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        self.directives
            .iter()
            .filter_map(|d| d.parse::<Directive>().ok())
            .fold(EnvFilter::from_default_env(), EnvFilter::add_directive)
    }
}

/// Initialize telemetry with default configuration from environment.
///
/// Returns a guard that must be kept alive for the duration of the program.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(&TelemetryConfig::from_env())
}

/// Initialize telemetry with custom configuration.
///
/// A second call (or a subscriber installed elsewhere) is ignored.
#[must_use]
pub fn init_with_config(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = config.env_filter();

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }

    TelemetryGuard { _private: () }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert!(!config.json);
        assert_eq!(config.directives[0], DEFAULT_DIRECTIVE);
    }

    #[test]
    fn invalid_directives_are_skipped() {
        let config = TelemetryConfig {
            json: false,
            directives: vec!["broker_session=debug".to_string(), "==nonsense==".to_string()],
        };
        let filter = config.env_filter();
        assert!(filter.to_string().contains("broker_session=debug"));
    }

    #[test]
    fn init_twice_does_not_panic() {
        let _first = init_with_config(&TelemetryConfig::default());
        let _second = init_with_config(&TelemetryConfig::default());
    }
}
