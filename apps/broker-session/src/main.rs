//! Broker Session Smoke Binary
//!
//! Authenticates against the broker, optionally streams a watch list of
//! instruments, and logs stream health until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin broker-session
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BROKER_APP_KEY`: OAuth client id
//! - `BROKER_APP_SECRET`: OAuth client secret
//! - `BROKER_ACCOUNT_KEY`: Account used for price subscriptions
//!
//! ## Optional
//! - `BROKER_ENV`: SIM | LIVE (default: SIM)
//! - `BROKER_TOKEN_CACHE_PATH`: Shared token cache (default: .broker_tokens.json)
//! - `BROKER_WATCH_UICS`: Comma-separated instrument ids to stream
//! - `BROKER_WATCH_ASSET_TYPE`: Asset type of the watch list (default: Stock)
//! - `BROKER_LOG_JSON`: Emit JSON log lines (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use broker_session::infrastructure::config::parse_uic_list;
use broker_session::infrastructure::telemetry;
use broker_session::{BrokerSession, Instrument, PriceCallback, SessionConfig};
use tokio::signal;

/// Interval between health log lines.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Ignored if another provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init();
    broker_session::infrastructure::metrics::describe_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting broker session");

    let config = SessionConfig::from_env().context("loading configuration")?;
    log_config(&config);

    let instruments = watch_list()?;
    let session = BrokerSession::new(config).context("building session")?;

    if !session.authenticate(false).await {
        anyhow::bail!("authentication failed");
    }
    tracing::info!("Authenticated");

    if instruments.is_empty() {
        tracing::info!("BROKER_WATCH_UICS not set, nothing to stream");
        return Ok(());
    }

    let on_price: PriceCallback = Arc::new(|uic, snapshot| {
        tracing::info!(
            uic,
            bid = ?snapshot.bid(),
            ask = ?snapshot.ask(),
            "Price update"
        );
    });
    session
        .subscribe(&instruments, on_price)
        .await
        .context("starting price stream")?;

    let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
    health_tick.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = health_tick.tick() => {
                let health = session.streaming().health();
                let healthy = session.is_healthy();
                tracing::info!(
                    healthy,
                    state = %health.state,
                    messages = health.messages,
                    heartbeats = health.heartbeats,
                    frames_dropped = health.frames_dropped,
                    subscriptions = health.subscriptions,
                    circuit = ?session.executor().circuit_status().state,
                    "Stream health"
                );
                if !healthy {
                    tracing::warn!("Stream unhealthy, restarting");
                    if let Err(e) = session.streaming().restart().await {
                        tracing::error!(error = %e, "Stream restart failed");
                    }
                }
            }
        }
    }

    session.stop().await;
    tracing::info!("Broker session stopped");
    Ok(())
}

/// Instruments named by `BROKER_WATCH_UICS`.
fn watch_list() -> anyhow::Result<Vec<Instrument>> {
    let Ok(raw) = std::env::var("BROKER_WATCH_UICS") else {
        return Ok(Vec::new());
    };
    let asset_type =
        std::env::var("BROKER_WATCH_ASSET_TYPE").unwrap_or_else(|_| "Stock".to_string());
    let uics = parse_uic_list("BROKER_WATCH_UICS", &raw)?;
    Ok(uics
        .into_iter()
        .map(|uic| Instrument::new(uic, asset_type.clone()))
        .collect())
}

/// Log the parsed configuration.
fn log_config(config: &SessionConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        rest = %config.rest.base_url,
        stream = %config.stream.url,
        cache_path = %config.coordinator.cache_path.display(),
        interactive = config.oauth.allow_interactive,
        "Configuration loaded"
    );
    tracing::debug!(
        max_errors = config.circuit_breaker.max_consecutive_errors,
        cooldown_secs = config.circuit_breaker.cooldown.as_secs(),
        rate_limit_retries = config.rate_limit.max_retries,
        "Resilience settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}
