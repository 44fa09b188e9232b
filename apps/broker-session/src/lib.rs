// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::items_after_statements,
        clippy::needless_pass_by_value
    )
)]

//! Broker Session - Resilient Brokerage API Client Core
//!
//! Keeps a trading bot connected to a brokerage OpenAPI: OAuth2 tokens are
//! refreshed once across every bot process sharing a cache file, REST calls
//! go through a circuit breaker with 429 backoff, and prices stream over a
//! binary-framed WebSocket into a staleness-aware cache.
//!
//! # Architecture
//!
//! - **Domain**: token sets, price snapshots, the price cache
//! - **Application**: ports for the token store, browser, and token provider
//! - **Infrastructure**
//!   - `auth`: `TokenCoordinator`, `Authenticator`, the OAuth redirect listener
//!   - `rest`: `RequestExecutor`, `CircuitBreaker`, `RateLimiter`
//!   - `streaming`: `StreamingClient`, frame decoder, heartbeat monitoring
//!   - `config`: `SessionConfig` and the `BrokerSession` container
//!
//! # Example
//!
//! ```no_run
//! use broker_session::{BrokerSession, SessionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = BrokerSession::new(SessionConfig::from_env()?)?;
//! if session.authenticate(false).await {
//!     let me = session.request(&broker_session::ApiRequest::get("/port/v1/users/me")).await?;
//!     println!("{me}");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Layers
// =============================================================================

/// Domain layer - Tokens and prices.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Broker and local-machine adapters.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain re-exports
pub use domain::{Greeks, PriceCache, PriceInfo, PriceSnapshot, Quote, TokenSet};

// Application re-exports
pub use application::ports::{
    BrowserPort, HeadlessBrowser, InMemoryTokenStore, NoOpTokenStore, StaticTokenProvider,
    SystemBrowser, TokenProviderPort, TokenStoreError, TokenStorePort,
};

// Infrastructure re-exports
pub use infrastructure::auth::{AuthError, Authenticator, TokenCoordinator, TokenError};
pub use infrastructure::config::{
    BrokerSession, ConfigError, CoordinatorSettings, Credentials, Environment, OAuthSettings,
    RestSettings, SessionConfig, SessionError, StreamSettings,
};
pub use infrastructure::rest::{
    ApiError, ApiRequest, CircuitBreakerConfig, CircuitBreakerState, RateLimitPolicy,
    RequestExecutor,
};
pub use infrastructure::streaming::{
    Instrument, PriceCallback, StreamError, StreamHealth, StreamState, StreamingClient,
};
