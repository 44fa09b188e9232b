//! Broker REST Gateway
//!
//! Authenticated HTTP calls guarded by a consecutive-failure circuit breaker
//! and 429 backoff, plus the REST quote fallback.

mod api_types;
mod circuit_breaker;
mod error;
mod executor;
mod rate_limit;

pub use api_types::{ApiRequest, ErrorResponse};
pub(crate) use api_types::{MAX_ERROR_BODY, truncate};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerState,
};
pub use error::ApiError;
pub use executor::{INFO_PRICES_PATH, RequestExecutor, ResponseClass, classify_status};
pub use rate_limit::{
    RateLimitDecision, RateLimitPolicy, RateLimitState, RateLimiter, RetryAfterExtractor,
};
