//! Infrastructure Layer
//!
//! Adapters that talk to the broker and the local machine:
//!
//! - **Authentication**: OAuth token exchange, the shared token cache file,
//!   and the local redirect listener
//! - **REST**: request execution with circuit breaking and 429 backoff
//! - **Streaming**: binary-framed WebSocket prices
//! - **Cross-cutting**: configuration, metrics, telemetry

/// OAuth authentication and cross-process token coordination.
pub mod auth;

/// Environment configuration and session wiring.
pub mod config;

/// Metric names and recording helpers.
pub mod metrics;

/// REST request executor.
pub mod rest;

/// WebSocket price streaming.
pub mod streaming;

/// Tracing subscriber setup.
pub mod telemetry;
