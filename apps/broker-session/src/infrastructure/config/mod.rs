//! Configuration Module
//!
//! Configuration loading and dependency wiring for the broker session.

mod container;
mod settings;

pub use container::{BrokerSession, SessionError};
pub use settings::{
    ConfigError, CoordinatorSettings, Credentials, Environment, OAuthSettings, RestSettings,
    SessionConfig, StreamSettings, parse_uic_list,
};
