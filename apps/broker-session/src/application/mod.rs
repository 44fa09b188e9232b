//! Application Layer
//!
//! Ports through which the session reaches external collaborators.

pub mod ports;

pub use ports::*;
