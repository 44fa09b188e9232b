//! Domain Layer
//!
//! Pure types with no I/O: OAuth token sets, typed price snapshots, and the
//! staleness-aware price cache.

pub mod price_cache;
pub mod quote;
pub mod token;

pub use price_cache::PriceCache;
pub use quote::{Greeks, PriceInfo, PriceSnapshot, Quote};
pub use token::TokenSet;
