//! Application Ports (Driven)
//!
//! Interfaces the session uses to reach systems it does not own: the
//! durable token store shared between hosts, the user's browser, and the
//! bearer-token source the REST and streaming layers call through.

mod browser_port;
mod token_provider_port;
mod token_store_port;

pub use browser_port::{BrowserError, BrowserPort, HeadlessBrowser, SystemBrowser};
pub use token_provider_port::{StaticTokenProvider, TokenProviderPort};
pub use token_store_port::{InMemoryTokenStore, NoOpTokenStore, TokenStoreError, TokenStorePort};
