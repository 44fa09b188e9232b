//! Token Provider Port (Driven Port)
//!
//! What the REST executor and streaming client need from authentication:
//! make sure a valid access token exists, and hand it out.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Port for obtaining bearer tokens.
#[async_trait]
pub trait TokenProviderPort: Send + Sync {
    /// Ensure a valid access token is held, refreshing when needed or when
    /// `force_refresh` is set. Returns false if no valid token could be
    /// obtained.
    async fn authenticate(&self, force_refresh: bool) -> bool;

    /// The current access token, if any.
    fn access_token(&self) -> Option<String>;
}

/// Provider that hands out fixed tokens. Each forced refresh advances to the
/// next token in the list and stays on the last one.
#[derive(Debug)]
pub struct StaticTokenProvider {
    tokens: Vec<String>,
    current: Mutex<usize>,
    forced_refreshes: AtomicUsize,
    fail: bool,
}

impl StaticTokenProvider {
    /// Provider that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::sequence([token.into()])
    }

    /// Provider rotating through `tokens` on forced refresh.
    #[must_use]
    pub fn sequence<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            current: Mutex::new(0),
            forced_refreshes: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// Provider whose authentication always fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::sequence(Vec::<String>::new())
        }
    }

    /// Number of `authenticate(true)` calls so far.
    #[must_use]
    pub fn forced_refreshes(&self) -> usize {
        self.forced_refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProviderPort for StaticTokenProvider {
    async fn authenticate(&self, force_refresh: bool) -> bool {
        if self.fail || self.tokens.is_empty() {
            return false;
        }
        if force_refresh {
            self.forced_refreshes.fetch_add(1, Ordering::SeqCst);
            let mut current = self.current.lock();
            *current = (*current + 1).min(self.tokens.len() - 1);
        }
        true
    }

    fn access_token(&self) -> Option<String> {
        self.tokens.get(*self.current.lock()).cloned()
    }
}
