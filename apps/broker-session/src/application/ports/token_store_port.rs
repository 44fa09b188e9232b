//! Token Store Port (Driven Port)
//!
//! Durable storage shared by every bot instance (a database row, a secrets
//! manager entry, ...). The local cache file is the fast path; the store is
//! where a freshly issued token set is pushed so that hosts without the
//! cache file can pick it up.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::TokenSet;

/// Token store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenStoreError {
    /// Backend unreachable.
    #[error("Token store unavailable: {message}")]
    Unavailable {
        /// Backend error text.
        message: String,
    },

    /// Stored document could not be decoded.
    #[error("Token store data corrupt: {message}")]
    Corrupt {
        /// Decoder error text.
        message: String,
    },
}

/// Port for durable token storage.
#[async_trait]
pub trait TokenStorePort: Send + Sync {
    /// Load the most recently persisted token set, if any.
    async fn load(&self) -> Result<Option<TokenSet>, TokenStoreError>;

    /// Persist a freshly issued token set.
    async fn persist(&self, tokens: &TokenSet) -> Result<(), TokenStoreError>;
}

/// Store that keeps nothing. Used when the local cache file is the only
/// shared state.
#[derive(Debug, Clone, Default)]
pub struct NoOpTokenStore;

#[async_trait]
impl TokenStorePort for NoOpTokenStore {
    async fn load(&self) -> Result<Option<TokenSet>, TokenStoreError> {
        Ok(None)
    }

    async fn persist(&self, _tokens: &TokenSet) -> Result<(), TokenStoreError> {
        Ok(())
    }
}

/// In-memory store for tests and single-host setups.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<Option<TokenSet>>,
    persist_count: Mutex<usize>,
}

impl InMemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with `tokens`.
    #[must_use]
    pub fn with_tokens(tokens: TokenSet) -> Self {
        Self {
            tokens: Mutex::new(Some(tokens)),
            persist_count: Mutex::new(0),
        }
    }

    /// Number of `persist` calls so far.
    #[must_use]
    pub fn persist_count(&self) -> usize {
        *self.persist_count.lock()
    }
}

#[async_trait]
impl TokenStorePort for InMemoryTokenStore {
    async fn load(&self) -> Result<Option<TokenSet>, TokenStoreError> {
        Ok(self.tokens.lock().clone())
    }

    async fn persist(&self, tokens: &TokenSet) -> Result<(), TokenStoreError> {
        *self.tokens.lock() = Some(tokens.clone());
        *self.persist_count.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};

    use super::*;

    fn sample_tokens() -> TokenSet {
        TokenSet {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expiry: Utc::now() + TimeDelta::minutes(20),
            app_key: "key".to_string(),
            app_secret: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn no_op_store_loads_nothing() {
        let store = NoOpTokenStore;
        assert!(store.persist(&sample_tokens()).await.is_ok());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_latest() {
        let store = InMemoryTokenStore::new();
        assert!(store.load().await.unwrap().is_none());

        let tokens = sample_tokens();
        store.persist(&tokens).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(tokens));
        assert_eq!(store.persist_count(), 1);
    }
}
