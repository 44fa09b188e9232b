//! Session Container
//!
//! Builds one coordinator, authenticator, executor, price cache, and
//! streaming client from a [`SessionConfig`] and wires them together. There
//! is no global state: every process constructs its own session.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::settings::SessionConfig;
use crate::application::ports::{
    BrowserPort, NoOpTokenStore, SystemBrowser, TokenProviderPort, TokenStorePort,
};
use crate::domain::{PriceCache, PriceSnapshot};
use crate::infrastructure::auth::{AuthError, Authenticator, TokenCoordinator};
use crate::infrastructure::rest::{ApiError, ApiRequest, RequestExecutor};
use crate::infrastructure::streaming::{Instrument, PriceCallback, StreamError, StreamingClient};

/// Errors building a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Authenticator could not be built.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Request executor could not be built.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A fully wired broker session.
#[derive(Debug)]
pub struct BrokerSession {
    config: SessionConfig,
    coordinator: Arc<TokenCoordinator>,
    authenticator: Arc<Authenticator>,
    executor: Arc<RequestExecutor>,
    cache: Arc<PriceCache>,
    streaming: StreamingClient,
}

impl BrokerSession {
    /// Session with no durable token store that opens the system browser for
    /// interactive authorization.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_ports(config, Arc::new(NoOpTokenStore), Arc::new(SystemBrowser))
    }

    /// Session with explicit adapters.
    pub fn with_ports(
        config: SessionConfig,
        store: Arc<dyn TokenStorePort>,
        browser: Arc<dyn BrowserPort>,
    ) -> Result<Self, SessionError> {
        let coordinator = Arc::new(TokenCoordinator::new(config.coordinator.clone()));
        let authenticator = Arc::new(Authenticator::new(
            config.credentials.clone(),
            config.oauth.clone(),
            Arc::clone(&coordinator),
            store,
            browser,
        )?);
        let auth: Arc<dyn TokenProviderPort> = authenticator.clone();

        let cache = Arc::new(PriceCache::new());
        let executor = Arc::new(RequestExecutor::new(
            &config.rest,
            config.circuit_breaker.clone(),
            config.rate_limit.clone(),
            Arc::clone(&auth),
            Arc::clone(&cache),
        )?);
        let streaming = StreamingClient::new(
            config.stream.clone(),
            config.credentials.account_key(),
            auth,
            Arc::clone(&executor),
            Arc::clone(&cache),
        );

        tracing::debug!(
            environment = config.environment.as_str(),
            rest = %config.rest.base_url,
            cache_path = %config.coordinator.cache_path.display(),
            "Broker session wired"
        );

        Ok(Self {
            config,
            coordinator,
            authenticator,
            executor,
            cache,
            streaming,
        })
    }

    /// Ensure a valid token. See [`Authenticator::try_authenticate`].
    pub async fn authenticate(&self, force_refresh: bool) -> bool {
        self.authenticator.authenticate(force_refresh).await
    }

    /// Execute a REST request.
    pub async fn request(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        self.executor.execute(request).await
    }

    /// Cached or freshly fetched price.
    pub async fn get_quote(
        &self,
        uic: u64,
        asset_type: &str,
        max_age: Duration,
    ) -> Result<PriceSnapshot, ApiError> {
        self.executor.get_quote(uic, asset_type, max_age).await
    }

    /// Start streaming `instruments`.
    pub async fn subscribe(
        &self,
        instruments: &[Instrument],
        callback: PriceCallback,
    ) -> Result<(), StreamError> {
        self.streaming.start(instruments, callback).await
    }

    /// Streaming health.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.streaming.is_healthy()
    }

    /// Stop streaming.
    pub async fn stop(&self) {
        self.streaming.stop().await;
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared token coordinator.
    #[must_use]
    pub fn coordinator(&self) -> Arc<TokenCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Authenticator.
    #[must_use]
    pub fn authenticator(&self) -> Arc<Authenticator> {
        Arc::clone(&self.authenticator)
    }

    /// Request executor.
    #[must_use]
    pub fn executor(&self) -> Arc<RequestExecutor> {
        Arc::clone(&self.executor)
    }

    /// Price cache.
    #[must_use]
    pub fn cache(&self) -> Arc<PriceCache> {
        Arc::clone(&self.cache)
    }

    /// Streaming client.
    #[must_use]
    pub const fn streaming(&self) -> &StreamingClient {
        &self.streaming
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::application::ports::HeadlessBrowser;
    use crate::domain::TokenSet;

    fn config(server: &MockServer, dir: &TempDir) -> SessionConfig {
        let vars: HashMap<&str, String> = HashMap::from([
            ("BROKER_APP_KEY", "key".to_string()),
            ("BROKER_APP_SECRET", "secret".to_string()),
            ("BROKER_ACCOUNT_KEY", "acct".to_string()),
            ("BROKER_REST_URL", server.uri()),
            ("BROKER_TOKEN_URL", format!("{}/token", server.uri())),
            ("BROKER_ALLOW_INTERACTIVE", "false".to_string()),
            (
                "BROKER_TOKEN_CACHE_PATH",
                dir.path().join("tokens.json").display().to_string(),
            ),
        ]);
        SessionConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn request_uses_token_from_shared_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/port/v1/users/me"))
            .and(header("authorization", "Bearer cached-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"UserId": "u1"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let session = BrokerSession::with_ports(
            config(&server, &dir),
            Arc::new(NoOpTokenStore),
            Arc::new(HeadlessBrowser),
        )
        .unwrap();
        session
            .coordinator()
            .update_cache(&TokenSet {
                access_token: "cached-token".to_string(),
                refresh_token: "r".to_string(),
                expiry: Utc::now() + TimeDelta::minutes(20),
                app_key: "key".to_string(),
                app_secret: "secret".to_string(),
            })
            .await
            .unwrap();

        let body = session
            .request(&ApiRequest::get("/port/v1/users/me"))
            .await
            .unwrap();

        assert_eq!(body, json!({"UserId": "u1"}));
        assert!(session.authenticator().is_authenticated());
    }

    #[tokio::test]
    async fn request_fails_without_any_token() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let session = BrokerSession::with_ports(
            config(&server, &dir),
            Arc::new(NoOpTokenStore),
            Arc::new(HeadlessBrowser),
        )
        .unwrap();

        let err = session
            .request(&ApiRequest::get("/anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AuthenticationFailed));
        assert!(!session.authenticate(false).await);
    }

    #[tokio::test]
    async fn stop_on_idle_session_is_safe() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let session = BrokerSession::new(config(&server, &dir)).unwrap();

        session.stop().await;
        assert!(!session.is_healthy());
        assert!(session.cache().is_empty());
        assert_eq!(session.config().credentials.account_key(), "acct");
    }
}
