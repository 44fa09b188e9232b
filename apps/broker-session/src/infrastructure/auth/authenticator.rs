//! OAuth2 authenticator.
//!
//! Keeps a valid access token for this process. Token sets come, in order of
//! preference, from memory, the shared cache file, a refresh grant run under
//! the cross-process lock, and finally the interactive authorization-code
//! flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use rand::distr::Alphanumeric;
use reqwest::Client;
use serde::Deserialize;

use super::callback::CallbackListener;
use super::coordinator::TokenCoordinator;
use super::error::{AuthError, TokenError};
use crate::application::ports::{BrowserPort, TokenProviderPort, TokenStorePort};
use crate::domain::TokenSet;
use crate::infrastructure::config::{Credentials, OAuthSettings};
use crate::infrastructure::rest::{MAX_ERROR_BODY, truncate};

const STATE_LEN: usize = 32;

/// Token endpoint grant.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

/// Obtains and renews bearer tokens for one set of application credentials.
pub struct Authenticator {
    credentials: Credentials,
    settings: OAuthSettings,
    coordinator: Arc<TokenCoordinator>,
    store: Arc<dyn TokenStorePort>,
    browser: Arc<dyn BrowserPort>,
    client: Client,
    tokens: RwLock<Option<TokenSet>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("credentials", &self.credentials)
            .field("token_url", &self.settings.token_url)
            .field("tokens", &*self.tokens.read())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Create an authenticator. Nothing is loaded until the first
    /// [`Authenticator::try_authenticate`].
    pub fn new(
        credentials: Credentials,
        settings: OAuthSettings,
        coordinator: Arc<TokenCoordinator>,
        store: Arc<dyn TokenStorePort>,
        browser: Arc<dyn BrowserPort>,
    ) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            credentials,
            settings,
            coordinator,
            store,
            browser,
            client,
            tokens: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Current token set, valid or not.
    #[must_use]
    pub fn current_tokens(&self) -> Option<TokenSet> {
        self.tokens.read().clone()
    }

    /// Whether the held access token is valid with the configured buffer.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.tokens
            .read()
            .as_ref()
            .is_some_and(|t| t.is_valid(self.validity_buffer()))
    }

    /// Shared coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<TokenCoordinator> {
        &self.coordinator
    }

    /// Ensure a valid access token is held.
    ///
    /// With `force_refresh` the token held on entry is treated as rejected
    /// by the server: it is replaced even if its expiry says otherwise,
    /// unless another task or process has already replaced it.
    pub async fn try_authenticate(&self, force_refresh: bool) -> Result<(), AuthError> {
        let superseded = if force_refresh {
            self.tokens.read().as_ref().map(|t| t.access_token.clone())
        } else {
            None
        };

        self.seed().await;
        self.adopt_cached();
        if self.holds_usable_token(superseded.as_deref()) {
            return Ok(());
        }

        let _gate = self.refresh_gate.lock().await;
        self.adopt_cached();
        if self.holds_usable_token(superseded.as_deref()) {
            tracing::debug!("Tokens replaced while waiting for refresh gate");
            return Ok(());
        }

        let current = self.current_tokens().filter(TokenSet::has_refresh_token);
        if let Some(current) = current {
            match self.refresh(current, superseded.as_deref()).await {
                Ok(tokens) => {
                    self.set_tokens(tokens);
                    return Ok(());
                }
                Err(TokenError::Rejected { status, body }) if self.settings.allow_interactive => {
                    tracing::warn!(
                        status,
                        body = %body,
                        "Refresh token rejected, falling back to interactive authorization"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let tokens = self.authorize_interactively().await?;
        self.set_tokens(tokens);
        Ok(())
    }

    fn validity_buffer(&self) -> Duration {
        self.coordinator.settings().validity_buffer
    }

    fn holds_usable_token(&self, superseded: Option<&str>) -> bool {
        let buffer = self.validity_buffer();
        self.tokens
            .read()
            .as_ref()
            .is_some_and(|t| t.is_valid(buffer) && superseded != Some(t.access_token.as_str()))
    }

    fn set_tokens(&self, tokens: TokenSet) {
        *self.tokens.write() = Some(tokens);
    }

    /// First call only: start from the cache file (even if expired, for its
    /// refresh token), else from the durable store. Sets issued for another
    /// app key are skipped.
    async fn seed(&self) {
        if self.tokens.read().is_some() {
            return;
        }

        let cached = self.coordinator.get_cached_tokens();
        let seeded = match cached.filter(|t| self.is_own(t)) {
            Some(tokens) => Some(tokens),
            None => match self.store.load().await {
                Ok(tokens) => tokens.filter(|t| self.is_own(t)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load tokens from store");
                    None
                }
            },
        };

        if let Some(tokens) = seeded {
            let mut slot = self.tokens.write();
            if slot.is_none() {
                tracing::debug!(
                    expires_in_secs = tokens.remaining().as_secs(),
                    "Loaded persisted tokens"
                );
                *slot = Some(tokens);
            }
        }
    }

    /// Take the shared cache's token set when it is valid and newer.
    fn adopt_cached(&self) {
        let Some(cached) = self.coordinator.get_cached_tokens() else {
            return;
        };
        if !self.is_own(&cached) || !cached.is_valid(self.validity_buffer()) {
            return;
        }

        let mut slot = self.tokens.write();
        if slot.as_ref().is_none_or(|held| cached.is_newer_than(held)) {
            tracing::debug!("Adopted newer tokens from shared cache");
            *slot = Some(cached);
        }
    }

    fn is_own(&self, tokens: &TokenSet) -> bool {
        tokens.app_key == self.credentials.app_key()
    }

    async fn refresh(
        &self,
        own: TokenSet,
        superseded: Option<&str>,
    ) -> Result<TokenSet, TokenError> {
        let store = &self.store;
        self.coordinator
            .refresh_with_lock(
                self.credentials.app_key(),
                superseded,
                |cached| async move {
                    let base = match cached {
                        Some(c) if c.has_refresh_token() && c.is_newer_than(&own) => c,
                        _ => own,
                    };
                    self.refresh_grant(&base).await
                },
                |tokens| async move {
                    store
                        .persist(&tokens)
                        .await
                        .map_err(|e| TokenError::Refresh(e.to_string()))
                },
            )
            .await
    }

    async fn refresh_grant(&self, base: &TokenSet) -> Result<TokenSet, TokenError> {
        let redirect_uri = self.settings.redirect_uri();
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", base.refresh_token.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.credentials.app_key()),
            ("client_secret", self.credentials.app_secret()),
        ];

        match self.token_request(&form, Some(&base.refresh_token)).await {
            Ok(tokens) => Ok(tokens),
            Err(AuthError::Exchange { status, body }) if (400..500).contains(&status) => {
                Err(TokenError::Rejected { status, body })
            }
            Err(e) => Err(TokenError::Refresh(e.to_string())),
        }
    }

    async fn authorize_interactively(&self) -> Result<TokenSet, AuthError> {
        if !self.settings.allow_interactive {
            return Err(AuthError::InteractiveDisabled);
        }

        let listener = CallbackListener::bind(self.settings.redirect_port).await?;
        let redirect_uri = listener.redirect_uri();
        let state = random_state();

        let url = reqwest::Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("response_type", "code"),
                ("client_id", self.credentials.app_key()),
                ("state", state.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
            ],
        )
        .map_err(|e| AuthError::InvalidConfig(format!("auth_url: {e}")))?;

        tracing::info!(redirect_uri = %redirect_uri, "Starting interactive authorization");
        if let Err(e) = self.browser.open(url.as_str()) {
            tracing::warn!(error = %e, url = %url, "Open this URL to authorize the application");
        }

        let code = listener
            .wait_for_code(&state, self.settings.callback_timeout)
            .await?;

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.credentials.app_key()),
            ("client_secret", self.credentials.app_secret()),
        ];
        let tokens = self.token_request(&form, None).await?;

        if let Err(e) = self.coordinator.update_cache(&tokens).await {
            tracing::warn!(error = %e, "Failed to share authorized tokens through cache");
        }
        if let Err(e) = self.store.persist(&tokens).await {
            tracing::warn!(error = %e, "Failed to persist authorized tokens");
        }
        tracing::info!(
            expires_in_secs = tokens.remaining().as_secs(),
            "Interactive authorization complete"
        );
        Ok(tokens)
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        previous_refresh_token: Option<&str>,
    ) -> Result<TokenSet, AuthError> {
        let response = self
            .client
            .post(&self.settings.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let grant: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::Decode(e.to_string()))?;
        let refresh_token = grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh_token.map(str::to_string))
            .unwrap_or_default();

        Ok(TokenSet::issue(
            grant.access_token,
            refresh_token,
            Duration::from_secs(grant.expires_in),
            self.settings.expiry_safety_margin,
            self.credentials.app_key().to_string(),
            self.credentials.app_secret().to_string(),
        ))
    }
}

#[async_trait]
impl TokenProviderPort for Authenticator {
    async fn authenticate(&self, force_refresh: bool) -> bool {
        match self.try_authenticate(force_refresh).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, force_refresh, "Authentication failed");
                false
            }
        }
    }

    fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access_token.clone())
    }
}

fn random_state() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LEN)
        .map(char::from)
        .collect()
}
