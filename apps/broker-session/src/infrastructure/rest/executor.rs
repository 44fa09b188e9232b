//! Authenticated request executor.
//!
//! Every broker REST call goes through [`RequestExecutor::execute`]:
//!
//! 1. Circuit open → fail fast, no network I/O.
//! 2. Wait out any active 429 backoff window.
//! 3. Ensure a valid bearer token.
//! 4. Send with the configured timeout.
//! 5. 2xx → success; 429 → back off and resend; 401 → force one token
//!    refresh and resend once; anything else → failure.
//!
//! Failures feed the circuit breaker; successes reset it and the 429 counter.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::api_types::{ApiRequest, ErrorResponse, MAX_ERROR_BODY, truncate};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use super::error::ApiError;
use super::rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimitState, RateLimiter, RetryAfterExtractor};
use crate::application::ports::TokenProviderPort;
use crate::domain::{PriceCache, PriceSnapshot};
use crate::infrastructure::config::RestSettings;
use crate::infrastructure::metrics;

/// Info-price endpoint used for the REST quote fallback.
pub const INFO_PRICES_PATH: &str = "/trade/v1/infoprices";

/// Field groups requested by the REST quote fallback.
const QUOTE_FIELD_GROUPS: &str = "Quote,PriceInfo,Greeks";

/// How a response status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 200/201/202/204.
    Success,
    /// 429.
    RateLimited,
    /// 401.
    Unauthorized,
    /// Anything else.
    Failure,
}

/// Classify an HTTP status code.
#[must_use]
pub const fn classify_status(status: StatusCode) -> ResponseClass {
    match status.as_u16() {
        200 | 201 | 202 | 204 => ResponseClass::Success,
        429 => ResponseClass::RateLimited,
        401 => ResponseClass::Unauthorized,
        _ => ResponseClass::Failure,
    }
}

/// Broker REST client with circuit breaking and 429/401 handling.
pub struct RequestExecutor {
    client: Client,
    base_url: String,
    auth: Arc<dyn TokenProviderPort>,
    breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
    cache: Arc<PriceCache>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("base_url", &self.base_url)
            .field("breaker", &self.breaker)
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Create an executor.
    pub fn new(
        settings: &RestSettings,
        breaker_config: CircuitBreakerConfig,
        rate_limit: RateLimitPolicy,
        auth: Arc<dyn TokenProviderPort>,
        cache: Arc<PriceCache>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth,
            breaker: CircuitBreaker::new("broker-rest", breaker_config),
            rate_limiter: RateLimiter::new(rate_limit),
            cache,
        })
    }

    /// REST base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute a request. Returns the decoded JSON body, or an empty object
    /// for 204 and empty bodies.
    #[allow(clippy::too_many_lines)]
    pub async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        if let Some(retry_in) = self.breaker.retry_in() {
            metrics::record_request_failure("circuit_open");
            tracing::warn!(
                method = %request.method,
                path = %request.path,
                retry_in_secs = retry_in.as_secs(),
                "Circuit breaker open, request rejected"
            );
            return Err(ApiError::CircuitOpen { retry_in });
        }

        let mut refreshed_after_401 = false;

        loop {
            self.rate_limiter.wait().await;

            if !self.auth.authenticate(false).await {
                metrics::record_request_failure("authentication_failed");
                return Err(ApiError::AuthenticationFailed);
            }
            let token = self
                .auth
                .access_token()
                .ok_or(ApiError::AuthenticationFailed)?;

            let response = match self.send(request, &token).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        method = %request.method,
                        path = %request.path,
                        error = %e,
                        "Request failed"
                    );
                    return Err(self.fail(e));
                }
            };

            let status = response.status();
            match classify_status(status) {
                ResponseClass::Success => {
                    self.breaker.record_success();
                    self.rate_limiter.on_success();
                    let text = response.text().await.map_err(ApiError::from)?;
                    return parse_body(&text);
                }
                ResponseClass::RateLimited => {
                    let retry_after = RetryAfterExtractor::from_headers(response.headers());
                    match self.rate_limiter.on_rate_limited(retry_after) {
                        RateLimitDecision::Retry { attempt, delay } => {
                            metrics::record_rate_limit_retry();
                            tracing::warn!(
                                method = %request.method,
                                path = %request.path,
                                attempt,
                                delay_ms = delay.as_millis(),
                                retry_after_secs = retry_after.map(|d| d.as_secs()),
                                "Rate limited, retrying"
                            );
                        }
                        RateLimitDecision::GiveUp { attempts } => {
                            tracing::error!(
                                method = %request.method,
                                path = %request.path,
                                attempts,
                                "Rate limit retries exhausted"
                            );
                            return Err(self.fail(ApiError::RateLimited { attempts }));
                        }
                    }
                }
                ResponseClass::Unauthorized => {
                    if refreshed_after_401 {
                        tracing::error!(
                            method = %request.method,
                            path = %request.path,
                            "Still unauthorized after token refresh"
                        );
                        return Err(self.fail(ApiError::Unauthorized));
                    }
                    refreshed_after_401 = true;
                    tracing::info!(
                        method = %request.method,
                        path = %request.path,
                        "Unauthorized, forcing token refresh"
                    );
                    if !self.auth.authenticate(true).await {
                        metrics::record_request_failure("authentication_failed");
                        return Err(ApiError::AuthenticationFailed);
                    }
                }
                ResponseClass::Failure => {
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(
                        method = %request.method,
                        path = %request.path,
                        status = status.as_u16(),
                        error = %ErrorResponse::summarize(&body),
                        "Request returned error status"
                    );
                    return Err(self.fail(ApiError::Status {
                        status: status.as_u16(),
                        body: truncate(&body, MAX_ERROR_BODY),
                    }));
                }
            }
        }
    }

    /// GET `path`.
    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.execute(&ApiRequest::get(path)).await
    }

    /// POST `body` to `path`.
    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.execute(&ApiRequest::post(path).json(body)).await
    }

    /// DELETE `path`.
    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.execute(&ApiRequest::delete(path)).await
    }

    /// Price for one instrument: the cache if its entry is younger than
    /// `max_age`, else the info-price endpoint (which refreshes the cache).
    pub async fn get_quote(
        &self,
        uic: u64,
        asset_type: &str,
        max_age: Duration,
    ) -> Result<PriceSnapshot, ApiError> {
        if let Some(snapshot) = self.cache.get(uic, max_age) {
            tracing::trace!(uic, "Quote served from cache");
            return Ok(snapshot);
        }

        let request = ApiRequest::get(INFO_PRICES_PATH)
            .query("Uic", uic)
            .query("AssetType", asset_type)
            .query("FieldGroups", QUOTE_FIELD_GROUPS);
        let body = self.execute(&request).await?;

        let mut snapshot: PriceSnapshot = serde_json::from_value(body)?;
        snapshot.uic.get_or_insert(uic);
        snapshot
            .asset_type
            .get_or_insert_with(|| asset_type.to_string());

        self.cache.put(uic, snapshot.clone());
        tracing::debug!(uic, asset_type, "Quote fetched over REST");
        Ok(snapshot)
    }

    /// Whether the circuit breaker is currently rejecting calls.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Circuit breaker state and counters.
    #[must_use]
    pub fn circuit_status(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    /// Manually close the circuit breaker.
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    /// 429 backoff counters.
    #[must_use]
    pub fn rate_limit_state(&self) -> RateLimitState {
        self.rate_limiter.state()
    }

    async fn send(&self, request: &ApiRequest, token: &str) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        metrics::record_request(request.method.as_str());

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .bearer_auth(token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(ApiError::from)
    }

    fn fail(&self, error: ApiError) -> ApiError {
        self.breaker.record_failure();
        metrics::record_request_failure(error.kind());
        error
    }
}

fn parse_body(text: &str) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(text).map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;
    use test_case::test_case;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::application::ports::StaticTokenProvider;

    #[test_case(StatusCode::OK => ResponseClass::Success)]
    #[test_case(StatusCode::CREATED => ResponseClass::Success)]
    #[test_case(StatusCode::ACCEPTED => ResponseClass::Success)]
    #[test_case(StatusCode::NO_CONTENT => ResponseClass::Success)]
    #[test_case(StatusCode::TOO_MANY_REQUESTS => ResponseClass::RateLimited)]
    #[test_case(StatusCode::UNAUTHORIZED => ResponseClass::Unauthorized)]
    #[test_case(StatusCode::FORBIDDEN => ResponseClass::Failure)]
    #[test_case(StatusCode::NOT_FOUND => ResponseClass::Failure)]
    #[test_case(StatusCode::INTERNAL_SERVER_ERROR => ResponseClass::Failure)]
    #[test_case(StatusCode::PARTIAL_CONTENT => ResponseClass::Failure)]
    fn status_classification(status: StatusCode) -> ResponseClass {
        classify_status(status)
    }

    #[test]
    fn empty_body_is_empty_object() {
        assert_eq!(parse_body("").unwrap(), json!({}));
        assert_eq!(parse_body("  \n").unwrap(), json!({}));
        assert_eq!(parse_body(r#"{"a":1}"#).unwrap(), json!({"a": 1}));
    }

    fn executor(server: &MockServer, auth: Arc<dyn TokenProviderPort>) -> RequestExecutor {
        RequestExecutor::new(
            &RestSettings::default()
                .with_base_url(server.uri())
                .with_timeout(Duration::from_secs(2)),
            CircuitBreakerConfig::new(3, Duration::from_secs(60)),
            RateLimitPolicy::new(Duration::from_millis(10), 2),
            auth,
            Arc::new(PriceCache::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sends_bearer_token_and_returns_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/port/v1/accounts/me"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let exec = executor(&server, Arc::new(StaticTokenProvider::new("token-1")));
        let body = exec.get("/port/v1/accounts/me").await.unwrap();

        assert_eq!(body, json!({"Data": []}));
    }

    #[tokio::test]
    async fn no_content_returns_empty_object() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let exec = executor(&server, Arc::new(StaticTokenProvider::new("t")));
        assert_eq!(exec.delete("/x").await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn authentication_failure_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let exec = executor(&server, Arc::new(StaticTokenProvider::failing()));
        let err = exec.get("/x").await.unwrap_err();
        assert!(matches!(err, ApiError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn error_status_is_recorded_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"ErrorCode": "InvalidRequest", "Message": "bad"})),
            )
            .mount(&server)
            .await;

        let exec = executor(&server, Arc::new(StaticTokenProvider::new("t")));
        let err = exec.get("/x").await.unwrap_err();

        assert!(matches!(err, ApiError::Status { status: 400, .. }));
        assert_eq!(exec.circuit_status().consecutive_errors, 1);
    }

    #[tokio::test]
    async fn get_quote_prefers_fresh_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INFO_PRICES_PATH))
            .and(query_param("Uic", "211"))
            .and(query_param("AssetType", "Stock"))
            .and(query_param("FieldGroups", "Quote,PriceInfo,Greeks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Uic": 211,
                "AssetType": "Stock",
                "Quote": {"Bid": 10.5, "Ask": 10.7}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exec = executor(&server, Arc::new(StaticTokenProvider::new("t")));

        let first = exec.get_quote(211, "Stock", Duration::from_secs(10)).await.unwrap();
        let second = exec.get_quote(211, "Stock", Duration::from_secs(10)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.uic, Some(211));
        assert!(first.bid().is_some());
    }

    #[tokio::test]
    async fn reset_circuit_allows_calls_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let exec = executor(&server, Arc::new(StaticTokenProvider::new("t")));
        for _ in 0..3 {
            let _ = exec.get("/x").await;
        }
        assert!(exec.is_open());
        assert!(matches!(
            exec.get("/x").await.unwrap_err(),
            ApiError::CircuitOpen { .. }
        ));

        exec.reset_circuit();

        assert!(!exec.is_open());
        assert!(matches!(
            exec.get("/x").await.unwrap_err(),
            ApiError::Status { status: 500, .. }
        ));
    }
}
