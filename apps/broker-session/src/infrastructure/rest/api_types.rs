//! Broker REST request and response types.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum response body kept in error values and logs.
pub const MAX_ERROR_BODY: usize = 512;

/// A call to the broker gateway, relative to the REST base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path beginning with `/`.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Request with an arbitrary method.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// GET request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// PUT request.
    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// PATCH request.
    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// DELETE request.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Append a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Attach a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Error document returned by the gateway on 4xx responses.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorResponse {
    /// Machine-readable code.
    pub error_code: Option<String>,
    /// Human-readable message.
    pub message: Option<String>,
}

impl ErrorResponse {
    /// Best-effort summary of an error body for logs.
    #[must_use]
    pub fn summarize(body: &str) -> String {
        match serde_json::from_str::<Self>(body) {
            Ok(Self {
                error_code: Some(code),
                message,
            }) => format!("{code}: {}", message.unwrap_or_default()),
            _ => truncate(body, MAX_ERROR_BODY),
        }
    }
}

/// Cut `text` to at most `max` bytes on a char boundary.
#[must_use]
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
