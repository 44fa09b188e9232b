//! Local OAuth redirect listener.
//!
//! Binds the redirect port before the browser is opened, accepts exactly one
//! `GET /callback` request, and shuts down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::error::AuthError;

/// Query parameters of the authorization redirect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code.
    pub code: Option<String>,
    /// CSRF state echoed back by the authorization server.
    pub state: Option<String>,
    /// Error code when the user or server declined.
    pub error: Option<String>,
    /// Human-readable error.
    pub error_description: Option<String>,
}

type Slot = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

/// One-shot HTTP listener for the authorization redirect.
#[derive(Debug)]
pub struct CallbackListener {
    local_addr: SocketAddr,
    receiver: oneshot::Receiver<CallbackParams>,
    /// Stops the server when the listener goes away, waited on or not.
    shutdown: DropGuard,
}

impl CallbackListener {
    /// Bind `127.0.0.1:port` and start serving. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self, AuthError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AuthError::CallbackBind(format!("port {port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AuthError::CallbackBind(e.to_string()))?;

        let (sender, receiver) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(sender)));
        let app = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(slot);

        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                tracing::warn!(error = %e, "OAuth callback listener failed");
            }
        });

        tracing::debug!(addr = %local_addr, "OAuth callback listener bound");
        Ok(Self {
            local_addr,
            receiver,
            shutdown: shutdown.drop_guard(),
        })
    }

    /// Bound port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// `http://localhost:{port}/callback`.
    #[must_use]
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.port())
    }

    /// Wait for the redirect and extract the authorization code.
    ///
    /// The listener is shut down whatever the outcome.
    pub async fn wait_for_code(
        self,
        expected_state: &str,
        timeout: Duration,
    ) -> Result<String, AuthError> {
        let Self {
            receiver, shutdown, ..
        } = self;
        let outcome = tokio::time::timeout(timeout, receiver).await;
        drop(shutdown);

        let params = match outcome {
            Ok(Ok(params)) => params,
            Ok(Err(_)) | Err(_) => return Err(AuthError::CallbackTimeout { waited: timeout }),
        };

        if let Some(error) = params.error {
            let detail = params
                .error_description
                .map_or(error.clone(), |d| format!("{error}: {d}"));
            return Err(AuthError::Denied(detail));
        }
        if params.state.as_deref() != Some(expected_state) {
            return Err(AuthError::StateMismatch);
        }
        params
            .code
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCode)
    }
}

async fn handle_callback(
    State(slot): State<Slot>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    let Some(sender) = slot.lock().take() else {
        return (StatusCode::GONE, Html("<p>Authorization already handled.</p>"));
    };

    let succeeded = params.code.is_some() && params.error.is_none();
    if sender.send(params).is_err() {
        tracing::debug!("OAuth callback arrived after the wait ended");
    }

    if succeeded {
        (
            StatusCode::OK,
            Html("<h2>Authorization complete</h2><p>You can close this window.</p>"),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            Html("<h2>Authorization failed</h2><p>Check the application log.</p>"),
        )
    }
}
