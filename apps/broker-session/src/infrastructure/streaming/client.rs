//! Streaming Client
//!
//! Owns one WebSocket connection and its price subscriptions.
//!
//! # Lifecycle
//!
//! ```text
//! DISCONNECTED --start()--> CONNECTING --subscribed--> CONNECTED
//!      ^                                                   |
//!      +------------- stop() / socket closed --------------+
//! ```
//!
//! `start` always force-refreshes the token first: the bearer token is only
//! sent in the handshake, so a token that expires mid-connection cannot be
//! replaced without reconnecting. Reconnecting is left to the caller, who
//! polls [`StreamingClient::is_healthy`] and calls
//! [`StreamingClient::restart`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::frame::{BinaryFrame, ControlMessage, decode_message};
use super::health::{StreamHealth, StreamState, StreamStats};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::subscription::{
    Instrument, PRICE_SUBSCRIPTIONS_PATH, Subscription, SubscriptionRegistry,
    SubscriptionResponse, new_context_id,
};
use crate::application::ports::TokenProviderPort;
use crate::domain::{PriceCache, PriceSnapshot};
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::metrics;
use crate::infrastructure::rest::{ApiError, RequestExecutor};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Called with every snapshot and every merged update.
pub type PriceCallback = Arc<dyn Fn(u64, &PriceSnapshot) + Send + Sync>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors from starting a stream. Once running, failures only show up in
/// [`StreamingClient::health`].
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// No valid token could be obtained for the handshake.
    #[error("authentication failed before connecting")]
    Authentication,

    /// Stream URL or handshake header is malformed.
    #[error("invalid stream request: {0}")]
    InvalidUrl(String),

    /// WebSocket handshake failed.
    #[error("WebSocket connect failed: {0}")]
    Connect(#[from] tungstenite::Error),

    /// Not a single subscription could be created.
    #[error("no subscription could be created: {0}")]
    Subscription(#[source] ApiError),

    /// Nothing to stream.
    #[error("no instruments requested")]
    NoInstruments,
}

// =============================================================================
// Client
// =============================================================================

struct Session {
    context_id: String,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

type LastRequest = (Vec<Instrument>, PriceCallback);

/// WebSocket price streaming into the shared [`PriceCache`].
pub struct StreamingClient {
    settings: StreamSettings,
    account_key: String,
    auth: Arc<dyn TokenProviderPort>,
    executor: Arc<RequestExecutor>,
    cache: Arc<PriceCache>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<StreamStats>,
    session: tokio::sync::Mutex<Option<Session>>,
    last_request: parking_lot::Mutex<Option<LastRequest>>,
}

impl std::fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingClient")
            .field("url", &self.settings.url)
            .field("state", &self.stats.state())
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl StreamingClient {
    /// Create a client. Nothing connects until [`StreamingClient::start`].
    #[must_use]
    pub fn new(
        settings: StreamSettings,
        account_key: impl Into<String>,
        auth: Arc<dyn TokenProviderPort>,
        executor: Arc<RequestExecutor>,
        cache: Arc<PriceCache>,
    ) -> Self {
        Self {
            settings,
            account_key: account_key.into(),
            auth,
            executor,
            cache,
            registry: Arc::new(SubscriptionRegistry::new()),
            stats: Arc::new(StreamStats::new()),
            session: tokio::sync::Mutex::new(None),
            last_request: parking_lot::Mutex::new(None),
        }
    }

    /// Connect and subscribe to `instruments`. Any running session is
    /// stopped first.
    ///
    /// Each subscription's initial snapshot is cached and passed to
    /// `callback` before this returns. Instruments whose subscription fails
    /// are skipped; the call fails only if none succeed.
    pub async fn start(
        &self,
        instruments: &[Instrument],
        callback: PriceCallback,
    ) -> Result<(), StreamError> {
        if instruments.is_empty() {
            return Err(StreamError::NoInstruments);
        }

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            self.shutdown(previous).await;
        }
        *self.last_request.lock() = Some((instruments.to_vec(), Arc::clone(&callback)));

        self.stats.set_state(StreamState::Connecting);
        self.cache.clear();

        match self.open(instruments, callback).await {
            Ok(opened) => {
                *session = Some(opened);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start price stream");
                self.registry.clear();
                self.cache.clear();
                self.stats.end_session();
                Err(e)
            }
        }
    }

    /// Stop and start again with the last requested instruments and
    /// callback: new token, new context id, empty cache.
    pub async fn restart(&self) -> Result<(), StreamError> {
        let previous = self.last_request.lock().clone();
        let Some((instruments, callback)) = previous else {
            return Err(StreamError::NoInstruments);
        };
        tracing::info!(instruments = instruments.len(), "Restarting price stream");
        self.start(&instruments, callback).await
    }

    /// Close the socket, drop every subscription locally and on the server,
    /// and wipe the cache. Safe to call repeatedly or before any start.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        match session.take() {
            Some(running) => self.shutdown(running).await,
            None => {
                self.registry.clear();
                self.cache.clear();
                self.stats.end_session();
            }
        }
    }

    /// Health snapshot.
    #[must_use]
    pub fn health(&self) -> StreamHealth {
        self.stats.snapshot(self.registry.len())
    }

    /// Streaming, reader alive, and a heartbeat within the staleness threshold.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health().is_healthy(self.settings.heartbeat_stale_after)
    }

    /// Connection state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.stats.state()
    }

    async fn open(
        &self,
        instruments: &[Instrument],
        callback: PriceCallback,
    ) -> Result<Session, StreamError> {
        if !self.auth.authenticate(true).await {
            return Err(StreamError::Authentication);
        }
        let token = self
            .auth
            .access_token()
            .ok_or(StreamError::Authentication)?;

        let context_id = new_context_id();
        let socket = self.connect(&context_id, &token).await?;

        let mut last_error = None;
        for instrument in instruments {
            match self.subscribe(&context_id, instrument).await {
                Ok(snapshot) => {
                    if let Some(snapshot) = snapshot {
                        invoke_callback(&callback, instrument.uic, &snapshot);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        uic = instrument.uic,
                        asset_type = %instrument.asset_type,
                        error = %e,
                        "Subscription failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        if self.registry.is_empty() {
            return Err(StreamError::Subscription(
                last_error.unwrap_or_else(|| ApiError::InvalidRequest("no subscriptions".to_string())),
            ));
        }

        self.stats.begin_session();
        self.stats.set_reader_alive(true);
        self.stats.set_state(StreamState::Connected);
        metrics::set_stream_connected(true);
        metrics::set_subscriptions(self.registry.len());

        let cancel = CancellationToken::new();
        let reader = ReadLoop {
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            callback,
            heartbeat: HeartbeatConfig::from_stream_settings(&self.settings),
            cancel: cancel.clone(),
        };
        let reader = tokio::spawn(reader.run(socket));

        tracing::info!(
            context_id = %context_id,
            subscriptions = self.registry.len(),
            "Price stream started"
        );
        Ok(Session {
            context_id,
            cancel,
            reader,
        })
    }

    async fn connect(&self, context_id: &str, token: &str) -> Result<Socket, StreamError> {
        let url = format!("{}?contextId={context_id}", self.settings.url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::InvalidUrl(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| StreamError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::debug!(url = %self.settings.url, context_id, "Connecting price stream");
        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(socket)
    }

    async fn subscribe(
        &self,
        context_id: &str,
        instrument: &Instrument,
    ) -> Result<Option<PriceSnapshot>, ApiError> {
        let subscription = Subscription::new(context_id, instrument, &self.settings.field_groups);
        let body = self
            .executor
            .post(
                PRICE_SUBSCRIPTIONS_PATH,
                subscription.request_body(&self.account_key),
            )
            .await?;
        let response: SubscriptionResponse = serde_json::from_value(body)?;
        self.registry.insert(subscription);

        let snapshot = response.snapshot.map(|mut snapshot| {
            snapshot.uic.get_or_insert(instrument.uic);
            snapshot
                .asset_type
                .get_or_insert_with(|| instrument.asset_type.clone());
            self.cache.put(instrument.uic, snapshot.clone());
            snapshot
        });
        tracing::debug!(uic = instrument.uic, has_snapshot = snapshot.is_some(), "Subscribed");
        Ok(snapshot)
    }

    async fn shutdown(&self, session: Session) {
        let Session {
            context_id,
            cancel,
            mut reader,
        } = session;

        cancel.cancel();
        if tokio::time::timeout(self.settings.shutdown_timeout, &mut reader)
            .await
            .is_err()
        {
            tracing::warn!("Stream reader did not stop in time, aborting");
            reader.abort();
        }

        self.stats.set_reader_alive(false);
        self.stats.end_session();
        self.registry.clear();
        self.cache.clear();
        metrics::set_stream_connected(false);
        metrics::set_subscriptions(0);

        match self
            .executor
            .delete(&Subscription::context_path(&context_id))
            .await
        {
            Ok(_) => tracing::info!(context_id = %context_id, "Price stream stopped"),
            Err(e) => tracing::warn!(
                context_id = %context_id,
                error = %e,
                "Failed to delete subscription context"
            ),
        }
    }
}

// =============================================================================
// Read Loop
// =============================================================================

#[derive(Debug)]
enum Exit {
    Stopped,
    HeartbeatTimeout,
    ClosedByServer(Option<String>),
    EndOfStream,
    Failed(tungstenite::Error),
}

struct ReadLoop {
    cache: Arc<PriceCache>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<StreamStats>,
    callback: PriceCallback,
    heartbeat: HeartbeatConfig,
    cancel: CancellationToken,
}

impl ReadLoop {
    async fn run(self, socket: Socket) {
        let (mut write, mut read) = socket.split();

        let pongs = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                self.heartbeat,
                Arc::clone(&pongs),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let exit = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break Exit::Stopped;
                }
                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendPing => {
                        pongs.mark_ping_sent();
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            break Exit::Failed(e);
                        }
                    }
                    HeartbeatEvent::Timeout => break Exit::HeartbeatTimeout,
                },
                message = read.next() => match message {
                    Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                    Some(Ok(Message::Pong(_))) => pongs.record_pong(),
                    Some(Ok(Message::Text(text))) => {
                        self.stats.record_message();
                        tracing::debug!(len = text.len(), "Ignoring text message");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Exit::ClosedByServer(frame.map(|f| f.reason.as_str().to_string()));
                    }
                    Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => break Exit::Failed(e),
                    None => break Exit::EndOfStream,
                },
            }
        };

        heartbeat_cancel.cancel();
        self.finish(&exit);
    }

    fn finish(&self, exit: &Exit) {
        self.stats.set_reader_alive(false);
        self.stats.set_state(StreamState::Disconnected);
        self.cache.clear();
        metrics::set_stream_connected(false);

        if self.cancel.is_cancelled() {
            tracing::debug!("Stream reader stopped");
        } else {
            tracing::warn!(reason = ?exit, "Price stream disconnected");
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        self.stats.record_message();

        let batch = decode_message(data);
        if let Some(err) = &batch.malformed {
            self.stats.record_dropped();
            metrics::record_frame_dropped(err.reason());
            tracing::debug!(error = %err, len = data.len(), "Discarding malformed frame");
        }
        metrics::record_frames_decoded(batch.frames.len() as u64);

        for frame in batch.frames {
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&self, frame: &BinaryFrame) {
        if let Some(control) = frame.control() {
            self.handle_control(control);
            return;
        }

        let Some(uic) = self.registry.uic_for(&frame.ref_id) else {
            metrics::record_frame_dropped("unknown_reference");
            tracing::debug!(ref_id = %frame.ref_id, "Frame for unknown subscription");
            return;
        };

        let updates = match frame.snapshots() {
            Ok(updates) => updates,
            Err(e) => {
                self.stats.record_dropped();
                metrics::record_frame_dropped(e.reason());
                tracing::warn!(ref_id = %frame.ref_id, error = %e, "Undecodable price update");
                return;
            }
        };

        for delta in updates {
            let merged = self.cache.merge(uic, delta);
            invoke_callback(&self.callback, uic, &merged);
        }
    }

    fn handle_control(&self, control: ControlMessage) {
        match control {
            ControlMessage::Heartbeat => {
                self.stats.record_heartbeat();
                metrics::record_heartbeat();
            }
            ControlMessage::Disconnect => {
                tracing::warn!("Server requested disconnect");
                self.stats.request_restart();
            }
            ControlMessage::ResetSubscriptions { targets } => {
                tracing::warn!(targets = ?targets, "Server requested subscription reset");
                self.stats.request_restart();
            }
            ControlMessage::Unknown(id) => {
                tracing::debug!(control = %id, "Unknown control message");
            }
        }
    }
}

fn invoke_callback(callback: &PriceCallback, uic: u64, snapshot: &PriceSnapshot) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(uic, snapshot))).is_err() {
        metrics::record_callback_panic();
        tracing::warn!(uic, "Price callback panicked");
    }
}
