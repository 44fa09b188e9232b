//! Stream Health
//!
//! Counters and timestamps written by the read loop and read by callers
//! deciding whether to restart the stream. Reconnection is never automatic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

// =============================================================================
// State
// =============================================================================

/// Connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// No socket.
    #[default]
    Disconnected,
    /// Authenticating, connecting, or subscribing.
    Connecting,
    /// Read loop running.
    Connected,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time view of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHealth {
    /// Connection state.
    pub state: StreamState,
    /// Whether a session was started and not stopped.
    pub is_streaming: bool,
    /// Whether the read loop task is running.
    pub reader_alive: bool,
    /// Time since any message arrived.
    pub last_message_age: Option<Duration>,
    /// Time since the last heartbeat control message.
    pub last_heartbeat_age: Option<Duration>,
    /// WebSocket messages received.
    pub messages: u64,
    /// Heartbeat control messages received.
    pub heartbeats: u64,
    /// Frames discarded as malformed.
    pub frames_dropped: u64,
    /// Active subscriptions.
    pub subscriptions: usize,
    /// Server asked for a disconnect or a subscription reset.
    pub restart_requested: bool,
}

impl StreamHealth {
    /// Streaming, reader alive, and a heartbeat seen within `threshold`.
    ///
    /// A stream that has not yet received its first heartbeat is measured
    /// from connection time instead, so a fresh connection is healthy.
    #[must_use]
    pub fn is_healthy(&self, threshold: Duration) -> bool {
        self.is_streaming
            && self.reader_alive
            && !self.restart_requested
            && self
                .last_heartbeat_age
                .is_some_and(|age| age < threshold)
    }
}

// =============================================================================
// Shared Counters
// =============================================================================

/// Mutable health record shared between the client and its read loop.
#[derive(Debug)]
pub struct StreamStats {
    state: RwLock<StreamState>,
    streaming: AtomicBool,
    reader_alive: AtomicBool,
    restart_requested: AtomicBool,
    last_message: RwLock<Option<Instant>>,
    last_heartbeat: RwLock<Option<Instant>>,
    messages: AtomicU64,
    heartbeats: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStats {
    /// All counters zero, disconnected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StreamState::Disconnected),
            streaming: AtomicBool::new(false),
            reader_alive: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            last_message: RwLock::new(None),
            last_heartbeat: RwLock::new(None),
            messages: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        *self.state.write() = state;
    }

    /// Start of a new connection: liveness is measured from now.
    pub(crate) fn begin_session(&self) {
        let now = Instant::now();
        *self.last_message.write() = Some(now);
        *self.last_heartbeat.write() = Some(now);
        self.restart_requested.store(false, Ordering::SeqCst);
        self.streaming.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_session(&self) {
        self.streaming.store(false, Ordering::SeqCst);
        self.set_state(StreamState::Disconnected);
    }

    pub(crate) fn set_reader_alive(&self, alive: bool) {
        self.reader_alive.store(alive, Ordering::SeqCst);
    }

    pub(crate) fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        *self.last_message.write() = Some(Instant::now());
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        *self.last_heartbeat.write() = Some(Instant::now());
    }

    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
    }

    /// Snapshot with the given subscription count.
    #[must_use]
    pub fn snapshot(&self, subscriptions: usize) -> StreamHealth {
        StreamHealth {
            state: self.state(),
            is_streaming: self.streaming.load(Ordering::SeqCst),
            reader_alive: self.reader_alive.load(Ordering::SeqCst),
            last_message_age: self.last_message.read().map(|at| at.elapsed()),
            last_heartbeat_age: self.last_heartbeat.read().map(|at| at.elapsed()),
            messages: self.messages.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscriptions,
            restart_requested: self.restart_requested.load(Ordering::SeqCst),
        }
    }
}
