//! WebSocket keep-alive.
//!
//! Sends a ping every `ping_interval` and reports a timeout when no pong has
//! arrived `pong_timeout` after an outstanding ping. The read loop owns the
//! socket; this task only tells it what to do.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::StreamSettings;

/// Ping cadence and pong deadline.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long a ping may stay unanswered.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(10))
    }
}

impl HeartbeatConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Take the ping settings from [`StreamSettings`].
    #[must_use]
    pub const fn from_stream_settings(settings: &StreamSettings) -> Self {
        Self::new(settings.ping_interval, settings.pong_timeout)
    }
}

/// Instruction for the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame now.
    SendPing,
    /// The last ping went unanswered; drop the connection.
    Timeout,
}

/// Pong bookkeeping shared with the read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    ping_sent_at: RwLock<Option<Instant>>,
    waiting_for_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Fresh state; the connection counts as alive from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ping_sent_at: RwLock::new(None),
            waiting_for_pong: AtomicBool::new(false),
        }
    }

    /// A pong arrived.
    pub fn record_pong(&self) {
        *self.ping_sent_at.write() = None;
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }

    /// A ping went out. Keeps the time of the oldest unanswered ping.
    pub fn mark_ping_sent(&self) {
        let mut sent = self.ping_sent_at.write();
        if sent.is_none() {
            *sent = Some(Instant::now());
        }
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Whether a ping is unanswered.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// How long the oldest unanswered ping has been waiting.
    #[must_use]
    pub fn outstanding_for(&self) -> Option<Duration> {
        self.ping_sent_at.read().map(|at| at.elapsed())
    }
}

/// Drives the ping cadence for one connection.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the read loop goes away, or a timeout is sent.
    ///
    /// The pong deadline runs on its own timer, armed when a ping is
    /// requested, so a dead peer is noticed `pong_timeout` after the ping
    /// rather than on the next ping tick.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; a new connection needs no ping yet.
        interval.tick().await;

        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::trace!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                        tracing::trace!("Read loop gone, stopping heartbeat");
                        break;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }
                () = sleep_until(pong_deadline) => {
                    match self.check_pong() {
                        PongCheck::Answered => pong_deadline = None,
                        PongCheck::Pending(remaining) => {
                            pong_deadline = Some(Instant::now() + remaining);
                        }
                        PongCheck::Overdue(waited) => {
                            tracing::warn!(
                                waited_ms = waited.as_millis(),
                                timeout_ms = self.config.pong_timeout.as_millis(),
                                "Pong not received in time"
                            );
                            let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    fn check_pong(&self) -> PongCheck {
        if !self.state.is_waiting_for_pong() {
            return PongCheck::Answered;
        }
        match self.state.outstanding_for() {
            Some(waited) if waited >= self.config.pong_timeout => PongCheck::Overdue(waited),
            Some(waited) => PongCheck::Pending(self.config.pong_timeout - waited),
            None => PongCheck::Answered,
        }
    }
}

enum PongCheck {
    Answered,
    Pending(Duration),
    Overdue(Duration),
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
