//! Price Streaming
//!
//! WebSocket connection with REST-created price subscriptions, a binary
//! frame decoder, keep-alive pings, and health reporting.

mod client;
pub mod frame;
mod health;
mod heartbeat;
mod subscription;

pub use client::{PriceCallback, StreamError, StreamingClient};
pub use frame::{BinaryFrame, ControlMessage, FrameBatch, FrameError, decode_frame, decode_message, encode_frame};
pub use health::{StreamHealth, StreamState, StreamStats};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use subscription::{
    Instrument, PRICE_SUBSCRIPTIONS_PATH, Subscription, SubscriptionRegistry, SubscriptionResponse,
    new_context_id,
};
