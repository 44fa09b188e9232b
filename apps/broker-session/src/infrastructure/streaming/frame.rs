//! Binary Frame Codec
//!
//! The streaming socket delivers binary WebSocket messages, each holding one
//! or more concatenated frames. All integers are little-endian.
//!
//! ```text
//! +------------+----------+---------+--------------+--------+--------------+-----------+
//! | message id | reserved | ref len | reference id | format | payload size | payload   |
//! | u64        | 2 bytes  | u8 (N)  | N bytes      | u8     | i32 (M)      | M bytes   |
//! +------------+----------+---------+--------------+--------+--------------+-----------+
//! ```
//!
//! Reference ids starting with `_` are control messages. Format 0 is JSON;
//! nothing else is in use.
//!
//! Decoding never panics on hostile input: every length is checked against
//! the bytes actually remaining.

use serde::Deserialize;
use serde_json::Value;

use crate::domain::PriceSnapshot;

/// Message id, reserved bytes, and ref-id length.
pub const PREFIX_LEN: usize = 11;

/// Format byte and payload size.
const TRAILER_LEN: usize = 5;

/// Payload format byte for JSON.
pub const FORMAT_JSON: u8 = 0;

/// Reference id of heartbeat control messages.
pub const HEARTBEAT_REF: &str = "_heartbeat";

/// Reference id of server-initiated disconnects.
pub const DISCONNECT_REF: &str = "_disconnect";

/// Reference id asking the client to recreate subscriptions.
pub const RESET_SUBSCRIPTIONS_REF: &str = "_resetsubscriptions";

/// Frame decoding failures. These never leave the read loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than the fixed header.
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Reference id length runs past the buffer.
    #[error("reference id of {len} bytes overruns buffer ({available} left)")]
    RefIdOverrun {
        /// Declared length.
        len: usize,
        /// Bytes left after the prefix.
        available: usize,
    },

    /// Reference id is not ASCII.
    #[error("reference id is not ASCII")]
    InvalidRefId,

    /// Payload size is negative or runs past the buffer.
    #[error("payload of {declared} bytes overruns buffer ({available} left)")]
    PayloadOverrun {
        /// Declared size as sent.
        declared: i64,
        /// Bytes left after the header.
        available: usize,
    },

    /// Payload format other than JSON.
    #[error("unsupported payload format {0}")]
    UnsupportedFormat(u8),

    /// Payload is not the expected JSON.
    #[error("payload JSON error: {0}")]
    Json(String),
}

impl FrameError {
    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::RefIdOverrun { .. } => "ref_id_overrun",
            Self::InvalidRefId => "invalid_ref_id",
            Self::PayloadOverrun { .. } => "payload_overrun",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Json(_) => "json",
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    /// Server message id.
    pub msg_id: u64,
    /// Subscription reference id, or a `_`-prefixed control id.
    pub ref_id: String,
    /// Payload format byte.
    pub payload_format: u8,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl BinaryFrame {
    /// Whether this is a control message rather than subscription data.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.ref_id.starts_with('_')
    }

    /// Payload parsed as JSON.
    pub fn json(&self) -> Result<Value, FrameError> {
        if self.payload_format != FORMAT_JSON {
            return Err(FrameError::UnsupportedFormat(self.payload_format));
        }
        serde_json::from_slice(&self.payload).map_err(|e| FrameError::Json(e.to_string()))
    }

    /// Price updates carried by a data frame. The payload may be a single
    /// object or an array of them.
    pub fn snapshots(&self) -> Result<Vec<PriceSnapshot>, FrameError> {
        let value = self.json()?;
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| FrameError::Json(e.to_string())))
            .collect()
    }

    /// Interpret a control frame.
    #[must_use]
    pub fn control(&self) -> Option<ControlMessage> {
        if !self.is_control() {
            return None;
        }
        Some(match self.ref_id.as_str() {
            HEARTBEAT_REF => ControlMessage::Heartbeat,
            DISCONNECT_REF => ControlMessage::Disconnect,
            RESET_SUBSCRIPTIONS_REF => ControlMessage::ResetSubscriptions {
                targets: self.reset_targets(),
            },
            other => ControlMessage::Unknown(other.to_string()),
        })
    }

    fn reset_targets(&self) -> Vec<String> {
        #[derive(Deserialize)]
        struct Reset {
            #[serde(rename = "TargetReferenceIds", default)]
            targets: Vec<String>,
        }

        let Ok(value) = self.json() else {
            return Vec::new();
        };
        let first = match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        serde_json::from_value::<Reset>(first)
            .map(|r| r.targets)
            .unwrap_or_default()
    }
}

/// Server control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Liveness only.
    Heartbeat,
    /// Server is about to drop the connection.
    Disconnect,
    /// Subscriptions must be recreated. Empty targets means all.
    ResetSubscriptions {
        /// Affected reference ids.
        targets: Vec<String>,
    },
    /// Control id this client does not know.
    Unknown(String),
}

/// Result of decoding one WebSocket message.
#[derive(Debug, Default)]
pub struct FrameBatch {
    /// Frames decoded before any error.
    pub frames: Vec<BinaryFrame>,
    /// The error that stopped decoding, if any.
    pub malformed: Option<FrameError>,
}

/// Decode the frame at the start of `buf`. Returns it with the number of
/// bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(BinaryFrame, usize), FrameError> {
    if buf.len() < PREFIX_LEN {
        return Err(FrameError::Truncated {
            needed: PREFIX_LEN,
            available: buf.len(),
        });
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[..8]);
    let msg_id = u64::from_le_bytes(id);

    let ref_len = usize::from(buf[10]);
    let rest = &buf[PREFIX_LEN..];
    if ref_len > rest.len() {
        return Err(FrameError::RefIdOverrun {
            len: ref_len,
            available: rest.len(),
        });
    }
    let (ref_bytes, rest) = rest.split_at(ref_len);
    if !ref_bytes.is_ascii() {
        return Err(FrameError::InvalidRefId);
    }
    let ref_id = String::from_utf8_lossy(ref_bytes).into_owned();

    if rest.len() < TRAILER_LEN {
        return Err(FrameError::Truncated {
            needed: PREFIX_LEN + ref_len + TRAILER_LEN,
            available: buf.len(),
        });
    }
    let payload_format = rest[0];
    let mut size = [0u8; 4];
    size.copy_from_slice(&rest[1..TRAILER_LEN]);
    let declared = i32::from_le_bytes(size);
    let rest = &rest[TRAILER_LEN..];

    let payload_len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= rest.len())
        .ok_or(FrameError::PayloadOverrun {
            declared: i64::from(declared),
            available: rest.len(),
        })?;

    let frame = BinaryFrame {
        msg_id,
        ref_id,
        payload_format,
        payload: rest[..payload_len].to_vec(),
    };
    Ok((frame, PREFIX_LEN + ref_len + TRAILER_LEN + payload_len))
}

/// Decode every frame in a WebSocket message. Decoding stops at the first
/// malformed frame; frames before it are kept.
#[must_use]
pub fn decode_message(buf: &[u8]) -> FrameBatch {
    let mut batch = FrameBatch::default();
    let mut offset = 0;
    while offset < buf.len() {
        match decode_frame(&buf[offset..]) {
            Ok((frame, consumed)) => {
                batch.frames.push(frame);
                offset += consumed;
            }
            Err(e) => {
                batch.malformed = Some(e);
                break;
            }
        }
    }
    batch
}

/// Encode a frame. Reference ids longer than 255 bytes are cut.
#[must_use]
pub fn encode_frame(msg_id: u64, ref_id: &str, payload_format: u8, payload: &[u8]) -> Vec<u8> {
    let ref_bytes = &ref_id.as_bytes()[..ref_id.len().min(usize::from(u8::MAX))];
    let size = i32::try_from(payload.len()).unwrap_or(i32::MAX);

    let mut buf = Vec::with_capacity(PREFIX_LEN + ref_bytes.len() + TRAILER_LEN + payload.len());
    buf.extend_from_slice(&msg_id.to_le_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.push(ref_bytes.len() as u8);
    buf.extend_from_slice(ref_bytes);
    buf.push(payload_format);
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use super::*;

    fn quote_frame(msg_id: u64, ref_id: &str, bid: &str) -> Vec<u8> {
        let payload = format!(r#"{{"Quote":{{"Bid":{bid},"Ask":101.0}}}}"#);
        encode_frame(msg_id, ref_id, FORMAT_JSON, payload.as_bytes())
    }

    #[test]
    fn decodes_well_formed_frame() {
        let bytes = quote_frame(7, "ref-36590", "100.0");
        let (frame, consumed) = decode_frame(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.msg_id, 7);
        assert_eq!(frame.ref_id, "ref-36590");
        assert_eq!(frame.payload_format, FORMAT_JSON);
        assert!(!frame.is_control());

        let snapshots = frame.snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].bid(), Some(dec!(100.0)));
    }

    #[test]
    fn buffer_shorter_than_eight_bytes_yields_nothing() {
        let batch = decode_message(&[1, 2, 3, 4, 5]);
        assert!(batch.frames.is_empty());
        assert!(matches!(
            batch.malformed,
            Some(FrameError::Truncated { available: 5, .. })
        ));
    }

    #[test]
    fn oversized_payload_yields_nothing() {
        let mut bytes = quote_frame(1, "r", "1");
        let size_at = PREFIX_LEN + 1 + 1;
        bytes[size_at..size_at + 4].copy_from_slice(&10_000i32.to_le_bytes());

        let batch = decode_message(&bytes);
        assert!(batch.frames.is_empty());
        assert!(matches!(
            batch.malformed,
            Some(FrameError::PayloadOverrun { declared: 10_000, .. })
        ));
    }

    #[test]
    fn negative_payload_size_is_rejected() {
        let mut bytes = quote_frame(1, "r", "1");
        let size_at = PREFIX_LEN + 1 + 1;
        bytes[size_at..size_at + 4].copy_from_slice(&(-1i32).to_le_bytes());

        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameError::PayloadOverrun { declared: -1, .. })
        ));
    }

    #[test]
    fn ref_id_overrun_is_rejected() {
        let mut bytes = vec![0u8; PREFIX_LEN];
        bytes[10] = 200;
        bytes.extend_from_slice(b"short");

        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameError::RefIdOverrun { len: 200, available: 5 })
        ));
    }

    #[test]
    fn non_ascii_ref_id_is_rejected() {
        let bytes = encode_frame(1, "réf", FORMAT_JSON, b"{}");
        assert_eq!(decode_frame(&bytes), Err(FrameError::InvalidRefId));
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let mut bytes = quote_frame(1, "a", "1.5");
        bytes.extend(quote_frame(2, "b", "2.5"));

        let batch = decode_message(&bytes);
        assert!(batch.malformed.is_none());
        let ids: Vec<_> = batch.frames.iter().map(|f| f.ref_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn trailing_garbage_keeps_earlier_frames() {
        let mut bytes = quote_frame(1, "a", "1.5");
        bytes.extend_from_slice(&[9, 9, 9]);

        let batch = decode_message(&bytes);
        assert_eq!(batch.frames.len(), 1);
        assert!(batch.malformed.is_some());
    }

    #[test]
    fn empty_message_decodes_to_nothing() {
        let batch = decode_message(&[]);
        assert!(batch.frames.is_empty());
        assert!(batch.malformed.is_none());
    }

    #[test]
    fn non_json_format_is_unsupported() {
        let bytes = encode_frame(1, "r", 1, b"\x01\x02");
        let (frame, _) = decode_frame(&bytes).unwrap();
        assert_eq!(frame.snapshots(), Err(FrameError::UnsupportedFormat(1)));
    }

    #[test]
    fn array_payload_yields_every_snapshot() {
        let payload = br#"[{"Quote":{"Bid":1}},{"Quote":{"Bid":2}}]"#;
        let (frame, _) = decode_frame(&encode_frame(1, "r", FORMAT_JSON, payload)).unwrap();
        assert_eq!(frame.snapshots().unwrap().len(), 2);
    }

    #[test]
    fn control_frames_are_classified() {
        let heartbeat = encode_frame(
            1,
            HEARTBEAT_REF,
            FORMAT_JSON,
            br#"[{"ReferenceId":"_heartbeat","Heartbeats":[]}]"#,
        );
        let (frame, _) = decode_frame(&heartbeat).unwrap();
        assert_eq!(frame.control(), Some(ControlMessage::Heartbeat));

        let reset = encode_frame(
            2,
            RESET_SUBSCRIPTIONS_REF,
            FORMAT_JSON,
            br#"{"TargetReferenceIds":["ref-1"]}"#,
        );
        let (frame, _) = decode_frame(&reset).unwrap();
        assert_eq!(
            frame.control(),
            Some(ControlMessage::ResetSubscriptions {
                targets: vec!["ref-1".to_string()]
            })
        );

        let data = quote_frame(3, "ref-1", "1");
        let (frame, _) = decode_frame(&data).unwrap();
        assert_eq!(frame.control(), None);
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let batch = decode_message(&bytes);
            let consumed: usize = batch
                .frames
                .iter()
                .map(|f| PREFIX_LEN + f.ref_id.len() + TRAILER_LEN + f.payload.len())
                .sum();
            prop_assert!(consumed <= bytes.len());
        }

        #[test]
        fn encoded_frames_decode_exactly(
            msg_id in any::<u64>(),
            ref_id in "[a-zA-Z0-9_-]{0,40}",
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let bytes = encode_frame(msg_id, &ref_id, FORMAT_JSON, &payload);
            let (frame, consumed) = decode_frame(&bytes).unwrap();
            prop_assert_eq!(consumed, bytes.len());
            prop_assert_eq!(frame.msg_id, msg_id);
            prop_assert_eq!(frame.ref_id, ref_id);
            prop_assert_eq!(frame.payload, payload);
        }
    }
}
