//! Codec for encoding and decoding live-channel frames.
//!
//! Two encodings are supported:
//! - JSON text, one frame per WebSocket text message (the default)
//! - MessagePack with length-prefixed framing, carried in binary messages

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The encoding a live connection speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    #[serde(rename = "json")]
    Json,
    /// Length-prefixed MessagePack binary frames.
    #[serde(rename = "msgpack")]
    MessagePack,
}

/// An encoded frame, ready to hand to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Send as a text message.
    Text(String),
    /// Send as a binary message.
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(s) => s.len(),
            Encoded::Binary(b) => b.len(),
        }
    }

    /// Check if the encoded frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a frame in the given wire format.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_as<T: Serialize>(format: WireFormat, frame: &T) -> Result<Encoded, ProtocolError> {
    match format {
        WireFormat::Json => to_json(frame).map(Encoded::Text),
        WireFormat::MessagePack => encode(frame).map(Encoded::Binary),
    }
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn to_json<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(serde_json::from_str(text)?)
}

/// Encode a frame to length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ClientFrame, ServerEvent};
    use crate::message::Message;
    use chrono::Utc;

    #[test]
    fn test_msgpack_carries_server_events() {
        let events = vec![
            ServerEvent::new_message(Message::new(3, "hello", Utc::now())),
            ServerEvent::delete_message(3),
        ];

        let mut buf = BytesMut::new();
        for event in &events {
            encode_into(event, &mut buf).unwrap();
        }

        let first: ServerEvent = decode_from(&mut buf).unwrap().unwrap();
        let second: ServerEvent = decode_from(&mut buf).unwrap().unwrap();

        // Utc::now() carries nanoseconds, the wire only microseconds
        assert_eq!(first.message_id(), 3);
        assert_eq!(second, events[1]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&ClientFrame::send_message("partial")).unwrap();

        match decode::<ClientFrame>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }

        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(decode_from::<ClientFrame>(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_from::<ClientFrame>(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_as_picks_message_kind() {
        let frame = ClientFrame::send_message("hi");

        match encode_as(WireFormat::Json, &frame).unwrap() {
            Encoded::Text(text) => {
                assert_eq!(text, r#"{"event":"send_message","data":{"text":"hi"}}"#)
            }
            other => panic!("Expected text, got {:?}", other),
        }

        let encoded = encode_as(WireFormat::MessagePack, &frame).unwrap();
        assert!(matches!(encoded, Encoded::Binary(_)));
        assert!(!encoded.is_empty());
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            from_json::<ClientFrame>("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_wire_format_names() {
        let format: WireFormat = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(format, WireFormat::MessagePack);
        assert_eq!(WireFormat::default(), WireFormat::Json);
    }
}
