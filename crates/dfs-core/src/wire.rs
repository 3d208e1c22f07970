//! Wire format of the structured message stream.
//!
//! Every message travels as one frame:
//!
//!   magic (4 bytes, "DFS1") | body length (u32, big-endian) | body
//!
//! The body is a JSON object `{"payload": "<hex>"}`. The length prefix
//! recovers message boundaries however the bytes were split across reads;
//! the JSON body keeps each frame self-describing.
//!
//! Hex doubles the payload, so the largest payload a frame limit admits is
//! a little under half of it (see [`max_payload`]).

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame magic. A stream that does not start a frame with these bytes is
/// out of sync and cannot be recovered.
pub const FRAME_MAGIC: [u8; 4] = *b"DFS1";

/// Magic + length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest body accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// JSON around the hex payload: `{"payload":""}`.
const BODY_OVERHEAD: usize = 14;

/// Body of a structured frame. The sender address is not on the wire;
/// the receiving transport stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(with = "hex_payload")]
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid frame magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
    #[error("malformed frame body: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to serialize frame body: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Largest payload whose frame body fits in `max_frame` bytes.
pub fn max_payload(max_frame: usize) -> usize {
    max_frame.saturating_sub(BODY_OVERHEAD) / 2
}

/// Encode `payload` as one complete frame.
///
/// Fails with [`WireError::TooLarge`] when the body would exceed
/// `max_frame`, since a receiver with that limit drops the connection on
/// such a frame.
pub fn encode_frame(payload: &[u8], max_frame: usize) -> Result<Bytes, WireError> {
    let mut dst = BytesMut::new();
    encode_frame_into(payload, max_frame, &mut dst)?;
    Ok(dst.freeze())
}

/// Append one frame carrying `payload` to `dst`. Nothing is written on error.
pub fn encode_frame_into(
    payload: &[u8],
    max_frame: usize,
    dst: &mut BytesMut,
) -> Result<(), WireError> {
    let limit = max_frame.min(u32::MAX as usize);
    if payload.len() > max_payload(limit) {
        return Err(WireError::TooLarge {
            size: payload.len().saturating_mul(2).saturating_add(BODY_OVERHEAD),
            max: limit,
        });
    }

    let body = serde_json::to_vec(&WireMessage {
        payload: payload.to_vec(),
    })
    .map_err(WireError::Serialize)?;

    dst.reserve(FRAME_HEADER_LEN + body.len());
    dst.put_slice(&FRAME_MAGIC);
    dst.put_u32(body.len() as u32);
    dst.put_slice(&body);
    Ok(())
}

/// Inspect the start of `buf` for a frame header.
///
/// Returns the body length once the full header is buffered, `None` while
/// it is still incomplete.
pub fn parse_header(buf: &[u8], max_frame: usize) -> Result<Option<usize>, WireError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut actual = [0u8; 4];
    actual.copy_from_slice(&buf[0..4]);
    if actual != FRAME_MAGIC {
        return Err(WireError::InvalidMagic {
            expected: FRAME_MAGIC,
            actual,
        });
    }

    let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if size > max_frame {
        return Err(WireError::TooLarge {
            size,
            max: max_frame,
        });
    }
    Ok(Some(size))
}

/// Deserialize a frame body.
pub fn decode_body(body: &[u8]) -> Result<WireMessage, WireError> {
    serde_json::from_slice(body).map_err(WireError::Malformed)
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
