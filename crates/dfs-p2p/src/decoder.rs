//! Message decoders.
//!
//! A [`Decoder`] cuts messages out of a connection's read buffer. It is
//! shared by every connection and keeps no state of its own; all
//! per-connection state lives in the buffer. [`MessageCodec`] plugs a
//! shared decoder into `tokio_util`'s framing so the transport can read a
//! connection as a stream of messages.
//!
//! Codec items are `Result`s: a message that was consumed but could not be
//! decoded comes out as an `Err` item and the stream goes on. A fatal error
//! ends the stream.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec;

use dfs_core::config::{DecoderKind, NetworkConfig};
use dfs_core::wire::{self, WireError, FRAME_HEADER_LEN};

use crate::error::DecodeError;

/// Cuts message payloads out of a connection's read buffer.
pub trait Decoder: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Largest single read the transport issues on a connection.
    fn read_size(&self) -> usize;

    /// Remove one message from the front of `src`.
    ///
    /// `Ok(None)` means more bytes are needed. On a non-fatal error the
    /// offending message has been removed from `src`.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, DecodeError>;
}

/// Length-naive decoder: every read is one message.
///
/// There is no framing. Each read of at most `max_read` bytes becomes one
/// payload, so message boundaries are whatever the network delivered per
/// read. A sender's message larger than `max_read`, or two small messages
/// that arrive together, will not come out as sent. Only use this for small
/// single-shot payloads; [`FramedDecoder`] is the canonical decoder.
#[derive(Debug, Clone, Copy)]
pub struct RawDecoder {
    max_read: usize,
}

impl RawDecoder {
    pub const DEFAULT_MAX_READ: usize = 1024;

    pub fn new(max_read: usize) -> Self {
        Self {
            max_read: max_read.max(1),
        }
    }
}

impl Default for RawDecoder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_READ)
    }
}

impl Decoder for RawDecoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn read_size(&self) -> usize {
        self.max_read
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, DecodeError> {
        if src.is_empty() {
            return Ok(None);
        }
        let n = src.len().min(self.max_read);
        Ok(Some(src.split_to(n).freeze()))
    }
}

/// Decoder for the length-prefixed structured wire format.
///
/// Recovers exact message boundaries regardless of payload size (up to
/// `max_frame`) or how the bytes were split across reads.
#[derive(Debug, Clone, Copy)]
pub struct FramedDecoder {
    max_frame: usize,
}

impl FramedDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FramedDecoder {
    fn default() -> Self {
        Self::new(wire::DEFAULT_MAX_FRAME)
    }
}

impl Decoder for FramedDecoder {
    fn name(&self) -> &'static str {
        "framed"
    }

    fn read_size(&self) -> usize {
        8 * 1024
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, DecodeError> {
        let Some(len) = wire::parse_header(src, self.max_frame)? else {
            return Ok(None);
        };

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let body = src.split_to(len);
        let msg = wire::decode_body(&body)?;
        Ok(Some(Bytes::from(msg.payload)))
    }
}

impl codec::Decoder for RawDecoder {
    type Item = Result<Bytes, DecodeError>;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        lift(<Self as Decoder>::decode(self, src))
    }
}

impl codec::Decoder for FramedDecoder {
    type Item = Result<Bytes, DecodeError>;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        lift(<Self as Decoder>::decode(self, src))
    }
}

/// Writes frames no larger than this decoder accepts.
impl<'a> codec::Encoder<&'a [u8]> for FramedDecoder {
    type Error = WireError;

    fn encode(&mut self, payload: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        wire::encode_frame_into(payload, self.max_frame, dst)
    }
}

/// Framing codec over any shared [`Decoder`].
#[derive(Clone)]
pub struct MessageCodec {
    decoder: Arc<dyn Decoder>,
}

impl MessageCodec {
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self { decoder }
    }
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("decoder", &self.decoder.name())
            .finish()
    }
}

impl codec::Decoder for MessageCodec {
    type Item = Result<Bytes, DecodeError>;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        lift(self.decoder.decode(src))
    }
}

/// Fatal errors fail the stream; the rest become items.
fn lift(
    decoded: Result<Option<Bytes>, DecodeError>,
) -> Result<Option<Result<Bytes, DecodeError>>, DecodeError> {
    match decoded {
        Ok(Some(payload)) => Ok(Some(Ok(payload))),
        Ok(None) => Ok(None),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => Ok(Some(Err(e))),
    }
}

/// Build the decoder selected in config.
pub fn decoder_for(config: &NetworkConfig) -> Arc<dyn Decoder> {
    match config.decoder {
        DecoderKind::Raw => Arc::new(RawDecoder::new(config.raw_read_bytes)),
        DecoderKind::Framed => Arc::new(FramedDecoder::new(config.max_frame_bytes)),
    }
}
