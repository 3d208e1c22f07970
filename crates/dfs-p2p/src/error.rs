//! Transport error types.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use dfs_core::wire::WireError;
use thiserror::Error;

/// Errors surfaced by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening address could not be bound. Fatal to startup.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("timed out dialing {addr} after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        source: HandshakeError,
    },

    /// The admission hook refused the peer.
    #[error("peer {addr} rejected: {reason}")]
    Rejected { addr: SocketAddr, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transport is shut down")]
    Shutdown,
}

/// Errors from the per-connection handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no handshake within {0:?}")]
    Timeout(Duration),

    #[error("bad hello magic: {actual:?}")]
    BadMagic { actual: [u8; 4] },

    #[error("incompatible protocol version: {theirs} (ours: {ours})")]
    IncompatibleVersion { ours: u16, theirs: u16 },
}

/// Errors from reading and decoding one message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    #[error("invalid frame magic: {actual:?}")]
    InvalidMagic { actual: [u8; 4] },

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[source] WireError),
}

impl DecodeError {
    /// Whether the connection can no longer be read.
    ///
    /// A malformed message inside a complete frame has already been
    /// consumed, so the next one can still be decoded. Every other error
    /// leaves the stream broken or out of sync.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::Malformed(_))
    }
}

impl From<WireError> for DecodeError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::InvalidMagic { actual, .. } => DecodeError::InvalidMagic { actual },
            WireError::TooLarge { size, max } => DecodeError::FrameTooLarge { size, max },
            WireError::Io(e) => DecodeError::Io(e),
            other => DecodeError::Malformed(other),
        }
    }
}
