//! dfs-p2p: peer-to-peer TCP transport.
//!
//! Accepts and dials TCP connections, runs a handshake on each, asks an
//! optional admission hook, then decodes messages off every connection and
//! publishes them on one consumption channel.

pub mod backoff;
pub mod decoder;
mod error;
pub mod handshake;
pub mod peer;
pub mod transport;

pub use decoder::{decoder_for, Decoder, FramedDecoder, MessageCodec, RawDecoder};
pub use error::{DecodeError, HandshakeError, TransportError};
pub use handshake::{handshake_for, Handshake, HelloHandshake, NopHandshake, NOP_HANDSHAKE};
pub use peer::{new_registry, Peer, PeerHandle, PeerRegistry, TcpPeer};
pub use transport::{ListenerState, OnPeer, Rpc, TcpTransport, Transport, TransportOpts};
