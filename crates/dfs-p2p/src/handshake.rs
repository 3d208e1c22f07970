//! Connection handshakes.
//!
//! A handshake runs exactly once per connection, right after it is accepted
//! or dialed and before any message is read. If it fails the connection is
//! closed and nothing it sent reaches the consumer.

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use dfs_core::config::{HandshakeKind, NetworkConfig};

use crate::error::HandshakeError;
use crate::peer::{Peer, TcpPeer};

pub trait Handshake: Send + Sync + 'static {
    fn shake<'a>(&'a self, peer: &'a mut TcpPeer) -> BoxFuture<'a, Result<(), HandshakeError>>;
}

/// Accepts every peer without exchanging anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

/// Default handshake of a transport.
pub const NOP_HANDSHAKE: NopHandshake = NopHandshake;

impl Handshake for NopHandshake {
    fn shake<'a>(&'a self, _peer: &'a mut TcpPeer) -> BoxFuture<'a, Result<(), HandshakeError>> {
        future::ready(Ok(())).boxed()
    }
}

pub const HELLO_MAGIC: [u8; 4] = *b"DFSH";
pub const PROTOCOL_VERSION: u16 = 1;

const HELLO_LEN: usize = 8;

/// Both sides send an 8-byte hello and check the other's:
///
///   magic "DFSH" | version (u16, big-endian) | 2 reserved zero bytes
///
/// Symmetric, so it works the same on accepted and dialed connections.
#[derive(Debug, Clone, Copy)]
pub struct HelloHandshake {
    version: u16,
}

impl HelloHandshake {
    pub fn new(version: u16) -> Self {
        Self { version }
    }

    fn hello(&self) -> [u8; HELLO_LEN] {
        let mut msg = [0u8; HELLO_LEN];
        msg[0..4].copy_from_slice(&HELLO_MAGIC);
        msg[4..6].copy_from_slice(&self.version.to_be_bytes());
        msg
    }

    fn check(&self, theirs: &[u8; HELLO_LEN]) -> Result<(), HandshakeError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&theirs[0..4]);
        if magic != HELLO_MAGIC {
            return Err(HandshakeError::BadMagic { actual: magic });
        }
        let version = u16::from_be_bytes([theirs[4], theirs[5]]);
        if version != self.version {
            return Err(HandshakeError::IncompatibleVersion {
                ours: self.version,
                theirs: version,
            });
        }
        Ok(())
    }
}

impl Default for HelloHandshake {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

impl Handshake for HelloHandshake {
    fn shake<'a>(&'a self, peer: &'a mut TcpPeer) -> BoxFuture<'a, Result<(), HandshakeError>> {
        async move {
            let stream = peer.stream_mut();
            stream.write_all(&self.hello()).await?;

            let mut theirs = [0u8; HELLO_LEN];
            stream.read_exact(&mut theirs).await?;
            self.check(&theirs)?;

            tracing::debug!(peer = %peer.remote_addr(), version = self.version, "hello handshake complete");
            Ok(())
        }
        .boxed()
    }
}

/// Build the handshake selected in config.
pub fn handshake_for(config: &NetworkConfig) -> Arc<dyn Handshake> {
    match config.handshake {
        HandshakeKind::Nop => Arc::new(NOP_HANDSHAKE),
        HandshakeKind::Hello => Arc::new(HelloHandshake::default()),
    }
}
