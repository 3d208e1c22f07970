//! Peers: live connections to remote nodes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_util::codec::Encoder;

use crate::decoder::FramedDecoder;
use crate::error::TransportError;

/// A remote node reached over one connection.
pub trait Peer {
    fn remote_addr(&self) -> SocketAddr;

    /// True if this node dialed the connection, false if it accepted it.
    fn is_outbound(&self) -> bool;
}

/// A connection that has not finished setup yet.
///
/// Owns the whole stream while the handshake and the admission hook run.
/// Once admitted it is split: the read half stays with the connection's
/// handler, the write half goes into a [`PeerHandle`].
#[derive(Debug)]
pub struct TcpPeer {
    stream: TcpStream,
    remote_addr: SocketAddr,
    outbound: bool,
}

impl TcpPeer {
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, outbound: bool) -> Self {
        Self {
            stream,
            remote_addr,
            outbound,
        }
    }

    /// Raw stream, for handshakes.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Shut the connection down and drop it.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Split into the read half and a handle that writes frames no larger
    /// than `frames` accepts.
    pub(crate) fn into_split(self, frames: FramedDecoder) -> (OwnedReadHalf, PeerHandle) {
        let (reader, writer) = self.stream.into_split();
        let (closed, _) = watch::channel(false);
        let handle = PeerHandle {
            inner: Arc::new(PeerShared {
                remote_addr: self.remote_addr,
                outbound: self.outbound,
                frames,
                writer: Mutex::new(writer),
                closed,
            }),
        };
        (reader, handle)
    }
}

impl Peer for TcpPeer {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }
}

/// An admitted peer. Cheap to clone; every clone refers to the same
/// connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    inner: Arc<PeerShared>,
}

#[derive(Debug)]
struct PeerShared {
    remote_addr: SocketAddr,
    outbound: bool,
    frames: FramedDecoder,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl PeerHandle {
    /// Write raw bytes to the peer.
    ///
    /// Waits while the peer is not reading. Closing the handle aborts the
    /// write with [`TransportError::Shutdown`]; the connection is then
    /// unusable anyway, since part of the bytes may already be out.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Shutdown);
        }
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(bytes).await
        };
        tokio::select! {
            written = write => Ok(written?),
            _ = self.closed() => Err(TransportError::Shutdown),
        }
    }

    /// Send `payload` as one frame of the structured wire format.
    ///
    /// A payload whose frame would exceed the transport's frame limit is
    /// refused with [`TransportError::Encode`] and nothing is written.
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut frames = self.inner.frames;
        let mut frame = BytesMut::new();
        frames.encode(payload, &mut frame)?;
        self.send(&frame).await
    }

    /// Close the connection. Its handler stops reading and no further
    /// messages from it are delivered. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        // Pending sends see the signal and release the writer.
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(peer = %self.inner.remote_addr, error = %e, "shutdown after close");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub(crate) async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        // The sender lives as long as this handle, so this only ends on close.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub(crate) fn same_connection(&self, other: &PeerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Peer for PeerHandle {
    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.inner.outbound
    }
}

/// The peer registry: shared by every connection handler.
/// Keyed on the peer's remote address.
pub type PeerRegistry = Arc<DashMap<SocketAddr, PeerHandle>>;

/// Create a new empty peer registry.
pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}
