//! TCP transport.
//!
//! Connection lifecycle:
//!
//!   accepted / dialed → handshake → admission hook → registered → reading
//!
//! Every connection gets its own task. Decoded messages from all of them
//! are pushed onto one bounded channel handed out by [`TcpTransport::consume`].
//! A full channel blocks the pushing connection until the consumer catches up.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;

use dfs_core::config::NetworkConfig;
use dfs_core::wire::DEFAULT_MAX_FRAME;

use crate::backoff::{AcceptBackoff, Retry};
use crate::decoder::{decoder_for, Decoder, FramedDecoder, MessageCodec};
use crate::error::{DecodeError, HandshakeError, TransportError};
use crate::handshake::{handshake_for, Handshake, NOP_HANDSHAKE};
use crate::peer::{new_registry, Peer, PeerHandle, PeerRegistry, TcpPeer};

/// One decoded message and the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Bytes,
}

/// Admission hook, called after the handshake. An error rejects the peer
/// and closes its connection before anything is read from it.
pub type OnPeer = Arc<dyn Fn(&TcpPeer) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct TransportOpts {
    pub listen_addr: String,
    pub decoder: Arc<dyn Decoder>,
    /// Largest frame body sent to peers. Keep it within what they accept.
    pub max_frame: usize,
    pub handshake: Arc<dyn Handshake>,
    pub on_peer: Option<OnPeer>,
    pub channel_capacity: usize,
    pub handshake_timeout: Duration,
    /// None = a connection may stay silent forever.
    pub idle_timeout: Option<Duration>,
    pub dial_timeout: Duration,
    pub accept_backoff: Duration,
    pub accept_backoff_max: Duration,
    /// 0 = never give up.
    pub max_accept_failures: u32,
}

impl TransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            decoder: Arc::new(FramedDecoder::default()),
            max_frame: DEFAULT_MAX_FRAME,
            handshake: Arc::new(NOP_HANDSHAKE),
            on_peer: None,
            channel_capacity: 64,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            dial_timeout: Duration::from_secs(10),
            accept_backoff: Duration::from_millis(5),
            accept_backoff_max: Duration::from_secs(1),
            max_accept_failures: 0,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            decoder: decoder_for(config),
            max_frame: config.max_frame_bytes,
            handshake: handshake_for(config),
            on_peer: None,
            channel_capacity: config.channel_capacity,
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
            dial_timeout: config.dial_timeout(),
            accept_backoff: Duration::from_millis(config.accept_backoff_ms),
            accept_backoff_max: Duration::from_millis(config.accept_backoff_max_ms),
            max_accept_failures: config.max_accept_failures,
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_on_peer<F>(mut self, on_peer: F) -> Self
    where
        F: Fn(&TcpPeer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_peer = Some(Arc::new(on_peer));
        self
    }
}

impl fmt::Debug for TransportOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOpts")
            .field("listen_addr", &self.listen_addr)
            .field("decoder", &self.decoder.name())
            .field("max_frame", &self.max_frame)
            .field("on_peer", &self.on_peer.is_some())
            .field("channel_capacity", &self.channel_capacity)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

/// Where the listener is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening(SocketAddr),
    /// Accepting kept failing and the listener was dropped. Listening
    /// again binds a new one.
    Failed(SocketAddr),
    Closed,
}

/// Anything that moves messages between this node and its peers.
pub trait Transport: Send + Sync {
    /// Bind and start accepting in the background. Returns the bound address.
    fn listen_and_accept(&self) -> BoxFuture<'_, Result<SocketAddr, TransportError>>;

    /// The inbound message channel. Handed out once; later calls get `None`.
    fn consume(&self) -> Option<mpsc::Receiver<Rpc>>;

    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<PeerHandle, TransportError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// The TCP [`Transport`]. Cheap to clone; clones share the listener, the
/// peers and the channel.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    opts: TransportOpts,
    listener: watch::Sender<ListenerState>,
    tx: Mutex<Option<mpsc::Sender<Rpc>>>,
    rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    registry: PeerRegistry,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn sender(&self) -> Option<mpsc::Sender<Rpc>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// The accept loop for `addr` gave up.
    fn listener_failed(&self, addr: SocketAddr) {
        self.listener.send_if_modified(|state| {
            if *state != ListenerState::Listening(addr) {
                return false;
            }
            *state = ListenerState::Failed(addr);
            true
        });
    }
}

impl TcpTransport {
    pub fn new(opts: TransportOpts) -> Self {
        let (tx, rx) = mpsc::channel(opts.channel_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let (listener, _) = watch::channel(ListenerState::Idle);
        Self {
            inner: Arc::new(Inner {
                opts,
                listener,
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                registry: new_registry(),
                shutdown,
            }),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(TransportOpts::from_config(config))
    }

    /// Bind the listen address and spawn the accept loop.
    ///
    /// A bind failure is returned and no loop is started. After the accept
    /// loop has given up this may be called again.
    pub async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        if self.inner.is_shut_down() {
            return Err(TransportError::Shutdown);
        }
        if let ListenerState::Listening(addr) = self.listener_state() {
            return Err(TransportError::AlreadyListening(addr));
        }

        let listen_addr = &self.inner.opts.listen_addr;
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: listen_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;
        let mut refused = None;
        self.inner.listener.send_if_modified(|state| match *state {
            ListenerState::Listening(current) => {
                refused = Some(TransportError::AlreadyListening(current));
                false
            }
            ListenerState::Closed => {
                refused = Some(TransportError::Shutdown);
                false
            }
            ListenerState::Idle | ListenerState::Failed(_) => {
                *state = ListenerState::Listening(addr);
                true
            }
        });
        if let Some(err) = refused {
            return Err(err);
        }

        tracing::info!(
            addr = %addr,
            decoder = self.inner.opts.decoder.name(),
            "transport listening"
        );
        tokio::spawn(accept_loop(self.inner.clone(), listener, addr));
        Ok(addr)
    }

    /// Address the listener is bound to, while it is accepting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.listener_state() {
            ListenerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn listener_state(&self) -> ListenerState {
        *self.inner.listener.borrow()
    }

    /// Follow listener state changes, e.g. to notice the accept loop
    /// giving up.
    pub fn watch_listener(&self) -> watch::Receiver<ListenerState> {
        self.inner.listener.subscribe()
    }

    /// Take the inbound message channel.
    ///
    /// Messages from one connection arrive in the order they were decoded.
    /// There is no ordering across connections. The channel ends after
    /// [`close`](Self::close) once every connection handler has exited.
    pub fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.inner
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Connect to `addr` and run the same setup as an accepted connection.
    /// Messages the remote sends back surface on the consume channel.
    pub async fn dial(&self, addr: &str) -> Result<PeerHandle, TransportError> {
        if self.inner.is_shut_down() {
            return Err(TransportError::Shutdown);
        }

        let timeout = self.inner.opts.dial_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Dial {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::DialTimeout {
                    addr: addr.to_string(),
                    timeout,
                })
            }
        };
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %remote, error = %e, "set_nodelay failed");
        }

        let peer = TcpPeer::new(stream, remote, true);
        let (reader, handle, registration) = establish(&self.inner, peer).await?;
        tokio::spawn(read_loop(
            self.inner.clone(),
            reader,
            handle.clone(),
            registration,
        ));

        tracing::info!(peer = %remote, "dialed peer");
        Ok(handle)
    }

    /// Admitted peers, as of now.
    pub fn peers(&self) -> Vec<PeerHandle> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<PeerHandle> {
        self.inner.registry.get(addr).map(|entry| entry.value().clone())
    }

    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Stop accepting, close every peer and end the consume channel.
    ///
    /// Does not wait for peers that are not reading: their pending sends
    /// are aborted.
    pub async fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.listener.send_replace(ListenerState::Closed);
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let peers = self.peers();
        future::join_all(peers.iter().map(|peer| peer.close())).await;
        tracing::info!(peers = peers.len(), "transport closed");
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("listener", &self.listener_state())
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl Transport for TcpTransport {
    fn listen_and_accept(&self) -> BoxFuture<'_, Result<SocketAddr, TransportError>> {
        TcpTransport::listen_and_accept(self).boxed()
    }

    fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        TcpTransport::consume(self)
    }

    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<PeerHandle, TransportError>> {
        TcpTransport::dial(self, addr).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        TcpTransport::close(self).boxed()
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, addr: SocketAddr) {
    let mut shutdown = inner.shutdown.subscribe();
    let opts = &inner.opts;
    let mut backoff = AcceptBackoff::new(
        opts.accept_backoff,
        opts.accept_backoff_max,
        opts.max_accept_failures,
    );

    loop {
        let accepted = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                tracing::info!("accept loop shutting down");
                return;
            }
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, remote)) => {
                backoff.on_success();
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %remote, error = %e, "set_nodelay failed");
                }
                tracing::debug!(peer = %remote, "accepted connection");
                tokio::spawn(handle_inbound(
                    inner.clone(),
                    TcpPeer::new(stream, remote, false),
                ));
            }
            Err(e) => match backoff.on_failure() {
                Retry::After(delay) => {
                    tracing::warn!(
                        error = %e,
                        failures = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "accept failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Retry::GiveUp => {
                    tracing::error!(
                        addr = %addr,
                        error = %e,
                        failures = backoff.failures(),
                        "accept keeps failing, listener stopped"
                    );
                    inner.listener_failed(addr);
                    return;
                }
            },
        }
    }
}

async fn handle_inbound(inner: Arc<Inner>, peer: TcpPeer) {
    let addr = peer.remote_addr();
    let mut shutdown = inner.shutdown.subscribe();

    let established = tokio::select! {
        _ = shutdown_requested(&mut shutdown) => return,
        result = establish(&inner, peer) => result,
    };
    match established {
        Ok((reader, handle, registration)) => {
            read_loop(inner, reader, handle, registration).await;
        }
        Err(e) => {
            tracing::warn!(peer = %addr, error = %e, "dropping connection");
        }
    }
}

// ── Per-connection setup ──────────────────────────────────────────────────────

/// Handshake, then admission, then registration. The peer is closed on
/// every failure.
async fn establish(
    inner: &Inner,
    mut peer: TcpPeer,
) -> Result<(OwnedReadHalf, PeerHandle, Registration), TransportError> {
    let addr = peer.remote_addr();
    let timeout = inner.opts.handshake_timeout;

    let shaken = match tokio::time::timeout(timeout, inner.opts.handshake.shake(&mut peer)).await
    {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout(timeout)),
    };
    if let Err(source) = shaken {
        close_quietly(peer).await;
        return Err(TransportError::Handshake { addr, source });
    }

    if let Some(on_peer) = &inner.opts.on_peer {
        if let Err(e) = on_peer(&peer) {
            close_quietly(peer).await;
            return Err(TransportError::Rejected {
                addr,
                reason: format!("{e:#}"),
            });
        }
    }

    let (reader, handle) = peer.into_split(FramedDecoder::new(inner.opts.max_frame));
    let registration = Registration::new(inner.registry.clone(), handle.clone());
    tracing::debug!(peer = %addr, outbound = handle.is_outbound(), "peer admitted");
    Ok((reader, handle, registration))
}

async fn close_quietly(peer: TcpPeer) {
    let addr = peer.remote_addr();
    if let Err(e) = peer.close().await {
        tracing::trace!(peer = %addr, error = %e, "close after failed setup");
    }
}

/// Holds a peer's registry entry for the life of its handler.
struct Registration {
    registry: PeerRegistry,
    handle: PeerHandle,
}

impl Registration {
    fn new(registry: PeerRegistry, handle: PeerHandle) -> Self {
        registry.insert(handle.remote_addr(), handle.clone());
        Self { registry, handle }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let handle = &self.handle;
        self.registry
            .remove_if(&handle.remote_addr(), |_, current| current.same_connection(handle));
    }
}

// ── Read loop ─────────────────────────────────────────────────────────────────

type Messages = FramedRead<OwnedReadHalf, MessageCodec>;

/// What happened next on a connection.
enum Event {
    Message(Bytes),
    /// A message was consumed but could not be decoded.
    Skipped(DecodeError),
    Failed(DecodeError),
    Eof,
    Idle,
    Stopped,
}

async fn read_loop(
    inner: Arc<Inner>,
    reader: OwnedReadHalf,
    handle: PeerHandle,
    _registration: Registration,
) {
    let addr = handle.remote_addr();
    let Some(tx) = inner.sender() else {
        handle.close().await;
        return;
    };
    let decoder = inner.opts.decoder.clone();
    let idle_timeout = inner.opts.idle_timeout;
    let mut shutdown = inner.shutdown.subscribe();
    let mut messages = FramedRead::with_capacity(
        reader,
        MessageCodec::new(decoder.clone()),
        decoder.read_size(),
    );

    loop {
        let event = tokio::select! {
            event = next_event(&mut messages, idle_timeout) => event,
            _ = handle.closed() => Event::Stopped,
            _ = shutdown_requested(&mut shutdown) => Event::Stopped,
        };
        match event {
            Event::Message(payload) => {
                let rpc = Rpc {
                    from: addr,
                    payload,
                };
                tokio::select! {
                    sent = tx.send(rpc) => {
                        if sent.is_err() {
                            tracing::debug!(peer = %addr, "consumer gone");
                            break;
                        }
                    }
                    _ = handle.closed() => break,
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
            Event::Skipped(e) => {
                tracing::debug!(peer = %addr, error = %e, "skipping undecodable message");
            }
            Event::Failed(e) => {
                tracing::warn!(peer = %addr, error = %e, "unrecoverable decode error");
                break;
            }
            Event::Eof => {
                tracing::debug!(peer = %addr, "peer disconnected");
                break;
            }
            Event::Idle => {
                tracing::warn!(peer = %addr, "connection idle, dropping");
                break;
            }
            Event::Stopped => break,
        }
    }

    handle.close().await;
}

/// Next message off the connection. With an idle timeout set, a connection
/// that completes no message within it is given up on.
async fn next_event(messages: &mut Messages, idle_timeout: Option<Duration>) -> Event {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, messages.next()).await {
            Ok(next) => next,
            Err(_) => return Event::Idle,
        },
        None => messages.next().await,
    };
    match next {
        Some(Ok(Ok(payload))) => Event::Message(payload),
        Some(Ok(Err(e))) => Event::Skipped(e),
        Some(Err(e)) => Event::Failed(e),
        None => Event::Eof,
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
