//! dfs integration test harness.
//!
//! Tests run real transports over loopback TCP (port 0) and stores in
//! scratch directories under the system temp dir. Each test cleans up the
//! directories it creates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use dfs_p2p::{Rpc, TcpTransport, TransportOpts};

// ── Harness ───────────────────────────────────────────────────────────────────

/// A scratch directory, removed on drop.
pub struct Scratch(pub PathBuf);

impl Scratch {
    pub fn new(name: &str) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "dfs-it-{name}-{}-{n}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        Self(dir)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Start a transport on an ephemeral loopback port and take its channel.
pub async fn listening(
    opts: TransportOpts,
) -> Result<(TcpTransport, std::net::SocketAddr, mpsc::Receiver<Rpc>)> {
    let transport = TcpTransport::new(opts);
    let addr = transport
        .listen_and_accept()
        .await
        .context("listen failed")?;
    let rx = transport.consume().context("channel already taken")?;
    Ok((transport, addr, rx))
}

pub fn loopback() -> TransportOpts {
    TransportOpts::new("127.0.0.1:0")
}

/// Next message, or an error after a few seconds.
pub async fn next(rx: &mut mpsc::Receiver<Rpc>) -> Result<Rpc> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("timed out waiting for a message")?
        .context("channel closed")
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ── Test modules ──────────────────────────────────────────────────────────────

mod exchange;
mod storage;
mod transport;
