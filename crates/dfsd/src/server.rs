//! File server: ties the transport to the store.
//!
//! Every payload that arrives from a peer is persisted into the store.
//! Local files go in through [`FileServer::store_file`].

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dfs_p2p::{Rpc, TcpTransport};
use dfs_store::{CasStore, ContentPath};

pub struct FileServer {
    store: Arc<CasStore>,
    transport: TcpTransport,
    bootstrap_peers: Vec<String>,
}

impl FileServer {
    pub fn new(store: Arc<CasStore>, transport: TcpTransport, bootstrap_peers: Vec<String>) -> Self {
        Self {
            store,
            transport,
            bootstrap_peers,
        }
    }

    pub fn store(&self) -> &CasStore {
        &self.store
    }

    pub fn transport(&self) -> &TcpTransport {
        &self.transport
    }

    /// Listen, dial the bootstrap peers and start persisting inbound
    /// payloads. The returned task ends once the transport is closed.
    pub async fn start(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = self
            .transport
            .listen_and_accept()
            .await
            .context("failed to start transport")?;
        let rx = self
            .transport
            .consume()
            .context("consume channel already taken")?;

        for peer in &self.bootstrap_peers {
            match self.transport.dial(peer).await {
                Ok(_) => tracing::info!(peer = %peer, "connected to bootstrap peer"),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "bootstrap dial failed"),
            }
        }

        let task = tokio::spawn(consume_loop(self.store.clone(), rx));
        Ok((addr, task))
    }

    /// Persist a local file.
    pub async fn store_file<R>(&self, reader: R) -> Result<ContentPath>
    where
        R: Read + Send + 'static,
    {
        let store = self.store.clone();
        let path = tokio::task::spawn_blocking(move || store.write_stream(reader))
            .await
            .context("store task panicked")?
            .context("failed to store file")?;
        tracing::info!(hash = %path.hash, "file stored");
        Ok(path)
    }
}

async fn consume_loop(store: Arc<CasStore>, mut rx: mpsc::Receiver<Rpc>) {
    while let Some(rpc) = rx.recv().await {
        let from = rpc.from;
        let bytes = rpc.payload.len();
        let store = store.clone();
        let written = tokio::task::spawn_blocking(move || store.write_bytes(&rpc.payload)).await;
        match written {
            Ok(Ok(path)) => {
                tracing::info!(peer = %from, hash = %path.hash, bytes, "stored payload from peer")
            }
            Ok(Err(e)) => tracing::warn!(peer = %from, error = %e, "failed to store payload"),
            Err(e) => tracing::warn!(peer = %from, error = %e, "store task failed"),
        }
    }
    tracing::info!("consume loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use dfs_p2p::TransportOpts;
    use dfs_store::ShardLayout;

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dfsd-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn server(root: &std::path::Path, bootstrap: Vec<String>) -> FileServer {
        let store = CasStore::new(root, ShardLayout::DEFAULT).unwrap();
        let transport = TcpTransport::new(TransportOpts::new("127.0.0.1:0"));
        FileServer::new(Arc::new(store), transport, bootstrap)
    }

    #[tokio::test]
    async fn store_file_persists_local_content() {
        let root = scratch("local");
        let server = server(&root, Vec::new());

        let path = server
            .store_file(std::io::Cursor::new(b"local file".to_vec()))
            .await
            .unwrap();
        assert!(server.store().has(&path.hash));
        assert_eq!(server.store().read(&path.hash).unwrap(), b"local file");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn payloads_from_bootstrap_peer_are_stored() {
        let root_a = scratch("peer-a");
        let root_b = scratch("peer-b");

        let a = server(&root_a, Vec::new());
        let (addr_a, task_a) = a.start().await.unwrap();

        let b = server(&root_b, vec![addr_a.to_string(), "127.0.0.1:1".to_string()]);
        let (_addr_b, task_b) = b.start().await.unwrap();
        assert_eq!(b.transport().peer_count(), 1);

        let expected = b.store_file(std::io::Cursor::new(b"shared".to_vec())).await.unwrap();
        let handle = b.transport().peers().pop().unwrap();
        handle.send_message(b"shared").await.unwrap();

        let mut stored = false;
        for _ in 0..100 {
            if a.store().has(&expected.hash) {
                stored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(stored, "payload never reached the peer's store");

        a.transport().close().await;
        b.transport().close().await;
        task_a.await.unwrap();
        task_b.await.unwrap();

        let _ = std::fs::remove_dir_all(&root_a);
        let _ = std::fs::remove_dir_all(&root_b);
    }

    #[tokio::test]
    async fn start_fails_when_address_is_taken() {
        let root = scratch("taken");
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let store = CasStore::new(&root, ShardLayout::DEFAULT).unwrap();
        let transport = TcpTransport::new(TransportOpts::new(taken.local_addr().unwrap().to_string()));
        let server = FileServer::new(Arc::new(store), transport, Vec::new());

        assert!(server.start().await.is_err());
        let _ = std::fs::remove_dir_all(&root);
    }
}
