//! dfsd: content-addressed file node daemon.

use std::sync::Arc;

use anyhow::{Context, Result};

use dfs_core::config::DfsConfig;
use dfs_p2p::{ListenerState, TcpTransport};
use dfs_store::CasStore;

mod server;

use server::FileServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = DfsConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = DfsConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DfsConfig::default()
    });

    // dfsd [listen_addr] [file...]
    let mut args = std::env::args().skip(1);
    if let Some(listen_addr) = args.next() {
        config.network.listen_addr = listen_addr;
    }
    let files: Vec<String> = args.collect();
    tracing::info!(listen_addr = %config.network.listen_addr, "dfsd starting");

    // Store
    let store = CasStore::from_config(&config.storage).with_context(|| {
        format!(
            "failed to open store at {}",
            config.storage.root.display()
        )
    })?;

    let server = FileServer::new(
        Arc::new(store),
        TcpTransport::from_config(&config.network),
        config.network.bootstrap_peers.clone(),
    );
    tracing::info!(
        root = %server.store().root().display(),
        objects = server.store().count(),
        "store ready"
    );
    let (addr, consume_task) = server.start().await?;
    tracing::info!(addr = %addr, "dfsd running");

    for file in files {
        let reader = std::fs::File::open(&file).with_context(|| format!("failed to open {file}"))?;
        let path = server.store_file(reader).await?;
        tracing::info!(file = %file, hash = %path.hash, "added file");
    }

    let mut listener = server.transport().watch_listener();
    let listener_failed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            false
        }
        state = listener.wait_for(|state| matches!(state, ListenerState::Failed(_))) => state.is_ok(),
    };
    tracing::info!(listener_failed, "shutting down");

    server.transport().close().await;
    if let Err(e) = consume_task.await {
        tracing::warn!(error = %e, "consume task failed");
    }
    if listener_failed {
        anyhow::bail!("listener on {addr} stopped accepting connections");
    }
    Ok(())
}
