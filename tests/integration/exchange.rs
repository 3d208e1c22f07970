//! Node-to-node: content sent over the transport lands in the receiver's
//! store under the same address the sender computes locally.

use crate::*;

use std::sync::Arc;

use dfs_p2p::HelloHandshake;
use dfs_store::{CasStore, ShardLayout};

#[tokio::test]
async fn test_sent_file_is_stored_under_same_hash() -> Result<()> {
    let sender_dir = Scratch::new("sender");
    let receiver_dir = Scratch::new("receiver");
    let sender_store = CasStore::new(&sender_dir.0, ShardLayout::DEFAULT)?;
    let receiver_store = Arc::new(CasStore::new(&receiver_dir.0, ShardLayout::DEFAULT)?);

    let hello = || loopback().with_handshake(Arc::new(HelloHandshake::default()));
    let (receiver, addr, mut rx) = listening(hello()).await?;
    let sender = TcpTransport::new(hello());

    // Bigger than a single raw read, so it only survives framing intact
    let content: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let local = sender_store.write_bytes(&content)?;

    let peer = sender.dial(&addr.to_string()).await?;
    peer.send_message(&sender_store.read(&local.hash)?).await?;

    let rpc = next(&mut rx).await?;
    let store = receiver_store.clone();
    let remote = tokio::task::spawn_blocking(move || store.write_bytes(&rpc.payload)).await??;

    assert_eq!(remote, local);
    assert_eq!(receiver_store.read(&remote.hash)?, content);

    sender.close().await;
    receiver.close().await;
    Ok(())
}

#[tokio::test]
async fn test_both_directions_share_one_connection() -> Result<()> {
    let (server, addr, mut server_rx) = listening(loopback()).await?;
    let client = TcpTransport::new(loopback());
    let mut client_rx = client.consume().context("channel already taken")?;

    let outbound = client.dial(&addr.to_string()).await?;
    outbound.send_message(b"request").await?;
    let request = next(&mut server_rx).await?;

    server
        .peer(&request.from)
        .context("sender not registered")?
        .send_message(b"response")
        .await?;
    let response = next(&mut client_rx).await?;
    assert_eq!(response.from, addr);
    assert_eq!(response.payload, &b"response"[..]);
    Ok(())
}
