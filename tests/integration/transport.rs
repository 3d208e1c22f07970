use crate::*;

use std::sync::Arc;

use dfs_core::config::{DecoderKind, HandshakeKind, NetworkConfig};
use dfs_core::encode_frame;
use dfs_core::wire::DEFAULT_MAX_FRAME;
use dfs_p2p::{HelloHandshake, Peer, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Many connections at once: every message arrives, and each
/// connection's messages keep their order.
#[tokio::test]
async fn test_concurrent_peers_keep_per_connection_order() -> Result<()> {
    const PEERS: usize = 8;
    const MESSAGES: usize = 50;

    let (_transport, addr, mut rx) = listening(loopback()).await?;

    let mut senders = Vec::new();
    let mut client_addrs = Vec::new();
    for p in 0..PEERS {
        let mut stream = TcpStream::connect(addr).await?;
        client_addrs.push(stream.local_addr()?);
        senders.push(tokio::spawn(async move {
            for m in 0..MESSAGES {
                let frame = encode_frame(format!("{p}:{m}").as_bytes(), DEFAULT_MAX_FRAME)?;
                stream.write_all(&frame).await?;
            }
            anyhow::Ok(stream)
        }));
    }

    let mut seen = vec![0usize; PEERS];
    for _ in 0..PEERS * MESSAGES {
        let rpc = next(&mut rx).await?;
        let text = String::from_utf8(rpc.payload.to_vec())?;
        let (p, m) = text.split_once(':').context("bad payload")?;
        let (p, m): (usize, usize) = (p.parse()?, m.parse()?);
        assert_eq!(rpc.from, client_addrs[p], "payload stamped with wrong sender");
        assert_eq!(m, seen[p], "peer {p} out of order");
        seen[p] += 1;
    }
    assert!(seen.iter().all(|&n| n == MESSAGES));

    for sender in senders {
        sender.await??;
    }
    Ok(())
}

/// A slow consumer holds senders back without losing anything.
#[tokio::test]
async fn test_slow_consumer_applies_backpressure() -> Result<()> {
    let mut opts = loopback();
    opts.channel_capacity = 1;
    let (_transport, addr, mut rx) = listening(opts).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let mut bytes = Vec::new();
    for i in 0..20u32 {
        bytes.extend_from_slice(&encode_frame(&i.to_be_bytes(), DEFAULT_MAX_FRAME)?);
    }
    stream.write_all(&bytes).await?;

    for i in 0..20u32 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rpc = next(&mut rx).await?;
        assert_eq!(rpc.payload, &i.to_be_bytes()[..]);
    }
    Ok(())
}

#[tokio::test]
async fn test_transport_built_from_config() -> Result<()> {
    let config = NetworkConfig {
        listen_addr: "127.0.0.1:0".into(),
        decoder: DecoderKind::Raw,
        handshake: HandshakeKind::Hello,
        ..NetworkConfig::default()
    };
    let server = TcpTransport::from_config(&config);
    let addr = server.listen_and_accept().await?;
    let mut rx = server.consume().context("channel already taken")?;

    let client = TcpTransport::from_config(&config);
    let handle = client.dial(&addr.to_string()).await?;
    handle.send(b"raw bytes").await?;

    let rpc = next(&mut rx).await?;
    assert_eq!(rpc.payload, &b"raw bytes"[..]);
    Ok(())
}

#[tokio::test]
async fn test_idle_connection_is_dropped() -> Result<()> {
    let mut opts = loopback();
    opts.idle_timeout = Some(Duration::from_millis(200));
    let (transport, addr, mut rx) = listening(opts).await?;

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&encode_frame(b"awake", DEFAULT_MAX_FRAME)?).await?;
    next(&mut rx).await?;
    assert_eq!(transport.peer_count(), 1);

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .context("idle connection was never closed")??;
    assert!(wait_until(|| transport.peer_count() == 0).await);
    Ok(())
}

#[tokio::test]
async fn test_admission_hook_sees_direction() -> Result<()> {
    let opts = loopback().with_on_peer(|peer| {
        anyhow::ensure!(!peer.is_outbound(), "listener only accepts");
        Ok(())
    });
    let (server, addr, mut rx) = listening(opts).await?;

    let client = TcpTransport::new(loopback());
    let handle = client.dial(&addr.to_string()).await?;
    assert!(handle.is_outbound());
    handle.send_message(b"admitted").await?;

    let rpc = next(&mut rx).await?;
    assert_eq!(rpc.payload, &b"admitted"[..]);
    assert!(server.peer(&rpc.from).is_some());
    Ok(())
}

#[tokio::test]
async fn test_hello_mismatch_keeps_listener_alive() -> Result<()> {
    let (_server, addr, mut rx) =
        listening(loopback().with_handshake(Arc::new(HelloHandshake::new(1)))).await?;

    let stranger = TcpTransport::new(loopback().with_handshake(Arc::new(HelloHandshake::new(9))));
    let err = stranger.dial(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, TransportError::Handshake { .. }));

    let friend = TcpTransport::new(loopback().with_handshake(Arc::new(HelloHandshake::new(1))));
    friend.dial(&addr.to_string()).await?.send_message(b"hi").await?;
    assert_eq!(next(&mut rx).await?.payload, &b"hi"[..]);
    Ok(())
}

#[tokio::test]
async fn test_close_disconnects_remote_peers() -> Result<()> {
    let (server, addr, _rx) = listening(loopback()).await?;
    let client = TcpTransport::new(loopback());
    let handle = client.dial(&addr.to_string()).await?;
    assert!(wait_until(|| server.peer_count() == 1).await);

    server.close().await;

    // The dialer's read loop sees end-of-stream and drops the peer
    assert!(wait_until(|| client.peer_count() == 0).await);
    assert!(handle.is_closed());
    assert!(matches!(
        server.dial(&addr.to_string()).await,
        Err(TransportError::Shutdown)
    ));
    Ok(())
}
