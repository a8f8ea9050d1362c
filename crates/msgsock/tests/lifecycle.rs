use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use msgsock::{MessageSocket, ServerListener, SocketConfig, SocketEvent, SocketStatus};
use msgsock_core::{
    CapabilityMap, CapabilityValue, ErrorKind, Message, MessageAddress, MessageType,
};
use msgsock_transport::TlsContext;
use msgsock_transport::mock::MockNetwork;
use tokio::sync::mpsc;

struct Pair {
    _listener: ServerListener<MockNetwork>,
    client: MessageSocket<MockNetwork>,
    server: MessageSocket<MockNetwork>,
    inbound: mpsc::UnboundedReceiver<Message>,
}

/// 在内存网络上建立一对已连接的套接字，服务端报文汇入 `inbound`。
async fn connected_pair(port: u16) -> Result<Pair> {
    let network = Arc::new(MockNetwork::new());
    let tls = Arc::new(TlsContext::new());
    let url = format!("tcp://10.1.0.1:{port}");
    let listener = ServerListener::listen(
        Arc::clone(&network),
        Arc::clone(&tls),
        SocketConfig::default(),
        &url,
    )
    .await
    .context("listen")?;

    let client = MessageSocket::new(network, tls, SocketConfig::default());
    client.connect(&url).await.context("client connect")?;
    let server = listener
        .next_connection()
        .await
        .context("listener closed before accepting")?;

    let (sink, inbound) = mpsc::unbounded_channel();
    server.on_message(move |message| {
        let _ = sink.send(message.clone());
    });
    assert!(server.ensure_reading().await.context("server handshake")?);
    Ok(Pair {
        _listener: listener,
        client,
        server,
        inbound,
    })
}

fn call(id: u32, payload: &[u8]) -> Message {
    Message::builder(MessageType::Call, MessageAddress::new(id, 1, 2, 3))
        .payload(payload)
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_arrive_in_send_order() -> Result<()> {
    let mut pair = connected_pair(8100).await?;
    assert!(pair.client.is_connected());
    for id in 1..=64 {
        assert!(pair.client.send(call(id, &id.to_le_bytes())));
    }
    for id in 1..=64 {
        let message = pair.inbound.recv().await.context("inbound closed")?;
        assert_eq!(message.id(), id);
        assert_eq!(message.payload().as_ref(), &id.to_le_bytes()[..]);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn capability_messages_are_absorbed_before_delivery() -> Result<()> {
    let mut pair = connected_pair(8101).await?;
    let mut capabilities = CapabilityMap::new();
    capabilities.insert("ClientServerSocket", true);
    capabilities.insert("MetaObjectCache", 3i64);
    assert!(pair.client.send_capabilities(&capabilities));
    assert!(pair.client.send(call(7, b"after")));

    let first = pair.inbound.recv().await.context("inbound closed")?;
    assert_eq!(first.id(), 7);
    let remote = pair.server.remote_capabilities();
    assert_eq!(
        remote.get("ClientServerSocket"),
        Some(&CapabilityValue::Bool(true))
    );
    assert_eq!(remote.get("MetaObjectCache"), Some(&CapabilityValue::Int(3)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_disconnect_reaches_the_other_side() -> Result<()> {
    let pair = connected_pair(8102).await?;
    let mut events = pair.client.subscribe();

    pair.server.disconnect().await.context("server disconnect")?;
    assert_eq!(pair.server.status(), SocketStatus::Disconnected);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .context("no disconnect event")??;
    match event {
        SocketEvent::Disconnected { reason: Some(reason) } => {
            assert_eq!(reason.kind(), ErrorKind::ConnectionClosed);
        }
        other => panic!("unexpected event {other:?}"),
    }
    pair.client.disconnect().await.context("client disconnect")?;
    assert_eq!(pair.client.status(), SocketStatus::Disconnected);
    assert!(!pair.client.send(call(1, b"late")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_socket_can_reconnect() -> Result<()> {
    let pair = connected_pair(8103).await?;
    let mut events = pair.client.subscribe();
    pair.client.disconnect().await.context("disconnect")?;
    assert_eq!(
        events.recv().await.context("event")?,
        SocketEvent::Disconnected { reason: None }
    );

    let url = pair.client.remote_endpoint().context("remote endpoint")?;
    pair.client.connect_url(url).await.context("reconnect")?;
    assert!(pair.client.is_connected());
    assert_eq!(events.recv().await.context("event")?, SocketEvent::Connected);
    Ok(())
}
