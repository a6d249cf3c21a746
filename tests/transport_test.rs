use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use wirelink::{
    BufferPools, Client, Event, Message, MessageHandler, Peer, Server, TransportConfig,
    TransportError, HANDSHAKE_ACCEPTED,
};

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl MessageHandler for Recorder {
    fn on_connected(&self, connection_id: u32) {
        let _ = self.tx.send(Event::Connected(connection_id));
    }

    fn on_disconnected(&self, connection_id: u32) {
        let _ = self.tx.send(Event::Disconnected(connection_id));
    }

    fn on_data_received(&self, connection_id: u32, message: Message) {
        let _ = self.tx.send(Event::Data(connection_id, message));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn read_payload(message: &Message) -> Vec<u8> {
    let mut payload = vec![0u8; message.size()];
    message.read_bytes(&mut payload).unwrap();
    payload
}

async fn started_server(
    config: TransportConfig,
) -> (Server, SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let (handler, rx) = recorder();
    let server = Server::new(config, handler);
    let addr = server.start(any_addr()).await.unwrap();
    (server, addr, rx)
}

async fn connected_client(addr: SocketAddr) -> (Client, mpsc::UnboundedReceiver<Event>) {
    let (handler, mut rx) = recorder();
    let client = Client::new(TransportConfig::default(), handler);
    client.connect(addr).await.unwrap();
    match next_event(&mut rx).await {
        Event::Connected(0) => {}
        other => panic!("expected client connected event, got {:?}", other),
    }
    (client, rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_send_and_server_receives() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connected_client(addr).await);
    }

    let mut connected_ids = HashSet::new();
    for _ in 0..3 {
        match next_event(&mut server_rx).await {
            Event::Connected(id) => assert!(connected_ids.insert(id)),
            other => panic!("expected connected event, got {:?}", other),
        }
    }
    assert_eq!(connected_ids, HashSet::from([1, 2, 3]));
    assert_eq!(server.connection_count(), 3);

    for (client, _) in &clients {
        let message = client.pools().pop();
        message.write_bytes(b"ping").unwrap();
        assert!(client.send(message));
    }

    let mut senders = HashSet::new();
    for _ in 0..3 {
        match next_event(&mut server_rx).await {
            Event::Data(id, message) => {
                assert_eq!(read_payload(&message), b"ping");
                assert!(senders.insert(id));
            }
            other => panic!("expected data event, got {:?}", other),
        }
    }
    assert_eq!(senders, connected_ids);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_replies_to_client() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;
    let (client, mut client_rx) = connected_client(addr).await;

    let sender_id = match next_event(&mut server_rx).await {
        Event::Connected(id) => id,
        other => panic!("expected connected event, got {:?}", other),
    };

    let request = client.pools().pop();
    request.write_str(Some("hello")).unwrap();
    assert!(client.send(request));

    match next_event(&mut server_rx).await {
        Event::Data(id, message) => {
            assert_eq!(id, sender_id);
            assert_eq!(message.read_str().unwrap().as_deref(), Some("hello"));
        }
        other => panic!("expected data event, got {:?}", other),
    }

    let reply = server.pools().pop();
    reply.write_str(Some("world")).unwrap();
    assert!(server.send(sender_id, reply));

    match next_event(&mut client_rx).await {
        Event::Data(0, message) => {
            assert_eq!(message.read_str().unwrap().as_deref(), Some("world"));
        }
        other => panic!("expected data event, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_fires_exactly_once_and_leaves_others_alone() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;

    let (leaver, mut leaver_rx) = connected_client(addr).await;
    let (stayer, _stayer_rx) = connected_client(addr).await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        match next_event(&mut server_rx).await {
            Event::Connected(id) => ids.push(id),
            other => panic!("expected connected event, got {:?}", other),
        }
    }

    leaver.disconnect().await;
    match next_event(&mut leaver_rx).await {
        Event::Disconnected(0) => {}
        other => panic!("expected client disconnected event, got {:?}", other),
    }

    let gone = match next_event(&mut server_rx).await {
        Event::Disconnected(id) => id,
        other => panic!("expected disconnected event, got {:?}", other),
    };
    assert!(ids.contains(&gone));
    assert_eq!(server.connection_count(), 1);

    // the surviving connection still carries traffic
    let survivor = ids.into_iter().find(|id| *id != gone).unwrap();
    let message = stayer.pools().pop();
    message.write_bytes(b"still here").unwrap();
    assert!(stayer.send(message));
    match next_event(&mut server_rx).await {
        Event::Data(id, message) => {
            assert_eq!(id, survivor);
            assert_eq!(read_payload(&message), b"still here");
        }
        other => panic!("expected data event, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_disconnect_yields_single_event() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;
    let (client, _client_rx) = connected_client(addr).await;
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    // both ends race to tear the same session down
    let remote_side = tokio::spawn(async move {
        client.disconnect().await;
        client
    });
    server.disconnect(1);
    remote_side.await.unwrap();

    match next_event(&mut server_rx).await {
        Event::Disconnected(1) => {}
        other => panic!("expected disconnected event, got {:?}", other),
    }

    // no second disconnected event may follow
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server_rx.try_recv().is_err());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_beyond_capacity_is_rejected() {
    let config = TransportConfig {
        max_connections: 1,
        ..TransportConfig::default()
    };
    let (server, addr, mut server_rx) = started_server(config).await;

    let (_keeper, _keeper_rx) = connected_client(addr).await;
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    let (handler, _rx) = recorder();
    let rejected = Client::new(TransportConfig::default(), handler);
    match rejected.connect(addr).await {
        Err(TransportError::ConnectionRejected) => {}
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(server.connection_count(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_interrupts_writer_blocked_on_full_socket() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;

    // a raw peer that completes the handshake and then never reads
    let mut stalled = tokio::net::TcpStream::connect(addr).await.unwrap();
    assert_eq!(stalled.read_u8().await.unwrap(), HANDSHAKE_ACCEPTED);
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    // flood far past the kernel buffer capacity so a write blocks mid-frame
    let payload = vec![0u8; 60_000];
    for _ in 0..64 {
        let message = server.pools().pop();
        message.write_bytes(&payload).unwrap();
        assert!(server.send(1, message));
    }

    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop stalled behind a blocked write");
    drop(stalled);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_covers_connections_admitted_while_stopping() {
    let (server, addr, _server_rx) = started_server(TransportConfig::default()).await;

    let (handler, mut client_rx) = recorder();
    let client = Client::new(TransportConfig::default(), handler);
    let connecting = tokio::spawn(async move {
        let result = client.connect(addr).await;
        (client, result)
    });
    server.stop().await;
    assert!(!server.is_running());

    let (_client, result) = connecting.await.unwrap();
    if result.is_ok() {
        // admitted during shutdown; stop must still have torn it down
        match next_event(&mut client_rx).await {
            Event::Connected(0) => {}
            other => panic!("expected connected event, got {:?}", other),
        }
        match next_event(&mut client_rx).await {
            Event::Disconnected(0) => {}
            other => panic!("expected disconnected event, got {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn client_peer_rejects_unknown_connection_ids() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;
    let (client, _client_rx) = connected_client(addr).await;
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    let message = client.pools().pop();
    message.write_bytes(b"stray").unwrap();
    assert!(!Peer::send(&client, 42, message));
    assert!(Peer::remote_address(&client, 42).is_none());
    assert!(Peer::remote_address(&client, 0).is_some());

    // a disconnect aimed at an unknown id must not touch the live slot
    Peer::disconnect(&client, 42);
    let message = client.pools().pop();
    message.write_bytes(b"still up").unwrap();
    assert!(Peer::send(&client, 0, message));
    match next_event(&mut server_rx).await {
        Event::Data(1, message) => assert_eq!(read_payload(&message), b"still up"),
        other => panic!("expected data event, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slot_ids_are_recycled_after_disconnect() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;

    let (first, _first_rx) = connected_client(addr).await;
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    first.disconnect().await;
    match next_event(&mut server_rx).await {
        Event::Disconnected(1) => {}
        other => panic!("expected disconnected event, got {:?}", other),
    }

    // wait for the slot to be recycled before reconnecting
    timeout(Duration::from_secs(5), async {
        while server.connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never dropped");

    let (_second, _second_rx) = connected_client(addr).await;
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected recycled connection id, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn send_multi_shares_one_message_across_recipients() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;

    let (_a, mut a_rx) = connected_client(addr).await;
    let (_b, mut b_rx) = connected_client(addr).await;
    for _ in 0..2 {
        match next_event(&mut server_rx).await {
            Event::Connected(_) => {}
            other => panic!("expected connected event, got {:?}", other),
        }
    }

    let broadcast = server.pools().pop();
    broadcast.write_bytes(b"fan out").unwrap();
    assert!(server.send_multi(&[1, 2], broadcast));

    for rx in [&mut a_rx, &mut b_rx] {
        match next_event(rx).await {
            Event::Data(0, message) => assert_eq!(read_payload(&message), b"fan out"),
            other => panic!("expected data event, got {:?}", other),
        }
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn large_message_spans_many_chunks() {
    let (server, addr, mut server_rx) = started_server(TransportConfig::default()).await;
    let (client, _client_rx) = connected_client(addr).await;
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let message = client.pools().pop();
    message.write_bytes(&payload).unwrap();
    assert!(client.send(message));

    match next_event(&mut server_rx).await {
        Event::Data(1, message) => assert_eq!(read_payload(&message), payload),
        other => panic!("expected data event, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn steady_traffic_reuses_pooled_buffers() {
    let pools = BufferPools::new();
    let (handler, mut server_rx) = recorder();
    let server = Server::with_pools(TransportConfig::default(), handler, pools.clone());
    let addr = server.start(any_addr()).await.unwrap();

    let (client, _client_rx) = connected_client(addr).await;
    match next_event(&mut server_rx).await {
        Event::Connected(1) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    // first round establishes the working set
    for _ in 0..8 {
        let message = client.pools().pop();
        message.write_bytes(b"warm").unwrap();
        assert!(client.send(message));
        match next_event(&mut server_rx).await {
            Event::Data(_, message) => drop(message),
            other => panic!("expected data event, got {:?}", other),
        }
    }

    let allocations = pools.chunk_allocations();
    for _ in 0..32 {
        let message = client.pools().pop();
        message.write_bytes(b"warm").unwrap();
        assert!(client.send(message));
        match next_event(&mut server_rx).await {
            Event::Data(_, message) => drop(message),
            other => panic!("expected data event, got {:?}", other),
        }
    }
    assert_eq!(pools.chunk_allocations(), allocations);

    server.stop().await;
}
