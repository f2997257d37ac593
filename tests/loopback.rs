//! Client and server talking over real loopback sockets.

use std::net::SocketAddr;
use std::time::Duration;

use subspace_transport::client::{Client, ClientBuilder, ClientError, Received};
use subspace_transport::codec::CoreRecord;
use subspace_transport::core::SessionCipher;
use subspace_transport::crypto::{ServerKeyPolicy, VieCipher};
use subspace_transport::server::{Server, ServerBuilder, ServerEvent};
use subspace_transport::transport::{ConnectionPhase, DatagramSocket, TransportConfig};

const WAIT: Duration = Duration::from_secs(3);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn server_with(policy: ServerKeyPolicy) -> Server {
    ServerBuilder::new()
        .bind_addr(loopback())
        .key_policy(policy)
        .bind()
        .await
        .unwrap()
}

async fn client_for(server: &Server, key: i32) -> Client {
    ClientBuilder::new()
        .bind_addr(loopback())
        .server_addr(server.local_addr())
        .client_key(key)
        .connect()
        .await
        .unwrap()
}

/// Next application payload, skipping lifecycle events.
async fn next_payload(server: &Server) -> (SocketAddr, Vec<u8>) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(ServerEvent::Payload { from, data }) = server.recv(WAIT).await.unwrap() {
            return (from, data);
        }
    }
    panic!("no payload within {WAIT:?}");
}

async fn next_disconnect(server: &Server) -> SocketAddr {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(ServerEvent::PeerDisconnected { addr }) = server.recv(WAIT).await.unwrap() {
            return addr;
        }
    }
    panic!("no disconnect within {WAIT:?}");
}

#[tokio::test]
async fn test_echo_round_trip() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let mut client = client_for(&server, 0x1234).await;
    assert_eq!(client.server_key(), 0x1234);
    assert_eq!(client.phase(), ConnectionPhase::Online);

    client.send(b"\x07hello zone", true).unwrap();
    let (from, data) = next_payload(&server).await;
    assert_eq!(from, client.local_addr());
    assert_eq!(data, b"\x07hello zone");

    server.send(from, b"\x07welcome", true).await.unwrap();
    assert_eq!(
        client.receive(WAIT).await,
        Received::Payload(b"\x07welcome".to_vec())
    );

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_random_key_policy() {
    let server = server_with(ServerKeyPolicy::Random).await;
    let mut client = client_for(&server, 0x1234).await;

    client.send(b"\x09ping", false).unwrap();
    let (from, data) = next_payload(&server).await;
    assert_eq!(data, b"\x09ping");

    let key = server.connection(from).await.unwrap().session_key();
    assert_eq!(key, Some(client.server_key()));

    server.send(from, b"\x09pong", false).await.unwrap();
    assert_eq!(
        client.receive(WAIT).await,
        Received::Payload(b"\x09pong".to_vec())
    );
}

#[tokio::test]
async fn test_large_payload_fragmented_and_reassembled() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let client = client_for(&server, 77).await;

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 200) as u8 + 1).collect();
    client.send(&payload, true).unwrap();

    let (_, data) = next_payload(&server).await;
    assert_eq!(data.len(), 2000);
    assert_eq!(data, payload);
}

#[tokio::test]
async fn test_reliable_order_preserved() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let client = client_for(&server, 5).await;

    for i in 0..50u8 {
        client.send(&[0x20, i], true).unwrap();
    }
    for i in 0..50u8 {
        let (_, data) = next_payload(&server).await;
        assert_eq!(data, vec![0x20, i]);
    }

    // Every envelope gets acknowledged eventually.
    let deadline = tokio::time::Instant::now() + WAIT;
    while client.stats().pending_reliable > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.stats().pending_reliable, 0);
}

#[tokio::test]
async fn test_cluster_unpacked_in_order() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let client = client_for(&server, 9).await;

    let records: [&[u8]; 3] = [b"\x31a", b"\x31bb", b"\x31ccc"];
    client.send_cluster(records, true).unwrap();
    for expected in records {
        let (_, data) = next_payload(&server).await;
        assert_eq!(data, expected);
    }
}

#[tokio::test]
async fn test_repeated_connects_create_one_session() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let mut peer = DatagramSocket::bind(loopback()).await.unwrap();
    let connect = CoreRecord::Connect {
        key: 0x1234,
        version: 1,
    }
    .encode();

    for _ in 0..3 {
        peer.send_to(&connect, server.local_addr()).await.unwrap();
    }

    let mut responses = 0;
    while let Some((data, _)) = peer
        .recv_from_timeout(Duration::from_millis(300))
        .await
        .unwrap()
    {
        assert_eq!(
            CoreRecord::parse(data).unwrap(),
            Some(CoreRecord::ConnectResponse { server_key: 0x1234 })
        );
        responses += 1;
    }
    assert_eq!(responses, 3);
    assert_eq!(server.session_count().await, 1);
}

#[tokio::test]
async fn test_client_close_reaches_server() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let client = client_for(&server, 11).await;
    let addr = client.local_addr();

    client.send(b"\x31hi", true).unwrap();
    next_payload(&server).await;
    client.close().await;

    assert_eq!(next_disconnect(&server).await, addr);
    let deadline = tokio::time::Instant::now() + WAIT;
    while server.session_count().await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.session_count().await, 0);
}

#[tokio::test]
async fn test_server_disconnect_reaches_client() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let mut client = client_for(&server, 12).await;

    client.send(b"\x31hi", true).unwrap();
    let (from, _) = next_payload(&server).await;
    server.disconnect(from, true).await.unwrap();

    assert_eq!(client.receive(WAIT).await, Received::Closed);
    assert_eq!(client.phase(), ConnectionPhase::Closed);
    assert!(client.send(b"\x31again", true).is_err());
    assert_eq!(server.session_count().await, 0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let server = server_with(ServerKeyPolicy::Echo).await;
    let mut first = client_for(&server, 21).await;
    let mut second = client_for(&server, 22).await;

    first.send(b"\x31one", true).unwrap();
    second.send(b"\x31two", true).unwrap();
    next_payload(&server).await;
    next_payload(&server).await;

    assert_eq!(server.broadcast(b"\x32news", true).await, 2);
    for client in [&mut first, &mut second] {
        assert_eq!(
            client.receive(WAIT).await,
            Received::Payload(b"\x32news".to_vec())
        );
    }
}

#[tokio::test]
async fn test_handshake_timeout_without_server() {
    let silent = DatagramSocket::bind(loopback()).await.unwrap();
    let err = ClientBuilder::new()
        .bind_addr(loopback())
        .server_addr(silent.local_addr().unwrap())
        .handshake_attempts(3)
        .handshake_timeout(Duration::from_millis(40))
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::HandshakeTimeout { attempts: 3 }));
}

#[tokio::test]
async fn test_lost_envelope_resent_until_acked() {
    const SERVER_KEY: i32 = 0x4321;

    let mut server = DatagramSocket::bind(loopback()).await.unwrap();
    let transport = TransportConfig::builder()
        .resend_timeout(Duration::from_millis(100))
        .resend_sweep_interval(Duration::from_millis(20))
        .heartbeat_interval(None)
        .build();
    let connecting = tokio::spawn(
        ClientBuilder::new()
            .bind_addr(loopback())
            .server_addr(server.local_addr().unwrap())
            .client_key(0x1111)
            .transport(transport)
            .connect(),
    );

    let (_, client_addr) = server.recv_from_timeout(WAIT).await.unwrap().unwrap();
    let response = CoreRecord::ConnectResponse {
        server_key: SERVER_KEY,
    }
    .encode();
    server.send_to(&response, client_addr).await.unwrap();
    let client = connecting.await.unwrap().unwrap();

    client.send(b"\x31lost", true).unwrap();
    // The first copy is dropped on the floor.
    let (first, _) = server.recv_from_timeout(WAIT).await.unwrap().unwrap();
    let first = first.to_vec();
    let (resent, _) = server.recv_from_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(resent, &first[..]);

    let cipher = VieCipher::initialize(0x1111, SERVER_KEY);
    assert_eq!(
        CoreRecord::parse(&cipher.decrypt(&first, 2)).unwrap(),
        Some(CoreRecord::Reliable {
            seq: 0,
            inner: b"\x31lost".to_vec()
        })
    );
    assert_eq!(client.stats().pending_reliable, 1);

    let ack = cipher.encrypt(&CoreRecord::Ack { seq: 0 }.encode(), 2);
    server.send_to(&ack, client_addr).await.unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while client.stats().pending_reliable > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.stats().pending_reliable, 0);

    // Anything already in flight drains, then the resends stop.
    while server
        .recv_from_timeout(Duration::from_millis(150))
        .await
        .unwrap()
        .is_some()
    {}
    assert!(server
        .recv_from_timeout(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());
}
