// tests/relay_flow.rs
//! End-to-end relay client flows against a scripted TURN server.
//!
//! The "server" is a plain UDP socket driven by each test, so every
//! exchange (challenge, grant, permissions, channel binding, relayed
//! data) is checked on the wire exactly as a real server would see it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

use turn_relay::relay::encode_channel_frame;
use turn_relay::{
    long_term_key, verify_integrity, Attribute, Candidate, Message, MessageType, RelayConfig,
    RelayEvent, RelayHandle, RelayPort, RetransmitConfig, TransactionId,
};

const REALM: &str = "example.org";
const NONCE: &str = "n0nce";
const STEP: Duration = Duration::from_secs(2);

/// Test logging setup
fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Bind a port against `server`, fire the first allocate, and run it.
async fn start_port(
    server: impl Into<String>,
    username: &str,
    password: &str,
) -> (RelayHandle, mpsc::UnboundedReceiver<RelayEvent>) {
    let mut config = RelayConfig::new(server, username, password);
    config.local_ip = "127.0.0.1".parse().unwrap();

    let (mut port, events) = RelayPort::bind(config).await.unwrap();
    port.prepare_address().await;
    let handle = port.handle();
    tokio::spawn(async move {
        let _ = port.run().await;
    });
    (handle, events)
}

async fn recv_datagram(server: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 1500];
    let (len, from) = timeout(STEP, server.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a client datagram")
        .expect("server socket error");
    (buf[..len].to_vec(), from)
}

async fn recv_message(server: &UdpSocket) -> (Message, SocketAddr) {
    let (raw, from) = recv_datagram(server).await;
    let message = Message::decode(&raw).expect("client sent an undecodable message");
    (message, from)
}

fn challenge(id: TransactionId) -> Vec<u8> {
    let mut message = Message::with_transaction_id(MessageType::AllocateError, id);
    message.add_attribute(Attribute::ErrorCode {
        code: 401,
        reason: "Unauthorized".to_string(),
    });
    message.add_attribute(Attribute::Realm(REALM.to_string()));
    message.add_attribute(Attribute::Nonce(NONCE.to_string()));
    message.encode()
}

/// Drive the challenge round: returns the client address, the long-term
/// key, and the authenticated allocate awaiting a grant.
async fn authenticate(
    server: &UdpSocket,
    username: &str,
    password: &str,
) -> (SocketAddr, [u8; 16], Message) {
    let (first, client) = recv_message(server).await;
    assert_eq!(first.message_type, MessageType::AllocateRequest);
    assert!(first.realm().is_none(), "first allocate must be bare");
    server
        .send_to(&challenge(first.transaction_id), client)
        .await
        .unwrap();

    let (raw, _) = recv_datagram(server).await;
    let key = long_term_key(username, REALM, password);
    assert!(
        verify_integrity(&raw, &key),
        "authenticated allocate must carry a valid integrity digest"
    );
    let second = Message::decode(&raw).unwrap();
    assert_eq!(second.message_type, MessageType::AllocateRequest);
    assert_eq!(second.realm(), Some(REALM));
    assert_eq!(second.nonce(), Some(NONCE));
    (client, key, second)
}

async fn grant(
    server: &UdpSocket,
    client: SocketAddr,
    key: &[u8; 16],
    id: TransactionId,
    relayed: SocketAddr,
    mapped: SocketAddr,
    lifetime: u32,
) {
    let mut message = Message::with_transaction_id(MessageType::AllocateResponse, id);
    message.add_attribute(Attribute::XorRelayedAddress(relayed));
    message.add_attribute(Attribute::XorMappedAddress(mapped));
    message.add_attribute(Attribute::Lifetime(lifetime));
    server
        .send_to(&message.encode_with_integrity(key).unwrap(), client)
        .await
        .unwrap();
}

/// Full allocation: challenge round plus grant, consumed AddressReady.
async fn allocate(
    server: &UdpSocket,
    events: &mut mpsc::UnboundedReceiver<RelayEvent>,
    username: &str,
    password: &str,
) -> (SocketAddr, [u8; 16], SocketAddr) {
    let (client, key, second) = authenticate(server, username, password).await;
    let relayed: SocketAddr = "203.0.113.9:49152".parse().unwrap();
    let mapped: SocketAddr = "198.51.100.2:61000".parse().unwrap();
    grant(
        server,
        client,
        &key,
        second.transaction_id,
        relayed,
        mapped,
        600,
    )
    .await;

    let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, RelayEvent::AddressReady { relayed });
    (client, key, relayed)
}

#[tokio::test]
async fn allocation_reports_the_relayed_address_once() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;

    let (client, key, second) = authenticate(&server, "alice", "secret").await;
    let relayed: SocketAddr = "203.0.113.9:49152".parse().unwrap();
    let mapped: SocketAddr = "198.51.100.2:61000".parse().unwrap();
    grant(
        &server,
        client,
        &key,
        second.transaction_id,
        relayed,
        mapped,
        600,
    )
    .await;

    let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, RelayEvent::AddressReady { relayed });

    // A duplicated grant settles nothing: the transaction is gone.
    grant(
        &server,
        client,
        &key,
        second.transaction_id,
        relayed,
        mapped,
        600,
    )
    .await;
    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "the relayed address must be reported exactly once"
    );
    handle.close();
}

#[tokio::test]
async fn second_challenge_abandons_the_allocation() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "wrong").await;

    let (client, _key, second) = authenticate(&server, "alice", "wrong").await;
    // Server rejects the signed allocate with a fresh challenge.
    server
        .send_to(&challenge(second.transaction_id), client)
        .await
        .unwrap();

    let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, RelayEvent::AddressError);

    // No third attempt, no retransmissions.
    let mut buf = vec![0u8; 1500];
    assert!(
        timeout(Duration::from_millis(400), server.recv_from(&mut buf))
            .await
            .is_err(),
        "the client must stop after the second challenge"
    );
    handle.close();
}

#[tokio::test]
async fn stale_credentials_challenge_counts_like_unauthorized() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;

    // First challenge uses 438 instead of 401.
    let (first, client) = recv_message(&server).await;
    let mut stale = Message::with_transaction_id(MessageType::AllocateError, first.transaction_id);
    stale.add_attribute(Attribute::ErrorCode {
        code: 438,
        reason: "Stale Nonce".to_string(),
    });
    stale.add_attribute(Attribute::Realm(REALM.to_string()));
    stale.add_attribute(Attribute::Nonce(NONCE.to_string()));
    server.send_to(&stale.encode(), client).await.unwrap();

    // The client still answers with an authenticated allocate.
    let (raw, _) = recv_datagram(&server).await;
    let key = long_term_key("alice", REALM, "secret");
    assert!(verify_integrity(&raw, &key));
    let second = Message::decode(&raw).unwrap();
    assert_eq!(second.message_type, MessageType::AllocateRequest);

    let relayed: SocketAddr = "203.0.113.9:49152".parse().unwrap();
    let mapped: SocketAddr = "198.51.100.2:61000".parse().unwrap();
    grant(
        &server,
        client,
        &key,
        second.transaction_id,
        relayed,
        mapped,
        600,
    )
    .await;

    let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, RelayEvent::AddressReady { relayed });
    handle.close();
}

#[tokio::test]
async fn hard_rejection_reports_address_error() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;

    let (first, client) = recv_message(&server).await;
    let mut rejection =
        Message::with_transaction_id(MessageType::AllocateError, first.transaction_id);
    rejection.add_attribute(Attribute::ErrorCode {
        code: 508,
        reason: "Insufficient Capacity".to_string(),
    });
    server.send_to(&rejection.encode(), client).await.unwrap();

    let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, RelayEvent::AddressError);
    handle.close();
}

#[tokio::test]
async fn unsigned_success_responses_are_dropped() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;

    let (client, _key, second) = authenticate(&server, "alice", "secret").await;

    // Grant without MESSAGE-INTEGRITY: must be discarded.
    let relayed: SocketAddr = "203.0.113.9:49152".parse().unwrap();
    let mut unsigned =
        Message::with_transaction_id(MessageType::AllocateResponse, second.transaction_id);
    unsigned.add_attribute(Attribute::XorRelayedAddress(relayed));
    unsigned.add_attribute(Attribute::XorMappedAddress(relayed));
    unsigned.add_attribute(Attribute::Lifetime(600));
    server.send_to(&unsigned.encode(), client).await.unwrap();

    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "an unsigned success response must not produce an event"
    );
    handle.close();
}

#[tokio::test]
async fn incomplete_grants_are_ignored() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;

    let (client, key, second) = authenticate(&server, "alice", "secret").await;

    // Signed, but missing the relayed address.
    let mut partial =
        Message::with_transaction_id(MessageType::AllocateResponse, second.transaction_id);
    partial.add_attribute(Attribute::XorMappedAddress(
        "198.51.100.2:61000".parse().unwrap(),
    ));
    partial.add_attribute(Attribute::Lifetime(600));
    server
        .send_to(&partial.encode_with_integrity(&key).unwrap(), client)
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "a grant without the relayed address must not produce an event"
    );
    handle.close();
}

#[tokio::test]
async fn permission_binding_and_data_flow() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;
    let (client, key, _relayed) = allocate(&server, &mut events, "alice", "secret").await;

    // Reserve a unique address to stand in for the remote peer.
    let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = peer_socket.local_addr().unwrap();

    let mut connection = handle
        .create_connection(Candidate::udp(peer))
        .await
        .unwrap()
        .expect("UDP candidate must be accepted");
    info!("Connection open to {}", peer);

    // Entry creation asks for a permission covering the peer.
    let (raw, _) = recv_datagram(&server).await;
    assert!(verify_integrity(&raw, &key));
    let permission = Message::decode(&raw).unwrap();
    assert_eq!(
        permission.message_type,
        MessageType::CreatePermissionRequest
    );
    assert_eq!(permission.xor_peer_address(), Some(peer));
    let ok =
        Message::with_transaction_id(MessageType::CreatePermissionResponse, permission.transaction_id);
    server
        .send_to(&ok.encode_with_integrity(&key).unwrap(), client)
        .await
        .unwrap();

    // First payload: a Send indication, then the ChannelBind kick.
    connection.send(b"hello relay").unwrap();
    let (indication, _) = recv_message(&server).await;
    assert_eq!(indication.message_type, MessageType::SendIndication);
    assert_eq!(indication.xor_peer_address(), Some(peer));
    assert_eq!(indication.data(), Some(&b"hello relay"[..]));

    let (raw, _) = recv_datagram(&server).await;
    assert!(verify_integrity(&raw, &key));
    let bind = Message::decode(&raw).unwrap();
    assert_eq!(bind.message_type, MessageType::ChannelBindRequest);
    assert_eq!(bind.xor_peer_address(), Some(peer));
    let channel = bind.channel_number().expect("bind must carry a channel");
    assert_eq!(channel, 0x4000, "first entry takes the first channel");

    let bound =
        Message::with_transaction_id(MessageType::ChannelBindResponse, bind.transaction_id);
    server
        .send_to(&bound.encode_with_integrity(&key).unwrap(), client)
        .await
        .unwrap();

    // Once the response lands, payloads switch to channel-data frames.
    let mut framed = None;
    for _ in 0..10 {
        connection.send(b"framed payload").unwrap();
        let (raw, _) = recv_datagram(&server).await;
        if raw[0] & 0xC0 == 0x40 {
            framed = Some(raw);
            break;
        }
        // Bind response not processed yet; still an indication.
        let still = Message::decode(&raw).unwrap();
        assert_eq!(still.message_type, MessageType::SendIndication);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let frame = framed.expect("channel framing never engaged");
    assert_eq!(&frame[..4], &[0x40, 0x00, 0x00, 0x0E]);
    assert_eq!(&frame[4..], b"framed payload");

    // Inbound channel data reaches the connection.
    server
        .send_to(&encode_channel_frame(channel, b"from peer"), client)
        .await
        .unwrap();
    let data = timeout(STEP, connection.recv()).await.unwrap().unwrap();
    assert_eq!(data, b"from peer");

    // So does a Data indication for the same peer.
    let mut relayed_data = Message::new(MessageType::DataIndication);
    relayed_data.add_attribute(Attribute::XorPeerAddress(peer));
    relayed_data.add_attribute(Attribute::Data(b"via indication".to_vec()));
    server.send_to(&relayed_data.encode(), client).await.unwrap();
    let data = timeout(STEP, connection.recv()).await.unwrap().unwrap();
    assert_eq!(data, b"via indication");

    handle.close();
}

#[tokio::test]
async fn data_indications_need_a_permission() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;
    let (client, key, _relayed) = allocate(&server, &mut events, "alice", "secret").await;

    let stranger: SocketAddr = "127.0.0.2:4242".parse().unwrap();
    let mut sneaky = Message::new(MessageType::DataIndication);
    sneaky.add_attribute(Attribute::XorPeerAddress(stranger));
    sneaky.add_attribute(Attribute::Data(b"unsolicited".to_vec()));
    server.send_to(&sneaky.encode(), client).await.unwrap();

    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "data from an unpermitted peer must be dropped"
    );

    // After a connection exists, the same indication is delivered.
    let mut connection = handle
        .create_connection(Candidate::udp(stranger))
        .await
        .unwrap()
        .expect("UDP candidate must be accepted");
    let (raw, _) = recv_datagram(&server).await;
    let permission = Message::decode(&raw).unwrap();
    let ok =
        Message::with_transaction_id(MessageType::CreatePermissionResponse, permission.transaction_id);
    server
        .send_to(&ok.encode_with_integrity(&key).unwrap(), client)
        .await
        .unwrap();

    server.send_to(&sneaky.encode(), client).await.unwrap();
    let data = timeout(STEP, connection.recv()).await.unwrap().unwrap();
    assert_eq!(data, b"unsolicited");

    handle.close();
}

#[tokio::test]
async fn unanswered_requests_are_retransmitted_verbatim() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut config = RelayConfig::new(server_addr.to_string(), "alice", "secret");
    config.local_ip = "127.0.0.1".parse().unwrap();
    config.retransmit = RetransmitConfig {
        initial_rto_ms: 100,
        max_rto_ms: 200,
        max_retries: 3,
    };
    let (mut port, _events) = RelayPort::bind(config).await.unwrap();
    port.prepare_address().await;
    let handle = port.handle();
    tokio::spawn(async move {
        let _ = port.run().await;
    });

    let (first, _) = recv_datagram(&server).await;
    let (retry, _) = recv_datagram(&server).await;
    assert_eq!(
        first, retry,
        "a retransmission reuses the original transaction"
    );
    handle.close();
}

#[tokio::test]
async fn hostname_servers_are_resolved() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port_number = server.local_addr().unwrap().port();

    let (handle, _events) =
        start_port(format!("localhost:{}", port_number), "alice", "secret").await;

    let (first, _) = recv_message(&server).await;
    assert_eq!(first.message_type, MessageType::AllocateRequest);
    handle.close();
}

#[tokio::test]
async fn close_sends_a_zero_lifetime_refresh() {
    setup_test_logging();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut events) = start_port(server_addr.to_string(), "alice", "secret").await;
    let (_client, key, _relayed) = allocate(&server, &mut events, "alice", "secret").await;

    handle.close();

    let (raw, _) = recv_datagram(&server).await;
    assert!(verify_integrity(&raw, &key));
    let refresh = Message::decode(&raw).unwrap();
    assert_eq!(refresh.message_type, MessageType::RefreshRequest);
    assert_eq!(refresh.lifetime(), Some(0));
}
