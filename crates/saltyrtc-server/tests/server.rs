//! End-to-end protocol tests against a real listener.
//!
//! Each test binds a server on an ephemeral port and drives it with a
//! minimal SaltyRTC client built from `tokio-tungstenite` and
//! `crypto_box`. The keep-alive test uses a raw TCP client instead,
//! because a tungstenite client answers pings on its own.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_bytes::ByteBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use saltyrtc_core::address::Address;
use saltyrtc_core::cookie::Cookie;
use saltyrtc_core::csn::CsnSnapshot;
use saltyrtc_core::message::Message;
use saltyrtc_core::nonce::{self, Nonce};
use saltyrtc_core::SUBPROTOCOL;
use saltyrtc_crypto::{sha256, Keypair, PublicKey};
use saltyrtc_server::{Event, Server, ServerConfig, ServerHandle};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(config: ServerConfig) -> (ServerHandle, SocketAddr, JoinHandle<()>) {
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), None, config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (handle, addr, task)
}

async fn connect(addr: SocketAddr, url_path: &str) -> Ws {
    let mut request = format!("ws://{addr}/{url_path}")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SUBPROTOCOL),
    );
    let (ws, _response) = timeout(TEST_TIMEOUT, connect_async(request))
        .await
        .unwrap()
        .unwrap();
    ws
}

async fn next_binary(ws: &mut Ws) -> Vec<u8> {
    timeout(TEST_TIMEOUT, async {
        loop {
            match ws.next().await.expect("stream ended").expect("ws error") {
                WsMessage::Binary(data) => return data,
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("no binary frame in time")
}

async fn next_close_code(ws: &mut Ws) -> u16 {
    timeout(TEST_TIMEOUT, async {
        loop {
            match ws.next().await.expect("stream ended without close frame") {
                Ok(WsMessage::Close(Some(frame))) => return frame.code.into(),
                Ok(_) => continue,
                Err(error) => panic!("ws error before close frame: {error}"),
            }
        }
    })
    .await
    .expect("no close frame in time")
}

async fn recv_event(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Event {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("no event in time")
        .expect("event channel closed")
}

/// A minimal SaltyRTC client: one keypair, one box towards the server
/// session key, and its own outgoing sequence counter.
struct TestClient {
    ws: Ws,
    keypair: Keypair,
    server_session_key: PublicKey,
    cookie: Cookie,
    csn: u64,
    address: u8,
}

impl TestClient {
    async fn start(addr: SocketAddr, url_path: &str, keypair: Keypair) -> (TestClient, Cookie) {
        let mut ws = connect(addr, url_path).await;
        let frame = next_binary(&mut ws).await;
        let (server_session_key, server_cookie) = parse_server_hello(&frame);
        let client = TestClient {
            ws,
            keypair,
            server_session_key,
            cookie: Cookie::random(),
            csn: 100,
            address: 0x00,
        };
        (client, server_cookie)
    }

    fn build_frame(&mut self, destination: u8, payload: &[u8], encrypt: bool) -> Vec<u8> {
        let nonce = Nonce::new(
            self.cookie.clone(),
            Address(self.address),
            Address(destination),
            CsnSnapshot::from_value(self.csn).unwrap(),
        );
        self.csn += 1;
        let bytes = if encrypt {
            self.keypair
                .box_with(&self.server_session_key)
                .seal(&nonce.to_bytes(), payload)
                .unwrap()
        } else {
            payload.to_vec()
        };
        nonce::join_frame(&nonce, &bytes)
    }

    async fn send_message(&mut self, message: Message, encrypt: bool) {
        let payload = message.to_bytes().unwrap();
        let frame = self.build_frame(0x00, &payload, encrypt);
        self.ws.send(WsMessage::Binary(frame)).await.unwrap();
    }

    /// Send an opaque relay frame towards `destination`; returns the
    /// wire bytes for later comparison.
    async fn send_relay(&mut self, destination: u8, payload: &[u8]) -> Vec<u8> {
        let frame = self.build_frame(destination, payload, false);
        self.ws.send(WsMessage::Binary(frame.clone())).await.unwrap();
        frame
    }

    /// Receive and decrypt one server-originated message.
    async fn recv_message(&mut self) -> (Message, Nonce) {
        let frame = next_binary(&mut self.ws).await;
        let (nonce, ciphertext) = nonce::split_frame(&frame).unwrap();
        let plaintext = self
            .keypair
            .box_with(&self.server_session_key)
            .open(&nonce.to_bytes(), ciphertext)
            .unwrap();
        (Message::from_bytes(&plaintext).unwrap(), nonce)
    }

    fn client_auth(&self, server_cookie: &Cookie) -> Message {
        Message::ClientAuth {
            your_cookie: ByteBuf::from(server_cookie.as_bytes().to_vec()),
            subprotocols: Some(vec![SUBPROTOCOL.to_owned()]),
            ping_interval: None,
            your_key: None,
        }
    }
}

fn parse_server_hello(frame: &[u8]) -> (PublicKey, Cookie) {
    let (nonce, payload) = nonce::split_frame(frame).unwrap();
    assert!(nonce.source().is_server());
    match Message::from_bytes(payload).unwrap() {
        Message::ServerHello { key } => {
            let key: [u8; 32] = key.as_ref().try_into().unwrap();
            (PublicKey::from(key), nonce.cookie().clone())
        }
        other => panic!("expected server-hello, got {other:?}"),
    }
}

fn path_for(keypair: &Keypair) -> String {
    hex::encode(keypair.public_key().as_bytes())
}

/// Complete an initiator handshake; returns the client and the
/// responder ids announced in server-auth.
async fn initiator_handshake(addr: SocketAddr, keypair: Keypair) -> (TestClient, Vec<u8>) {
    let url_path = path_for(&keypair);
    let (mut client, server_cookie) = TestClient::start(addr, &url_path, keypair).await;
    client.address = 0x01;
    let auth = client.client_auth(&server_cookie);
    client.send_message(auth, true).await;

    let (message, _nonce) = client.recv_message().await;
    match message {
        Message::ServerAuth {
            your_cookie,
            responders,
            initiator_connected,
            ..
        } => {
            assert_eq!(your_cookie.as_ref(), client.cookie.as_bytes());
            assert_eq!(initiator_connected, None);
            (client, responders.expect("initiator server-auth carries responders"))
        }
        other => panic!("expected server-auth, got {other:?}"),
    }
}

/// Complete a responder handshake on `path_key`'s path; returns the
/// client and its assigned slot.
async fn responder_handshake(addr: SocketAddr, path_key: &PublicKey) -> (TestClient, u8, bool) {
    let url_path = hex::encode(path_key.as_bytes());
    let keypair = Keypair::generate();
    let (mut client, server_cookie) = TestClient::start(addr, &url_path, keypair).await;

    let hello = Message::ClientHello {
        key: ByteBuf::from(client.keypair.public_key().as_bytes().to_vec()),
    };
    client.send_message(hello, false).await;
    let auth = client.client_auth(&server_cookie);
    client.send_message(auth, true).await;

    let (message, nonce) = client.recv_message().await;
    match message {
        Message::ServerAuth {
            your_cookie,
            responders,
            initiator_connected,
            ..
        } => {
            assert_eq!(your_cookie.as_ref(), client.cookie.as_bytes());
            assert_eq!(responders, None);
            let slot = nonce.destination().0;
            assert!(slot >= 0x02);
            client.address = slot;
            (
                client,
                slot,
                initiator_connected.expect("responder server-auth carries initiator_connected"),
            )
        }
        other => panic!("expected server-auth, got {other:?}"),
    }
}

#[tokio::test]
async fn initiator_connects_alone() {
    let (handle, addr, _task) = start_server(ServerConfig::default()).await;
    let mut events = handle.subscribe();

    let keypair = Keypair::generate();
    let expected_path = path_for(&keypair);
    let (_client, responders) = initiator_handshake(addr, keypair).await;

    assert!(responders.is_empty());
    assert_eq!(
        recv_event(&mut events).await,
        Event::InitiatorConnected {
            path: expected_path
        }
    );
}

#[tokio::test]
async fn responder_arrives_after_initiator() {
    let (handle, addr, _task) = start_server(ServerConfig::default()).await;
    let mut events = handle.subscribe();

    let keypair = Keypair::generate();
    let path_key = keypair.public_key();
    let (mut initiator, _) = initiator_handshake(addr, keypair).await;
    recv_event(&mut events).await;

    let (_responder, slot, initiator_connected) = responder_handshake(addr, &path_key).await;
    assert_eq!(slot, 0x02);
    assert!(initiator_connected);

    // The initiator hears about the responder.
    let (message, _) = initiator.recv_message().await;
    assert_eq!(message, Message::NewResponder { id: slot });

    assert_eq!(
        recv_event(&mut events).await,
        Event::ResponderConnected {
            path: hex::encode(path_key.as_bytes())
        }
    );
}

#[tokio::test]
async fn responder_before_initiator_sees_no_initiator() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let path_key = keypair.public_key();
    let (mut responder, slot, initiator_connected) = responder_handshake(addr, &path_key).await;
    assert_eq!(slot, 0x02);
    assert!(!initiator_connected);

    // A late initiator is announced to the responder.
    let (_initiator, responders) = initiator_handshake(addr, keypair).await;
    assert_eq!(responders, vec![slot]);
    let (message, _) = responder.recv_message().await;
    assert_eq!(message, Message::NewInitiator {});
}

#[tokio::test]
async fn relay_initiator_to_responder_is_verbatim() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let path_key = keypair.public_key();
    let (mut initiator, _) = initiator_handshake(addr, keypair).await;
    let (mut responder, slot, _) = responder_handshake(addr, &path_key).await;
    let (message, _) = initiator.recv_message().await;
    assert_eq!(message, Message::NewResponder { id: slot });

    let wire = initiator.send_relay(slot, b"opaque ciphertext X").await;
    let received = next_binary(&mut responder.ws).await;
    assert_eq!(received, wire);

    let (parsed, _) = nonce::split_frame(&received).unwrap();
    assert_eq!(parsed.source(), Address(0x01));
    assert_eq!(parsed.destination(), Address(slot));

    // And the reverse direction.
    let wire = responder.send_relay(0x01, b"opaque ciphertext Y").await;
    let received = next_binary(&mut initiator.ws).await;
    assert_eq!(received, wire);
}

#[tokio::test]
async fn relay_to_missing_responder_yields_send_error() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let (mut initiator, _) = initiator_handshake(addr, keypair).await;

    let wire = initiator.send_relay(0x05, b"into the void").await;
    let (message, _) = initiator.recv_message().await;
    match message {
        Message::SendError { id } => assert_eq!(id.as_ref(), sha256(&wire)),
        other => panic!("expected send-error, got {other:?}"),
    }
}

#[tokio::test]
async fn second_initiator_displaces_first() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let copy = Keypair::from_bytes(keypair.secret_key().to_bytes());
    let (mut first, _) = initiator_handshake(addr, keypair).await;

    let (_second, responders) = initiator_handshake(addr, copy).await;
    assert!(responders.is_empty());

    assert_eq!(next_close_code(&mut first.ws).await, 3004);
}

#[tokio::test]
async fn initiator_can_drop_responder() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let path_key = keypair.public_key();
    let (mut initiator, _) = initiator_handshake(addr, keypair).await;
    let (mut responder, slot, _) = responder_handshake(addr, &path_key).await;
    let (message, _) = initiator.recv_message().await;
    assert_eq!(message, Message::NewResponder { id: slot });

    initiator
        .send_message(Message::DropResponder { id: slot, reason: None }, true)
        .await;
    assert_eq!(next_close_code(&mut responder.ws).await, 3004);
}

#[tokio::test]
async fn departing_responder_is_announced_to_initiator() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let path_key = keypair.public_key();
    let (mut initiator, _) = initiator_handshake(addr, keypair).await;
    let (mut responder, slot, _) = responder_handshake(addr, &path_key).await;
    let (message, _) = initiator.recv_message().await;
    assert_eq!(message, Message::NewResponder { id: slot });

    responder.ws.close(None).await.unwrap();

    let (message, _) = initiator.recv_message().await;
    assert_eq!(message, Message::Disconnected { id: slot });
}

#[tokio::test]
async fn departing_initiator_is_announced_to_responders() {
    let (handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let path_key = keypair.public_key();
    let (mut initiator, _) = initiator_handshake(addr, keypair).await;
    let (mut responder, slot, _) = responder_handshake(addr, &path_key).await;
    let (message, _) = initiator.recv_message().await;
    assert_eq!(message, Message::NewResponder { id: slot });

    initiator.ws.close(None).await.unwrap();

    let (message, _) = responder.recv_message().await;
    assert_eq!(message, Message::Disconnected { id: 0x01 });

    // The path persists while the responder stays; relay attempts fail
    // with send-error until a new initiator shows up.
    let wire = responder.send_relay(0x01, b"anyone there").await;
    let (message, _) = responder.recv_message().await;
    match message {
        Message::SendError { id } => assert_eq!(id.as_ref(), sha256(&wire)),
        other => panic!("expected send-error, got {other:?}"),
    }

    // Path removal happens once the responder leaves as well.
    responder.ws.close(None).await.unwrap();
    timeout(TEST_TIMEOUT, async {
        loop {
            if handle.path_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("path was not pruned");
}

#[tokio::test]
async fn malformed_paths_are_rejected() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    for url_path in [
        format!("{}a", "ab".repeat(31)), // 63 chars
        format!("{}a", "ab".repeat(32)), // 65 chars
        format!("{}ag", "ab".repeat(31)), // 64 chars, one invalid
        "AB".repeat(32), // uppercase
    ] {
        let mut ws = connect(addr, &url_path).await;
        assert_eq!(next_close_code(&mut ws).await, 3001, "path {url_path}");
    }
}

#[tokio::test]
async fn missing_subprotocol_is_rejected() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let url_path = "ab".repeat(32);
    let request = format!("ws://{addr}/{url_path}")
        .into_client_request()
        .unwrap();
    let (mut ws, _) = timeout(TEST_TIMEOUT, connect_async(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next_close_code(&mut ws).await, 3006);
}

#[tokio::test]
async fn cookie_mismatch_fails_handshake() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let url_path = path_for(&keypair);
    let (mut client, _server_cookie) = TestClient::start(addr, &url_path, keypair).await;
    client.address = 0x01;

    let wrong = Cookie::random();
    let auth = client.client_auth(&wrong);
    client.send_message(auth, true).await;

    assert_eq!(next_close_code(&mut client.ws).await, 3001);
}

#[tokio::test]
async fn out_of_range_ping_interval_fails_handshake() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let url_path = path_for(&keypair);
    let (mut client, server_cookie) = TestClient::start(addr, &url_path, keypair).await;
    client.address = 0x01;

    let auth = Message::ClientAuth {
        your_cookie: ByteBuf::from(server_cookie.as_bytes().to_vec()),
        subprotocols: None,
        ping_interval: Some(0),
        your_key: None,
    };
    client.send_message(auth, true).await;

    assert_eq!(next_close_code(&mut client.ws).await, 3001);
}

#[tokio::test]
async fn pinned_permanent_key_yields_signed_keys() {
    let permanent = Keypair::generate();
    let permanent_public = permanent.public_key();
    let config = ServerConfig {
        permanent_keys: vec![permanent],
        ..ServerConfig::default()
    };
    let (_handle, addr, _task) = start_server(config).await;

    let keypair = Keypair::generate();
    let url_path = path_for(&keypair);
    let (mut client, server_cookie) = TestClient::start(addr, &url_path, keypair).await;
    client.address = 0x01;

    let auth = Message::ClientAuth {
        your_cookie: ByteBuf::from(server_cookie.as_bytes().to_vec()),
        subprotocols: Some(vec![SUBPROTOCOL.to_owned()]),
        ping_interval: None,
        your_key: Some(ByteBuf::from(permanent_public.as_bytes().to_vec())),
    };
    client.send_message(auth, true).await;

    let (message, nonce) = client.recv_message().await;
    match message {
        Message::ServerAuth { signed_keys, .. } => {
            let signed = signed_keys.expect("signed_keys present when a key is pinned");
            let opened = client
                .keypair
                .box_with(&permanent_public)
                .open(&nonce.to_bytes(), &signed)
                .unwrap();
            assert_eq!(&opened[..32], client.server_session_key.as_bytes());
            assert_eq!(&opened[32..], client.keypair.public_key().as_bytes());
        }
        other => panic!("expected server-auth, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_pinned_key_fails_handshake() {
    let config = ServerConfig {
        permanent_keys: vec![Keypair::generate()],
        ..ServerConfig::default()
    };
    let (_handle, addr, _task) = start_server(config).await;

    let keypair = Keypair::generate();
    let url_path = path_for(&keypair);
    let (mut client, server_cookie) = TestClient::start(addr, &url_path, keypair).await;
    client.address = 0x01;

    let auth = Message::ClientAuth {
        your_cookie: ByteBuf::from(server_cookie.as_bytes().to_vec()),
        subprotocols: None,
        ping_interval: None,
        your_key: Some(ByteBuf::from(vec![0x42u8; 32])),
    };
    client.send_message(auth, true).await;

    assert_eq!(next_close_code(&mut client.ws).await, 3001);
}

#[tokio::test]
async fn responder_slots_exhaust_when_full() {
    let (_handle, addr, _task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let path_key = keypair.public_key();

    let mut responders = Vec::new();
    for expected in 0x02..=0xffu16 {
        let (responder, slot, _) = responder_handshake(addr, &path_key).await;
        assert_eq!(u16::from(slot), expected);
        responders.push(responder);
    }

    // The 254th responder finds no free slot.
    let url_path = hex::encode(path_key.as_bytes());
    let extra = Keypair::generate();
    let (mut client, server_cookie) = TestClient::start(addr, &url_path, extra).await;
    let hello = Message::ClientHello {
        key: ByteBuf::from(client.keypair.public_key().as_bytes().to_vec()),
    };
    client.send_message(hello, false).await;
    let auth = client.client_auth(&server_cookie);
    client.send_message(auth, true).await;

    assert_eq!(next_close_code(&mut client.ws).await, 3000);
}

#[tokio::test]
async fn shutdown_closes_clients_with_going_away() {
    let (handle, addr, task) = start_server(ServerConfig::default()).await;

    let keypair = Keypair::generate();
    let (mut initiator, _) = initiator_handshake(addr, keypair).await;

    handle.close();
    assert_eq!(next_close_code(&mut initiator.ws).await, 1001);
    timeout(TEST_TIMEOUT, task)
        .await
        .expect("server did not drain connections")
        .unwrap();
}

#[tokio::test]
async fn shutdown_drains_clients_stuck_in_handshake() {
    let (handle, addr, task) = start_server(ServerConfig::default()).await;

    // Complete only the WebSocket upgrade; never send a signalling
    // frame, leaving the engine waiting mid-handshake.
    let keypair = Keypair::generate();
    let url_path = path_for(&keypair);
    let mut raw = RawClient::connect(addr, &url_path).await;
    let server_hello = timeout(TEST_TIMEOUT, raw.read_binary())
        .await
        .expect("no server-hello in time");
    parse_server_hello(&server_hello);

    handle.close();
    let close_code = timeout(TEST_TIMEOUT, raw.read_close_code())
        .await
        .expect("no close frame in time");
    assert_eq!(close_code, 1001);
    timeout(TEST_TIMEOUT, task)
        .await
        .expect("server did not drain connections")
        .unwrap();
}

// --- Keep-alive: a raw client that never answers pings. ---

struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    async fn connect(addr: SocketAddr, url_path: &str) -> RawClient {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /{url_path} HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Protocol: {SUBPROTOCOL}\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        // Read the upgrade response headers.
        let mut headers = Vec::new();
        let mut byte = [0u8; 1];
        while !headers.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            headers.push(byte[0]);
        }
        let response = String::from_utf8_lossy(&headers);
        assert!(response.starts_with("HTTP/1.1 101"), "upgrade failed: {response}");
        RawClient { stream }
    }

    /// Read one frame; returns (opcode, payload). Server frames are
    /// unmasked.
    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await.unwrap();
        let opcode = header[0] & 0x0f;
        let length = match header[1] & 0x7f {
            126 => {
                let mut extended = [0u8; 2];
                self.stream.read_exact(&mut extended).await.unwrap();
                u16::from_be_bytes(extended) as usize
            }
            127 => {
                let mut extended = [0u8; 8];
                self.stream.read_exact(&mut extended).await.unwrap();
                u64::from_be_bytes(extended) as usize
            }
            length => length as usize,
        };
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await.unwrap();
        (opcode, payload)
    }

    async fn read_binary(&mut self) -> Vec<u8> {
        loop {
            let (opcode, payload) = self.read_frame().await;
            match opcode {
                0x2 => return payload,
                0x9 => continue, // deliberately never answer pings
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    /// Write a masked binary frame (mask key zero keeps the payload
    /// readable on the wire, which the protocol allows).
    async fn write_binary(&mut self, payload: &[u8]) {
        let mut frame = vec![0x82u8];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&[0u8; 4]);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Read frames until a close frame arrives; returns its code.
    async fn read_close_code(&mut self) -> u16 {
        loop {
            let (opcode, payload) = self.read_frame().await;
            if opcode == 0x8 {
                assert!(payload.len() >= 2, "close frame without code");
                return u16::from_be_bytes([payload[0], payload[1]]);
            }
        }
    }
}

#[tokio::test]
async fn missing_pongs_time_the_connection_out() {
    let config = ServerConfig {
        keep_alive_interval: Duration::from_millis(100),
        keep_alive_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let (_handle, addr, _task) = start_server(config).await;

    let keypair = Keypair::generate();
    let url_path = path_for(&keypair);
    let mut raw = RawClient::connect(addr, &url_path).await;

    // Handshake: server-hello, client-auth, server-auth.
    let frame = raw.read_binary().await;
    let (server_session_key, server_cookie) = parse_server_hello(&frame);

    let cookie = Cookie::random();
    let auth_nonce = Nonce::new(
        cookie.clone(),
        Address(0x01),
        Address(0x00),
        CsnSnapshot::from_value(100).unwrap(),
    );
    let auth = Message::ClientAuth {
        your_cookie: ByteBuf::from(server_cookie.as_bytes().to_vec()),
        subprotocols: Some(vec![SUBPROTOCOL.to_owned()]),
        ping_interval: None,
        your_key: None,
    };
    let sealed = keypair
        .box_with(&server_session_key)
        .seal(&auth_nonce.to_bytes(), &auth.to_bytes().unwrap())
        .unwrap();
    raw.write_binary(&nonce::join_frame(&auth_nonce, &sealed))
        .await;

    let server_auth = raw.read_binary().await;
    let (nonce, ciphertext) = nonce::split_frame(&server_auth).unwrap();
    let opened = keypair
        .box_with(&server_session_key)
        .open(&nonce.to_bytes(), ciphertext)
        .unwrap();
    assert!(matches!(
        Message::from_bytes(&opened).unwrap(),
        Message::ServerAuth { .. }
    ));

    // Never answer pings: the server must give up within interval +
    // timeout plus slack.
    let close_code = timeout(Duration::from_secs(2), raw.read_close_code())
        .await
        .expect("no close frame in time");
    assert_eq!(close_code, 3007);
}
