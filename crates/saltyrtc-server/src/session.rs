//! Client sessions.
//!
//! A [`ClientSession`] owns everything the server knows about one
//! WebSocket connection: the shared box towards the client, the cookies
//! and sequence numbers of both directions, the client's role and slot,
//! and a bounded outbox drained by a writer task. Other connections on
//! the same path hold `Arc` references to it for relaying; a reference
//! may be stale for the duration of one pending relay, which is why
//! every write surfaces `Disconnected` instead of panicking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use saltyrtc_core::address::{self, Address};
use saltyrtc_core::cookie::Cookie;
use saltyrtc_core::csn::OutgoingCsn;
use saltyrtc_core::message::Message;
use saltyrtc_core::nonce::{self, Nonce};
use saltyrtc_core::{CloseCode, ProtocolError};
use saltyrtc_crypto::{Keypair, PeerBox, PublicKey};

/// Default keep-alive ping interval.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default wait for a keep-alive pong.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the per-session outbox.
pub const OUTBOX_CAPACITY: usize = 128;

/// The two client roles on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// A frame classified by [`ClientSession::unpack`].
#[derive(Debug)]
pub enum Incoming {
    /// An opaque peer-to-peer frame; forwarded verbatim, never decrypted.
    Relay {
        frame: Vec<u8>,
        source: Address,
        destination: Address,
    },
    /// A decoded client-to-server message.
    Signalling { message: Message, nonce: Nonce },
}

/// Mutable per-connection protocol state, guarded by one lock.
struct SessionState {
    session_key: Keypair,
    /// Starts as the path key (correct for the initiator), replaced by
    /// the key from `client-hello` for responders.
    client_key: PublicKey,
    /// Derived from `(session_key, client_key)` on first use and
    /// dropped whenever the client key changes.
    peer_box: Option<PeerBox>,
    server_cookie: Cookie,
    client_cookie: Option<Cookie>,
    outgoing_csn: OutgoingCsn,
    /// Last seen combined sequence number per (source, destination).
    incoming_csn: HashMap<(u8, u8), u64>,
    /// The client's current address: `0x00` until it earns one.
    address: Address,
    role: Option<Role>,
    keep_alive_interval: Duration,
}

pub struct ClientSession {
    path_number: u32,
    outbox: mpsc::Sender<WsMessage>,
    state: Mutex<SessionState>,
    authenticated: AtomicBool,
    closing: AtomicBool,
    pong: Notify,
}

impl ClientSession {
    /// Create a session for a fresh connection on the path identified
    /// by `path_key`.
    pub fn new(
        outbox: mpsc::Sender<WsMessage>,
        path_key: PublicKey,
        path_number: u32,
        keep_alive_interval: Duration,
    ) -> Self {
        ClientSession {
            path_number,
            outbox,
            state: Mutex::new(SessionState {
                session_key: Keypair::generate(),
                client_key: path_key,
                peer_box: None,
                server_cookie: Cookie::random(),
                client_cookie: None,
                outgoing_csn: OutgoingCsn::generate(),
                incoming_csn: HashMap::new(),
                address: address::SERVER,
                role: None,
                keep_alive_interval,
            }),
            authenticated: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            pong: Notify::new(),
        }
    }

    pub fn path_number(&self) -> u32 {
        self.path_number
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Mark the handshake as completed. Transitions once and never back.
    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub async fn role(&self) -> Option<Role> {
        self.state.lock().await.role
    }

    pub async fn set_role(&self, role: Role) {
        let mut state = self.state.lock().await;
        state.role = Some(role);
        if role == Role::Initiator {
            state.address = address::INITIATOR;
        }
    }

    /// Give a responder its slot address.
    pub async fn assign_slot(&self, slot: u8) {
        self.state.lock().await.address = Address(slot);
    }

    pub async fn address(&self) -> Address {
        self.state.lock().await.address
    }

    pub async fn session_public_key(&self) -> PublicKey {
        self.state.lock().await.session_key.public_key()
    }

    pub async fn server_cookie(&self) -> Cookie {
        self.state.lock().await.server_cookie.clone()
    }

    pub async fn set_client_cookie(&self, cookie: Cookie) {
        self.state.lock().await.client_cookie = Some(cookie);
    }

    /// The cookie observed in the client's `client-auth` nonce.
    pub async fn client_cookie(&self) -> Option<Cookie> {
        self.state.lock().await.client_cookie.clone()
    }

    /// Set the client key announced in `client-hello`, invalidating the
    /// box derived from the path key.
    pub async fn set_client_key(&self, key: PublicKey) {
        let mut state = self.state.lock().await;
        state.client_key = key;
        state.peer_box = None;
    }

    pub async fn keep_alive_interval(&self) -> Duration {
        self.state.lock().await.keep_alive_interval
    }

    pub async fn set_keep_alive_interval(&self, interval: Duration) {
        self.state.lock().await.keep_alive_interval = interval;
    }

    /// Pack and send a server-originated message.
    pub async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        let frame = self.pack_with(move |_, _, _| Ok(message)).await?;
        self.write(WsMessage::Binary(frame)).await
    }

    /// Pack and send a message built from the nonce it will be packed
    /// under. Needed for `server-auth`, whose `signed_keys` field seals
    /// the message nonce itself.
    pub async fn send_with<F>(&self, build: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&Nonce, &Keypair, &PublicKey) -> Result<Message, ProtocolError>,
    {
        let frame = self.pack_with(build).await?;
        self.write(WsMessage::Binary(frame)).await
    }

    /// Pack and enqueue a message without waiting for outbox space.
    ///
    /// Used for cross-session notifications (`new-responder`,
    /// `new-initiator`, `disconnected`) where the sending engine must
    /// not block on another client's socket.
    pub async fn enqueue(&self, message: Message) -> Result<(), ProtocolError> {
        let frame = self.pack_with(move |_, _, _| Ok(message)).await?;
        self.outbox
            .try_send(WsMessage::Binary(frame))
            .map_err(|_| ProtocolError::Disconnected)
    }

    /// Forward an already-packed relay frame verbatim.
    pub async fn forward(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.write(WsMessage::Binary(frame)).await
    }

    /// Send a WebSocket ping.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.write(WsMessage::Ping(Vec::new())).await
    }

    /// Called by the read loop when a pong arrives.
    pub fn notify_pong(&self) {
        self.pong.notify_one();
    }

    pub async fn wait_pong(&self) {
        self.pong.notified().await;
    }

    /// Close the connection with `code`. Idempotent: only the first call
    /// emits a close frame.
    pub async fn close(&self, code: CloseCode) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: WsCloseCode::from(u16::from(code)),
            reason: "".into(),
        };
        if self.outbox.send(WsMessage::Close(Some(frame))).await.is_err() {
            debug!(path = self.path_number, "connection already gone while closing");
        }
    }

    async fn write(&self, message: WsMessage) -> Result<(), ProtocolError> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    async fn pack_with<F>(&self, build: F) -> Result<Vec<u8>, ProtocolError>
    where
        F: FnOnce(&Nonce, &Keypair, &PublicKey) -> Result<Message, ProtocolError>,
    {
        let mut state = self.state.lock().await;
        let csn = state.outgoing_csn.take()?;
        let nonce = Nonce::new(
            state.server_cookie.clone(),
            address::SERVER,
            state.address,
            csn,
        );
        let message = build(&nonce, &state.session_key, &state.client_key)?;
        let payload = message.to_bytes()?;

        // server-hello must be readable before any box exists.
        if matches!(message, Message::ServerHello { .. }) {
            return Ok(nonce::join_frame(&nonce, &payload));
        }

        let SessionState {
            session_key,
            client_key,
            peer_box,
            ..
        } = &mut *state;
        let peer_box = peer_box.get_or_insert_with(|| session_key.box_with(client_key));
        let ciphertext = peer_box
            .seal(&nonce.to_bytes(), &payload)
            .map_err(|e| ProtocolError::Signaling(format!("cannot encrypt message: {e}")))?;
        Ok(nonce::join_frame(&nonce, &ciphertext))
    }

    /// Classify and decode one inbound frame.
    pub async fn unpack(&self, frame: Vec<u8>) -> Result<Incoming, ProtocolError> {
        let (nonce, payload) = nonce::split_frame(&frame)?;
        let authenticated = self.is_authenticated();
        let mut state = self.state.lock().await;

        // Peer-to-peer frames are identified by their destination byte
        // and are never decrypted.
        if !nonce.destination().is_server() {
            if !authenticated {
                return Err(ProtocolError::Message(format!(
                    "invalid destination {} before authentication",
                    nonce.destination()
                )));
            }
            if nonce.source() != state.address {
                return Err(ProtocolError::Message(format!(
                    "source {} does not match the sender's address {}",
                    nonce.source(),
                    state.address
                )));
            }
            check_incoming_csn(&mut state.incoming_csn, &nonce)?;
            let (source, destination) = (nonce.source(), nonce.destination());
            drop(state);
            return Ok(Incoming::Relay {
                frame,
                source,
                destination,
            });
        }

        // Client-to-server traffic: the source byte must match the
        // client's (eventual) address.
        let source_valid = if authenticated {
            nonce.source() == state.address
        } else {
            match state.role {
                None => nonce.source().is_server() || nonce.source().is_initiator(),
                Some(Role::Responder) => nonce.source().is_server(),
                Some(Role::Initiator) => nonce.source().is_initiator(),
            }
        };
        if !source_valid {
            return Err(ProtocolError::Message(format!(
                "invalid source {} in state {:?}",
                nonce.source(),
                state.role
            )));
        }
        check_incoming_csn(&mut state.incoming_csn, &nonce)?;

        // The only unencrypted client message is client-hello, sent
        // before a role is known, from the unassigned address.
        let plaintext_legal = state.role.is_none() && nonce.source().is_server();
        let message = if plaintext_legal {
            Message::from_bytes(payload)?
        } else {
            let SessionState {
                session_key,
                client_key,
                peer_box,
                ..
            } = &mut *state;
            let peer_box = peer_box.get_or_insert_with(|| session_key.box_with(client_key));
            let plaintext = peer_box
                .open(&nonce.to_bytes(), payload)
                .map_err(|_| ProtocolError::Message("cannot decrypt message".into()))?;
            Message::from_bytes(&plaintext)?
        };

        Ok(Incoming::Signalling { message, nonce })
    }
}

fn check_incoming_csn(
    seen: &mut HashMap<(u8, u8), u64>,
    nonce: &Nonce,
) -> Result<(), ProtocolError> {
    let pair = (nonce.source().0, nonce.destination().0);
    let value = nonce.csn().value();
    if let Some(&last) = seen.get(&pair) {
        if value <= last {
            return Err(ProtocolError::Message(format!(
                "combined sequence number did not increase for pair {} -> {}",
                nonce.source(),
                nonce.destination()
            )));
        }
    }
    seen.insert(pair, value);
    Ok(())
}

/// Spawn the writer task draining a session outbox into the sink half
/// of the WebSocket.
pub fn spawn_writer<S>(mut sink: SplitSink<WebSocketStream<S>, WsMessage>) -> mpsc::Sender<WsMessage>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(OUTBOX_CAPACITY);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    tx
}
