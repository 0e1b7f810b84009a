//! The per-connection protocol engine.
//!
//! Drives one client from WebSocket accept to close: the handshake
//! (server-hello, client-hello/client-auth, server-auth), then the relay
//! phase where a receive loop and a keep-alive loop run side by side and
//! the first one to fail tears the connection down.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_bytes::ByteBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use saltyrtc_core::cookie::Cookie;
use saltyrtc_core::message::Message;
use saltyrtc_core::nonce::Nonce;
use saltyrtc_core::{CloseCode, ProtocolError, KEY_LENGTH, SUBPROTOCOL};
use saltyrtc_crypto::{sha256, sign_keys, Keypair, PublicKey};

use crate::events::Event;
use crate::path::Path;
use crate::server::ServerState;
use crate::session::{ClientSession, Incoming, Role};

/// Bounded wait for a relay receiver to accept a frame.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// One client connection being driven by the engine.
pub struct Connection<S> {
    pub server: Arc<ServerState>,
    pub path: Arc<Path>,
    pub session: Arc<ClientSession>,
    pub reader: SplitStream<WebSocketStream<S>>,
    pub shutdown: watch::Receiver<bool>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Drive the connection to completion and tear it down.
    pub async fn run(mut self) {
        let outcome = self.signalling().await;
        let close_code = match outcome {
            Ok(code) => Some(code),
            Err(ProtocolError::Disconnected) => {
                debug!(path = self.path.number(), "client disconnected");
                None
            }
            Err(ref error) => {
                info!(path = self.path.number(), "connection failed: {error}");
                error.close_code()
            }
        };

        if let Some(code) = close_code {
            self.session.close(code).await;
        }

        let role = self.session.role().await;
        let slot = self.session.address().await;
        let was_member = self
            .server
            .paths
            .remove(&self.path, &self.session)
            .await;

        // Tell the peers, unless this client was displaced and its slot
        // now belongs to someone else.
        if was_member && self.session.is_authenticated() {
            match role {
                Some(Role::Responder) => {
                    if let Some(initiator) = self.path.initiator() {
                        if let Err(e) = initiator.enqueue(Message::Disconnected { id: slot.0 }).await
                        {
                            debug!(path = self.path.number(), "cannot notify initiator: {e}");
                        }
                    }
                }
                Some(Role::Initiator) => {
                    for responder in self.path.responders() {
                        if let Err(e) = responder
                            .enqueue(Message::Disconnected { id: slot.0 })
                            .await
                        {
                            debug!(path = self.path.number(), "cannot notify responder: {e}");
                        }
                    }
                }
                None => {}
            }
        }

        self.server.events.emit(Event::Disconnected {
            path: hex::encode(self.path.key()),
            close_code: close_code.map_or(u16::from(CloseCode::Normal), u16::from),
        });
    }

    /// Handshake plus relay phase. Returns the close code for an orderly
    /// shutdown; every protocol failure surfaces as an error.
    async fn signalling(&mut self) -> Result<CloseCode, ProtocolError> {
        let mut shutdown = self.shutdown.clone();

        // A client may stall mid-handshake; shutdown must still reach it.
        let role = tokio::select! {
            result = self.handshake() => result?,
            _ = wait_shutdown(&mut shutdown) => return Ok(CloseCode::GoingAway),
        };

        let path_hex = hex::encode(self.path.key());
        self.server.events.emit(match role {
            Role::Initiator => Event::InitiatorConnected { path: path_hex },
            Role::Responder => Event::ResponderConnected { path: path_hex },
        });

        let keep_alive_timeout = self.server.keep_alive_timeout;
        let relay_timeout = self.server.relay_timeout;

        tokio::select! {
            result = receive_loop(&mut self.reader, &self.session, &self.path, role, relay_timeout) => {
                match result {
                    Ok(()) => Err(ProtocolError::Signaling("receive loop returned too early".into())),
                    Err(error) => Err(error),
                }
            }
            result = keep_alive_loop(&self.session, keep_alive_timeout) => {
                match result {
                    Ok(()) => Err(ProtocolError::Signaling("keep-alive loop returned too early".into())),
                    Err(error) => Err(error),
                }
            }
            _ = wait_shutdown(&mut shutdown) => Ok(CloseCode::GoingAway),
        }
    }

    async fn handshake(&mut self) -> Result<Role, ProtocolError> {
        // server-hello carries the fresh session key and server cookie.
        let session_key = self.session.session_public_key().await;
        self.session
            .send(Message::ServerHello {
                key: ByteBuf::from(session_key.as_bytes().to_vec()),
            })
            .await?;

        let frame = next_frame(&mut self.reader, &self.session).await?;
        let (message, nonce) = match self.session.unpack(frame).await? {
            Incoming::Signalling { message, nonce } => (message, nonce),
            Incoming::Relay { .. } => {
                return Err(ProtocolError::MessageFlow(
                    "relay frame during handshake".into(),
                ))
            }
        };

        match message {
            // The initiator authenticates in one step; its key is the
            // path key, so the box already exists.
            Message::ClientAuth {
                your_cookie,
                subprotocols,
                ping_interval,
                your_key,
            } if nonce.source().is_initiator() => {
                self.session.set_role(Role::Initiator).await;
                let pinned = self
                    .process_client_auth(your_cookie, subprotocols, ping_interval, your_key, &nonce)
                    .await?;
                self.handshake_initiator(pinned).await?;
                Ok(Role::Initiator)
            }
            // A responder announces its key first, then authenticates.
            Message::ClientHello { key } if nonce.source().is_server() => {
                let key: [u8; KEY_LENGTH] = key.as_ref().try_into().map_err(|_| {
                    ProtocolError::Message(format!("invalid client key length: {}", key.len()))
                })?;
                self.session.set_client_key(PublicKey::from(key)).await;
                self.session.set_role(Role::Responder).await;
                self.handshake_responder().await?;
                Ok(Role::Responder)
            }
            other => Err(ProtocolError::MessageFlow(format!(
                "expected 'client-hello' or 'client-auth', got '{}'",
                other.kind()
            ))),
        }
    }

    async fn handshake_initiator(&mut self, pinned: Option<usize>) -> Result<(), ProtocolError> {
        self.session.set_authenticated();
        let previous = self
            .server
            .paths
            .register_initiator(&self.path, &self.session)
            .await;

        if let Some(previous) = previous {
            debug!(path = self.path.number(), "dropping previous initiator");
            tokio::spawn(async move { previous.close(CloseCode::DroppedByInitiator).await });
        }

        let client_cookie = self.session.client_cookie().await.ok_or_else(|| {
            ProtocolError::Signaling("client cookie missing after client-auth".into())
        })?;
        let responders = self.path.responder_ids();
        let permanent_keys = Arc::clone(&self.server.permanent_keys);
        self.session
            .send_with(move |nonce, session_key, client_key| {
                Ok(Message::ServerAuth {
                    your_cookie: ByteBuf::from(client_cookie.as_bytes().to_vec()),
                    responders: Some(responders),
                    initiator_connected: None,
                    signed_keys: signed_keys_field(
                        &permanent_keys,
                        pinned,
                        session_key,
                        client_key,
                        nonce,
                    )?,
                })
            })
            .await?;

        // Everyone already on the path learns about the new initiator.
        for responder in self.path.responders() {
            if let Err(e) = responder.enqueue(Message::NewInitiator {}).await {
                debug!(path = self.path.number(), "cannot notify responder: {e}");
            }
        }
        Ok(())
    }

    async fn handshake_responder(&mut self) -> Result<(), ProtocolError> {
        // client-auth must follow immediately.
        let frame = next_frame(&mut self.reader, &self.session).await?;
        let (message, nonce) = match self.session.unpack(frame).await? {
            Incoming::Signalling { message, nonce } => (message, nonce),
            Incoming::Relay { .. } => {
                return Err(ProtocolError::MessageFlow(
                    "relay frame during handshake".into(),
                ))
            }
        };
        let pinned = match message {
            Message::ClientAuth {
                your_cookie,
                subprotocols,
                ping_interval,
                your_key,
            } => {
                self.process_client_auth(your_cookie, subprotocols, ping_interval, your_key, &nonce)
                    .await?
            }
            other => {
                return Err(ProtocolError::MessageFlow(format!(
                    "expected 'client-auth', got '{}'",
                    other.kind()
                )))
            }
        };

        self.session.set_authenticated();
        let slot = self
            .server
            .paths
            .register_responder(&self.path, &self.session)
            .await?;
        self.session.assign_slot(slot).await;

        // The initiator hears about the new responder before the
        // responder sees its server-auth.
        let initiator = self.path.initiator();
        if let Some(ref initiator) = initiator {
            if let Err(e) = initiator.enqueue(Message::NewResponder { id: slot }).await {
                debug!(path = self.path.number(), "cannot notify initiator: {e}");
            }
        }

        let client_cookie = self.session.client_cookie().await.ok_or_else(|| {
            ProtocolError::Signaling("client cookie missing after client-auth".into())
        })?;
        let permanent_keys = Arc::clone(&self.server.permanent_keys);
        let initiator_connected = initiator.is_some();
        self.session
            .send_with(move |nonce, session_key, client_key| {
                Ok(Message::ServerAuth {
                    your_cookie: ByteBuf::from(client_cookie.as_bytes().to_vec()),
                    responders: None,
                    initiator_connected: Some(initiator_connected),
                    signed_keys: signed_keys_field(
                        &permanent_keys,
                        pinned,
                        session_key,
                        client_key,
                        nonce,
                    )?,
                })
            })
            .await?;
        Ok(())
    }

    /// Validate the fields of a `client-auth` message. Returns the index
    /// of the pinned permanent key, if the client pinned one.
    async fn process_client_auth(
        &self,
        your_cookie: ByteBuf,
        subprotocols: Option<Vec<String>>,
        ping_interval: Option<u32>,
        your_key: Option<ByteBuf>,
        nonce: &Nonce,
    ) -> Result<Option<usize>, ProtocolError> {
        let echoed = Cookie::from_slice(&your_cookie)
            .ok_or_else(|| ProtocolError::Message("invalid cookie length".into()))?;
        if echoed != self.session.server_cookie().await {
            return Err(ProtocolError::Message("Cookies do not match".into()));
        }
        self.session.set_client_cookie(nonce.cookie().clone()).await;

        if let Some(subprotocols) = subprotocols {
            if !subprotocols.iter().any(|p| p == SUBPROTOCOL) {
                return Err(ProtocolError::Message(format!(
                    "no shared subprotocol, client offered {subprotocols:?}"
                )));
            }
        }

        if let Some(seconds) = ping_interval {
            if !(1..=86_400).contains(&seconds) {
                return Err(ProtocolError::Message(format!(
                    "ping interval out of range: {seconds}"
                )));
            }
            self.session
                .set_keep_alive_interval(Duration::from_secs(u64::from(seconds)))
                .await;
        }

        match your_key {
            None => Ok(None),
            Some(your_key) => {
                let key: [u8; KEY_LENGTH] = your_key.as_ref().try_into().map_err(|_| {
                    ProtocolError::Message(format!("invalid key length: {}", your_key.len()))
                })?;
                self.server
                    .permanent_keys
                    .iter()
                    .position(|keypair| keypair.public_key().as_bytes() == &key)
                    .map(Some)
                    .ok_or_else(|| {
                        ProtocolError::Message("unknown server permanent key".into())
                    })
            }
        }
    }
}

/// Build the optional `signed_keys` field of a `server-auth` message.
fn signed_keys_field(
    permanent_keys: &[Keypair],
    pinned: Option<usize>,
    session_key: &Keypair,
    client_key: &PublicKey,
    nonce: &Nonce,
) -> Result<Option<ByteBuf>, ProtocolError> {
    let Some(index) = pinned else {
        return Ok(None);
    };
    let signed = sign_keys(
        &permanent_keys[index],
        client_key,
        &session_key.public_key(),
        &nonce.to_bytes(),
    )
    .map_err(|e| ProtocolError::Signaling(format!("cannot sign keys: {e}")))?;
    Ok(Some(ByteBuf::from(signed)))
}

/// Read frames until the connection closes or a protocol error occurs.
async fn receive_loop<S>(
    reader: &mut SplitStream<WebSocketStream<S>>,
    session: &Arc<ClientSession>,
    path: &Arc<Path>,
    role: Role,
    relay_timeout: Duration,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = next_frame(reader, session).await?;
        match session.unpack(frame).await? {
            Incoming::Relay {
                frame, destination, ..
            } => {
                let receiver = match role {
                    Role::Initiator => path.responder(destination.0)?,
                    Role::Responder => path.initiator(),
                };
                relay(session, receiver, frame, relay_timeout).await?;
            }
            Incoming::Signalling {
                message: Message::DropResponder { id, reason },
                ..
            } if role == Role::Initiator => {
                let code = match reason {
                    None => CloseCode::DroppedByInitiator,
                    Some(code) => CloseCode::try_from_u16(code).ok_or_else(|| {
                        ProtocolError::Message(format!("invalid drop reason: {code}"))
                    })?,
                };
                match path.responder(id)? {
                    Some(responder) => {
                        debug!(path = path.number(), slot = id, "dropping responder");
                        tokio::spawn(async move { responder.close(code).await });
                    }
                    None => {
                        debug!(path = path.number(), slot = id, "responder already gone");
                    }
                }
            }
            Incoming::Signalling { message, .. } => {
                return Err(ProtocolError::MessageFlow(format!(
                    "unexpected '{}' message after handshake",
                    message.kind()
                )));
            }
        }
    }
}

/// Forward a relay frame, falling back to a `send-error` towards the
/// sender when the receiver is absent, gone or too slow.
async fn relay(
    sender: &Arc<ClientSession>,
    receiver: Option<Arc<ClientSession>>,
    frame: Vec<u8>,
    relay_timeout: Duration,
) -> Result<(), ProtocolError> {
    let digest = sha256(&frame);
    let delivered = match receiver {
        None => false,
        Some(receiver) => {
            match tokio::time::timeout(relay_timeout, receiver.forward(frame)).await {
                Ok(Ok(())) => true,
                Ok(Err(ProtocolError::Disconnected)) => false,
                Ok(Err(error)) => return Err(error),
                Err(_elapsed) => false,
            }
        }
    };

    if !delivered {
        debug!("relay failed, reporting send-error to the sender");
        if let Err(error) = sender
            .send(Message::SendError {
                id: ByteBuf::from(digest.to_vec()),
            })
            .await
        {
            // The sender may be gone as well; its own loop notices.
            warn!("cannot deliver send-error: {error}");
        }
    }
    Ok(())
}

/// Ping the client periodically; a missing pong fails the connection.
async fn keep_alive_loop(
    session: &Arc<ClientSession>,
    keep_alive_timeout: Duration,
) -> Result<(), ProtocolError> {
    loop {
        session.ping().await?;
        if tokio::time::timeout(keep_alive_timeout, session.wait_pong())
            .await
            .is_err()
        {
            return Err(ProtocolError::PingTimeout);
        }
        tokio::time::sleep(session.keep_alive_interval().await).await;
    }
}

/// Read one binary frame, handling control frames in between.
async fn next_frame<S>(
    reader: &mut SplitStream<WebSocketStream<S>>,
    session: &ClientSession,
) -> Result<Vec<u8>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = match reader.next().await {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => return Err(ProtocolError::Disconnected),
        };
        match message {
            WsMessage::Binary(data) => return Ok(data),
            WsMessage::Pong(_) => session.notify_pong(),
            // tungstenite queues the matching pong on its own.
            WsMessage::Ping(_) => {}
            WsMessage::Close(_) => return Err(ProtocolError::Disconnected),
            WsMessage::Text(_) => {
                return Err(ProtocolError::Message("expected a binary frame".into()))
            }
            WsMessage::Frame(_) => {}
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // The server state outlives every connection; a dropped
            // sender means we are already tearing down.
            std::future::pending::<()>().await;
        }
    }
}
