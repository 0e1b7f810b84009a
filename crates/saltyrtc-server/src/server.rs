//! The WebSocket accept loop and server lifecycle.
//!
//! Accepts TCP (optionally TLS) connections, upgrades them to
//! WebSockets while negotiating the signalling subprotocol, validates
//! the hex-encoded path key in the URL and hands each connection to a
//! protocol engine. Shutdown is a watch channel every engine observes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use saltyrtc_core::{CloseCode, ProtocolError, KEY_LENGTH, SUBPROTOCOL};
use saltyrtc_crypto::{ensure_distinct_keys, Keypair};

use crate::events::{Event, EventHub};
use crate::path::PathMap;
use crate::protocol::{Connection, RELAY_TIMEOUT};
use crate::session::{self, ClientSession};

/// Server configuration beyond the listen address.
pub struct ServerConfig {
    /// Long-lived server keys clients may pin via `client-auth`.
    pub permanent_keys: Vec<Keypair>,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub relay_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            permanent_keys: Vec::new(),
            keep_alive_interval: session::KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: session::KEEP_ALIVE_TIMEOUT,
            relay_timeout: RELAY_TIMEOUT,
        }
    }
}

/// State shared between the accept loop and every engine.
pub struct ServerState {
    pub paths: PathMap,
    pub permanent_keys: Arc<Vec<Keypair>>,
    pub events: EventHub,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub relay_timeout: Duration,
    pub shutdown_tx: watch::Sender<bool>,
}

pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// A cheap handle for closing and observing a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// Signal shutdown: engines close their connections with 1001 and
    /// `Server::run` returns once all of them have exited.
    pub fn close(&self) {
        let _ = self.state.shutdown_tx.send(true);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.state.events.subscribe()
    }

    pub async fn path_count(&self) -> usize {
        self.state.paths.len().await
    }
}

impl Server {
    /// Validate the configuration and bind the listener.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        config: ServerConfig,
    ) -> anyhow::Result<Server> {
        ensure_distinct_keys(&config.permanent_keys)
            .map_err(|_| ProtocolError::ServerKey("Repeated permanent keys".into()))?;

        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);

        let (shutdown_tx, _) = watch::channel(false);
        let state = Arc::new(ServerState {
            paths: PathMap::new(),
            permanent_keys: Arc::new(config.permanent_keys),
            events: EventHub::new(),
            keep_alive_interval: config.keep_alive_interval,
            keep_alive_timeout: config.keep_alive_timeout,
            relay_timeout: config.relay_timeout,
            shutdown_tx,
        });

        Ok(Server {
            state,
            listener,
            tls,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.state.clone(),
        }
    }

    /// Accept connections until shutdown, then wait for every
    /// connection to finish.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown = self.state.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            warn!("accept failed: {error}");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    let tls = self.tls.clone();
                    connections.spawn(handle_connection(state, tls, stream, peer));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        debug!("draining {} connections", connections.len());
        while connections.join_next().await.is_some() {}
        info!("all connections closed");
        Ok(())
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    tls: Option<TlsAcceptor>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => serve_websocket(state, stream, peer).await,
            Err(error) => debug!("TLS accept from {peer} failed: {error}"),
        },
        None => serve_websocket(state, stream, peer).await,
    }
}

async fn serve_websocket<S>(state: Arc<ServerState>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut url_path = String::new();
    let mut subprotocol_matched = false;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        url_path = request.uri().path().to_owned();
        if let Some(offered) = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
        {
            if offered.split(',').any(|p| p.trim() == SUBPROTOCOL) {
                subprotocol_matched = true;
                response
                    .headers_mut()
                    .append("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
            }
        }
        Ok(response)
    };

    let websocket = match accept_hdr_async(stream, callback).await {
        Ok(websocket) => websocket,
        Err(error) => {
            debug!("WebSocket upgrade from {peer} failed: {error}");
            return;
        }
    };

    if !subprotocol_matched {
        debug!("no shared subprotocol with {peer}");
        reject(websocket, CloseCode::NoSharedSubprotocol).await;
        return;
    }

    let initiator_key = match parse_path(&url_path) {
        Ok(key) => key,
        Err(error) => {
            debug!("{peer}: {error}");
            reject(websocket, CloseCode::ProtocolError).await;
            return;
        }
    };

    let path = state.paths.get_or_create(initiator_key).await;
    debug!(path = path.number(), "new connection from {peer}");

    let (sink, reader) = websocket.split();
    let outbox = session::spawn_writer(sink);
    let session = Arc::new(ClientSession::new(
        outbox,
        initiator_key.into(),
        path.number(),
        state.keep_alive_interval,
    ));

    let shutdown = state.shutdown_tx.subscribe();
    Connection {
        server: state,
        path,
        session,
        reader,
        shutdown,
    }
    .run()
    .await;
}

/// Close a connection that never became a session.
async fn reject<S>(mut websocket: WebSocketStream<S>, code: CloseCode)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let frame = CloseFrame {
        code: WsCloseCode::from(u16::from(code)),
        reason: "".into(),
    };
    if websocket.close(Some(frame)).await.is_err() {
        return;
    }
    // Drive the close handshake to completion.
    while let Some(Ok(_)) = websocket.next().await {}
}

/// Parse `/<64 lowercase hex chars>` into the initiator key.
fn parse_path(url_path: &str) -> Result<[u8; KEY_LENGTH], ProtocolError> {
    let claimed = url_path.trim_matches('/');
    if claimed.len() != 2 * KEY_LENGTH {
        return Err(ProtocolError::Path(format!(
            "invalid path length: {}",
            claimed.len()
        )));
    }
    if !claimed
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return Err(ProtocolError::Path("path is not lowercase hex".into()));
    }
    let bytes =
        hex::decode(claimed).map_err(|e| ProtocolError::Path(format!("cannot decode path: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::Path("invalid key length".into()))
}

/// Build a TLS acceptor from PEM files. The private key may live in the
/// certificate file.
pub fn load_tls_acceptor(
    cert_path: &std::path::Path,
    key_path: Option<&std::path::Path>,
) -> anyhow::Result<TlsAcceptor> {
    use std::fs::File;
    use std::io::BufReader;

    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_reader)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let key_source = key_path.unwrap_or(cert_path);
    let mut key_reader = BufReader::new(File::open(key_source)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?;
    if keys.is_empty() {
        let mut key_reader = BufReader::new(File::open(key_source)?);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)?;
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_source.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(key))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_accepts_lowercase_hex() {
        let path = format!("/{}", "ab".repeat(32));
        assert_eq!(parse_path(&path).unwrap(), [0xab; KEY_LENGTH]);
    }

    #[test]
    fn parse_path_rejects_wrong_length() {
        assert!(parse_path(&format!("/{}", "ab".repeat(31))).is_err());
        assert!(parse_path(&format!("/{}a", "ab".repeat(32))).is_err());
        assert!(parse_path("/").is_err());
    }

    #[test]
    fn parse_path_rejects_non_hex_and_uppercase() {
        let mut path = format!("/{}", "ab".repeat(32));
        path.replace_range(1..2, "g");
        assert!(parse_path(&path).is_err());

        let upper = format!("/{}", "AB".repeat(32));
        assert!(parse_path(&upper).is_err());
    }

    #[tokio::test]
    async fn bind_rejects_repeated_permanent_keys() {
        let key = Keypair::generate();
        let copy = Keypair::from_bytes(key.secret_key().to_bytes());
        let config = ServerConfig {
            permanent_keys: vec![key, copy],
            ..ServerConfig::default()
        };
        let error = Server::bind("127.0.0.1:0".parse().unwrap(), None, config)
            .await
            .unwrap_err();
        let protocol_error = error.downcast_ref::<ProtocolError>().unwrap();
        assert!(matches!(protocol_error, ProtocolError::ServerKey(_)));
        assert!(protocol_error.to_string().contains("Repeated permanent keys"));
    }
}
