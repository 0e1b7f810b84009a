#![forbid(unsafe_code)]

//! SaltyRTC signalling server command line interface.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use saltyrtc_core::{ProtocolError, SUBPROTOCOL};
use saltyrtc_crypto::{CryptoError, Keypair};
use saltyrtc_server::server::load_tls_acceptor;
use saltyrtc_server::{Server, ServerConfig};

/// Escape hatch for running without TLS and a permanent key.
const SAFETY_OFF: &str = "SALTYRTC_SAFETY_OFF";
const SAFETY_OFF_VALUE: &str = "yes-and-i-know-what-im-doing";

#[derive(Parser, Debug)]
#[command(name = "saltyrtc-server")]
#[command(about = "SaltyRTC signalling server")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the signalling server. A HUP signal restarts it and
    /// reloads the TLS certificate, TLS private key and permanent keys.
    Serve(ServeArgs),

    /// Show version information and the implemented protocol versions.
    Version,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Path to a PEM file with the TLS certificate
    #[arg(long = "tlscert")]
    tls_cert: Option<PathBuf>,

    /// Path to a PEM file with the TLS private key. Read from the
    /// certificate file if not present
    #[arg(long = "tlskey")]
    tls_key: Option<PathBuf>,

    /// Path to a file with a hex-encoded private permanent key of the
    /// server. May be repeated; the first key is the primary
    #[arg(short = 'k', long = "key")]
    keys: Vec<PathBuf>,

    /// Bind to a specific host
    #[arg(long)]
    host: Option<String>,

    /// Listen on a specific port
    #[arg(short, long, default_value_t = 443)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Version => {
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Protocols: {:?}", [SUBPROTOCOL]);
            Ok(())
        }
        Command::Serve(serve_args) => {
            let safety_off = std::env::var(SAFETY_OFF)
                .map(|value| value == SAFETY_OFF_VALUE)
                .unwrap_or(false);
            if serve_args.tls_cert.is_none() || serve_args.keys.is_empty() {
                if safety_off {
                    eprintln!(
                        "It is RECOMMENDED to use SaltyRTC with both a TLS \
                         certificate and a server permanent key"
                    );
                } else {
                    eprintln!(
                        "It is REQUIRED to provide a TLS certificate and a server \
                         permanent key unless the environment variable \
                         '{SAFETY_OFF}' is set to '{SAFETY_OFF_VALUE}'"
                    );
                    std::process::exit(2);
                }
            }

            match serve(serve_args).await {
                Ok(()) => Ok(()),
                Err(error) => {
                    let config_error = error.is::<CryptoError>()
                        || matches!(
                            error.downcast_ref::<ProtocolError>(),
                            Some(ProtocolError::ServerKey(_))
                        );
                    eprintln!("An error occurred: {error:#}");
                    std::process::exit(if config_error { 2 } else { 1 });
                }
            }
        }
    }
}

/// Run the server, restarting (and reloading keys and certificates) on
/// SIGHUP, until interrupted.
async fn serve(args: ServeArgs) -> Result<()> {
    loop {
        let tls = match &args.tls_cert {
            Some(cert) => Some(load_tls_acceptor(cert, args.tls_key.as_deref())?),
            None => None,
        };
        let permanent_keys = args
            .keys
            .iter()
            .map(|path| Keypair::load(path))
            .collect::<Result<Vec<_>, _>>()?;
        let config = ServerConfig {
            permanent_keys,
            ..ServerConfig::default()
        };

        let addr = resolve_bind_addr(args.host.as_deref(), args.port)?;
        let server = Server::bind(addr, tls, config).await?;
        let handle = server.handle();
        let mut run = tokio::spawn(server.run());
        info!("started");

        let restart = tokio::select! {
            _ = hangup() => {
                info!("SIGHUP received, restarting");
                true
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                false
            }
            result = &mut run => {
                // The accept loop never returns on its own unless it failed.
                return result?;
            }
        };

        handle.close();
        run.await??;
        info!("stopped");

        if !restart {
            return Ok(());
        }
    }
}

fn resolve_bind_addr(host: Option<&str>, port: u16) -> Result<SocketAddr> {
    let host = host.unwrap_or("0.0.0.0");
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve bind address {host}:{port}"))
}

#[cfg(unix)]
async fn hangup() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(mut hup) => {
            hup.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending().await
}
