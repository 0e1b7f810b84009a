//! Protocol failure taxonomy.
//!
//! Every way a signalling connection can fail maps onto one of these
//! variants; the engine translates them into WebSocket close codes when
//! tearing the connection down.

use thiserror::Error;

use crate::close_code::CloseCode;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The connection URL path is not a valid hex-encoded public key.
    #[error("invalid connection path: {0}")]
    Path(String),

    /// A well-formed frame with invalid contents (bad field types,
    /// cookie mismatch, sequence number regression, ...).
    #[error("message error: {0}")]
    Message(String),

    /// A valid message arrived in a protocol state that does not allow it.
    #[error("message flow error: {0}")]
    MessageFlow(String),

    /// No free responder slot left on the path.
    #[error("no free responder slot on path")]
    SlotsFull,

    /// The outgoing combined sequence number would exceed 2^48 - 1.
    #[error("combined sequence number overflow")]
    Overflow,

    /// The peer did not answer a keep-alive ping in time.
    #[error("keep-alive ping timed out")]
    PingTimeout,

    /// The peer connection is closed.
    #[error("connection closed")]
    Disconnected,

    /// An internal invariant was violated.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The server's permanent keys are misconfigured.
    #[error("server key error: {0}")]
    ServerKey(String),
}

impl ProtocolError {
    /// The close code a connection failing with this error is closed with.
    ///
    /// `Disconnected` has no code: the socket is already gone and there
    /// is nobody left to tell.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            ProtocolError::Path(_)
            | ProtocolError::Message(_)
            | ProtocolError::MessageFlow(_)
            | ProtocolError::Overflow => Some(CloseCode::ProtocolError),
            ProtocolError::SlotsFull => Some(CloseCode::PathFull),
            ProtocolError::PingTimeout => Some(CloseCode::KeepAliveTimeout),
            ProtocolError::Signaling(_) | ProtocolError::ServerKey(_) => {
                Some(CloseCode::InternalError)
            }
            ProtocolError::Disconnected => None,
        }
    }
}
