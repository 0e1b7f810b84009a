//! The signalling message codec.
//!
//! Every non-relayed payload is a MessagePack map with a required string
//! field `type`. Binary fields (keys, cookies, digests) are MessagePack
//! bin values; `responders` is an array of integers.
//!
//! Relayed peer-to-peer frames never reach this codec: they are
//! classified by their nonce destination byte and forwarded verbatim.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::ProtocolError;

/// A parsed signalling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// First message on the wire, server to client, unencrypted.
    ServerHello { key: ByteBuf },

    /// A responder announcing its public key, unencrypted.
    ClientHello { key: ByteBuf },

    /// Client authentication, encrypted with the session box.
    ClientAuth {
        your_cookie: ByteBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subprotocols: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ping_interval: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        your_key: Option<ByteBuf>,
    },

    /// Server authentication reply. `responders` is present for the
    /// initiator, `initiator_connected` for responders.
    ServerAuth {
        your_cookie: ByteBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        responders: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator_connected: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signed_keys: Option<ByteBuf>,
    },

    /// A new initiator took over the path (sent to responders).
    NewInitiator {},

    /// A new responder joined the path (sent to the initiator).
    NewResponder { id: u8 },

    /// Initiator asks the server to drop a responder.
    DropResponder {
        id: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<u16>,
    },

    /// A prior relay attempt failed; `id` is the SHA-256 digest of the
    /// failed wire frame.
    SendError { id: ByteBuf },

    /// The addressed peer left the path.
    Disconnected { id: u8 },
}

impl Message {
    /// The wire value of the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ServerHello { .. } => "server-hello",
            Message::ClientHello { .. } => "client-hello",
            Message::ClientAuth { .. } => "client-auth",
            Message::ServerAuth { .. } => "server-auth",
            Message::NewInitiator {} => "new-initiator",
            Message::NewResponder { .. } => "new-responder",
            Message::DropResponder { .. } => "drop-responder",
            Message::SendError { .. } => "send-error",
            Message::Disconnected { .. } => "disconnected",
        }
    }

    /// Serialize into a MessagePack map with string keys.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| ProtocolError::Signaling(format!("cannot encode message: {e}")))
    }

    /// Parse a MessagePack payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ProtocolError::Message(format!("malformed message: {e}")))
    }
}
