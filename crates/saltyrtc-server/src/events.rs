//! Connection lifecycle events.
//!
//! Events are published on a broadcast channel so that subscribers can
//! never block the protocol engine; a subscriber that falls behind loses
//! the oldest events rather than applying backpressure.

use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

/// A lifecycle event, tagged with the hex-encoded path key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An initiator completed its handshake.
    InitiatorConnected { path: String },
    /// A responder completed its handshake.
    ResponderConnected { path: String },
    /// A client left; `close_code` is the code its connection was
    /// closed with.
    Disconnected { path: String, close_code: u16 },
}

#[derive(Debug)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        EventHub { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. A send without subscribers is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
