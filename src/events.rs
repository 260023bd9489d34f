use tokio::sync::broadcast;

use crate::config::EndpointAddr;
use crate::errors::ConnectionFailureKind;

/// Out-of-band notifications published by internal tasks. These never carry
/// per-command failures (those resolve the command's own future); they exist
/// so an operator can observe churn without polling.
#[derive(Debug, Clone)]
pub enum MultiplexerEvent {
    ConnectionFailed {
        endpoint: EndpointAddr,
        cause: ConnectionFailureKind,
    },
    ConnectionRestored {
        endpoint: EndpointAddr,
    },
    ConfigurationChanged,
    HashSlotMoved {
        slot: u16,
        from: Option<EndpointAddr>,
        to: EndpointAddr,
    },
    /// A server `-` reply that was surfaced to a caller.
    ErrorMessage {
        endpoint: EndpointAddr,
        message: Vec<u8>,
    },
    /// A failure inside a background task (heartbeat probe, topology
    /// refresh) that no caller observes directly.
    InternalError {
        detail: String,
    },
}

const EVENT_CAPACITY: usize = 128;

/// Bounded broadcast fan-out. Publishing never blocks the task that raised
/// the event; a lagging subscriber skips the oldest entries.
#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<MultiplexerEvent>,
}

impl EventBus {
    pub(crate) fn new() -> EventBus {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    pub(crate) fn publish(&self, event: MultiplexerEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.tx.subscribe()
    }
}
