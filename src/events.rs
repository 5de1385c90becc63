use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::call::{CallStatus, CallType};
use crate::peer::state::PeerState;
use crate::peer::types::RemoteStream;

/// Everything the agent reports to the embedding application.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CallEvent {
    StatusChanged {
        status: CallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    IncomingCall {
        from: String,
        call_type: CallType,
    },
    Duration {
        seconds: u64,
    },
    RemoteStream {
        peer_id: String,
        stream: RemoteStream,
    },
    RemoteStreamRemoved {
        peer_id: String,
    },
    PeerStateChanged {
        peer_id: String,
        state: PeerState,
    },
    PeerJoined {
        peer_id: String,
        has_stream: bool,
    },
    PeerLeft {
        peer_id: String,
    },
    SafetyNumber {
        peer_id: String,
        sas: String,
    },
    /// User-visible outcome ("call failed", "no answer", "call declined").
    Outcome {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Fan-out of [`CallEvent`]s. Emitting never blocks; lagging receivers lose
/// the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        debug!(?event, "call event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
