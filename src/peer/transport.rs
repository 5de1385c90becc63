use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::media::LocalTrack;
use crate::peer::types::{IceCandidate, RemoteTrack, ServerConfig, SessionDescription};

/// Connection state reported by a media transport.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback side effects of a media transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
}

/// A transport event tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct TransportNotice {
    pub peer_id: String,
    pub connection_id: u64,
    pub event: TransportEvent,
}

/// Where a transport reports its callbacks.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer_id: String,
    connection_id: u64,
    tx: mpsc::UnboundedSender<TransportNotice>,
}

impl TransportEventSink {
    pub fn new(
        peer_id: impl Into<String>,
        connection_id: u64,
        tx: mpsc::UnboundedSender<TransportNotice>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            connection_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Returns `false` once the owning manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportNotice {
                peer_id: self.peer_id.clone(),
                connection_id: self.connection_id,
                event,
            })
            .is_ok()
    }
}

/// Parameters of a new transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub peer_id: String,
    pub connection_id: u64,
    /// Managed relay to add on top of the configured ICE servers.
    pub relay: Option<ServerConfig>,
}

/// One encrypted media connection to one remote peer.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Swaps the track of an existing outbound slot of the same kind.
    /// `Ok(false)` means there is no such slot.
    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        request: TransportRequest,
        sink: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}
