pub mod connection;
pub mod fingerprint;
pub mod ice;
pub mod manager;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RtcTransport, RtcTransportFactory};
pub use ice::{CandidateStats, PendingCandidates};
pub use manager::{PeerConnectionManager, Renegotiation};
pub use state::{PeerConnectionRecord, PeerState};
pub use transport::{
    MediaTransport, TransportEvent, TransportEventSink, TransportFactory, TransportNotice,
    TransportRequest, TransportState,
};
pub use types::{IceCandidate, RemoteStream, RemoteTrack, SdpKind, ServerConfig, SessionDescription};
