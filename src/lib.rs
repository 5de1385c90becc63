//! Peer-to-peer call signaling and connection lifecycle.
//!
//! A [`CallHandle`] drives one local participant: 1:1 calls over a shared
//! call scope and full-mesh rooms over per-room scopes. Signaling goes
//! through any [`SignalingChannel`]; media connections through any
//! [`TransportFactory`], with the `webrtc` crate as the default backend.

pub mod call;
pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use call::{CallSession, CallStatus, CallType, Direction, EndReason};
pub use collab::{
    CallLogEntry, CallLogSink, NullCollaborator, Notifier, RelayToken, StatusCue, TokenRequest,
    TokenService,
};
pub use config::{CallConfig, TieBreak};
pub use error::{CallError, ConfigError, SignalingError, TransportError};
pub use events::CallEvent;
pub use media::{LocalMedia, LocalTrack, MediaKind, MediaSource, SyntheticMediaSource};
pub use peer::{
    IceCandidate, MediaTransport, PeerConnectionManager, PeerState, RtcTransportFactory,
    ServerConfig, SessionDescription, TransportFactory,
};
pub use session::{CallAgentBuilder, CallHandle, CallSnapshot, PeerSnapshot, RoomSpec};
pub use signaling::{ChannelClient, LocalHub, SignalingChannel};
