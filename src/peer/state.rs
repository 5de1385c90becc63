use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::peer::fingerprint;
use crate::peer::ice::CandidateStats;
use crate::peer::transport::{MediaTransport, TransportState};
use crate::peer::types::{IceCandidate, RemoteStream, RemoteTrack};

/// Negotiation/connection state of one peer connection.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PeerState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }

    /// State after the transport reports `state`; `None` when the report does
    /// not move the record.
    pub fn after(self, state: TransportState) -> Option<PeerState> {
        let next = match state {
            TransportState::New | TransportState::Connecting => return None,
            TransportState::Connected => Self::Connected,
            TransportState::Disconnected => Self::Disconnected,
            TransportState::Failed => Self::Failed,
            TransportState::Closed => Self::Closed,
        };
        (next != self).then_some(next)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Everything the manager keeps about one remote peer.
pub struct PeerConnectionRecord {
    pub peer_id: String,
    pub connection_id: u64,
    pub call_id: Option<String>,
    pub state: PeerState,
    pub remote_stream: Option<RemoteStream>,
    pub created_at: DateTime<Utc>,
    pub(crate) transport: Arc<dyn MediaTransport>,
    pub(crate) awaiting_answer: bool,
    /// A track was added while an offer was outstanding.
    pub(crate) renegotiation_queued: bool,
    /// Both sides renegotiated at once and the peer rebuilds the connection.
    pub(crate) restart_expected: bool,
    pub(crate) remote_description_set: bool,
    pub(crate) applied_candidates: HashSet<IceCandidate>,
    pub(crate) local_candidates: CandidateStats,
    pub(crate) local_sdp: Option<String>,
    pub(crate) remote_sdp: Option<String>,
}

impl PeerConnectionRecord {
    pub(crate) fn new(
        peer_id: &str,
        connection_id: u64,
        call_id: Option<String>,
        transport: Arc<dyn MediaTransport>,
    ) -> Self {
        Self {
            peer_id: peer_id.to_owned(),
            connection_id,
            call_id,
            state: PeerState::New,
            remote_stream: None,
            created_at: Utc::now(),
            transport,
            awaiting_answer: false,
            renegotiation_queued: false,
            restart_expected: false,
            remote_description_set: false,
            applied_candidates: HashSet::new(),
            local_candidates: CandidateStats::default(),
            local_sdp: None,
            remote_sdp: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    pub fn renegotiation_queued(&self) -> bool {
        self.renegotiation_queued
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn applied_candidate_count(&self) -> usize {
        self.applied_candidates.len()
    }

    /// Adds `track` to the remote stream. Returns `false` for a track that is
    /// already known.
    pub(crate) fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        let stream = self.remote_stream.get_or_insert_with(|| RemoteStream {
            stream_id: track.stream_id.clone(),
            tracks: Vec::new(),
        });
        if stream.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        stream.tracks.push(track);
        true
    }

    /// Short authentication string over both DTLS fingerprints.
    pub fn safety_number(&self) -> Option<String> {
        fingerprint::safety_number(self.local_sdp.as_deref()?, self.remote_sdp.as_deref()?)
    }
}

impl fmt::Debug for PeerConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionRecord")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .field("call_id", &self.call_id)
            .field("state", &self.state)
            .field("awaiting_answer", &self.awaiting_answer)
            .field("renegotiation_queued", &self.renegotiation_queued)
            .field("remote_description_set", &self.remote_description_set)
            .finish()
    }
}
