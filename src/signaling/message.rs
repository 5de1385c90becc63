use serde::{Deserialize, Serialize};

use crate::call::CallType;
use crate::peer::types::{IceCandidate, SessionDescription};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Reject,
    End,
    IceCandidate,
}

/// Control message exchanged between two participants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    pub to: String,
    /// Identifies the call attempt the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    /// Offer on an already established connection (track added mid-call).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub renegotiation: bool,
}

impl SignalingMessage {
    fn bare(kind: SignalKind, from: &str, to: &str, call_id: Option<&str>) -> Self {
        Self {
            kind,
            from: from.to_owned(),
            to: to.to_owned(),
            call_id: call_id.map(str::to_owned),
            call_type: None,
            sdp: None,
            candidate: None,
            renegotiation: false,
        }
    }

    pub fn offer(
        from: &str,
        to: &str,
        call_id: Option<&str>,
        call_type: CallType,
        sdp: SessionDescription,
    ) -> Self {
        Self {
            call_type: Some(call_type),
            sdp: Some(sdp),
            ..Self::bare(SignalKind::Offer, from, to, call_id)
        }
    }

    pub fn answer(from: &str, to: &str, call_id: Option<&str>, sdp: SessionDescription) -> Self {
        Self {
            sdp: Some(sdp),
            ..Self::bare(SignalKind::Answer, from, to, call_id)
        }
    }

    pub fn reject(from: &str, to: &str, call_id: Option<&str>) -> Self {
        Self::bare(SignalKind::Reject, from, to, call_id)
    }

    pub fn end(from: &str, to: &str, call_id: Option<&str>) -> Self {
        Self::bare(SignalKind::End, from, to, call_id)
    }

    pub fn ice_candidate(
        from: &str,
        to: &str,
        call_id: Option<&str>,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::bare(SignalKind::IceCandidate, from, to, call_id)
        }
    }

    pub fn renegotiating(mut self) -> Self {
        self.renegotiation = true;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceEvent {
    PeerJoined,
    PeerLeft,
    RequestConnection,
}

/// Room presence announcement.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomPresence {
    pub event: PresenceEvent,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_stream: Option<bool>,
    /// Random per-join token; repeats of the same announcement share it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RoomPresence {
    pub fn joined(peer_id: &str, has_stream: bool, nonce: &str) -> Self {
        Self {
            event: PresenceEvent::PeerJoined,
            peer_id: peer_id.to_owned(),
            has_stream: Some(has_stream),
            nonce: Some(nonce.to_owned()),
        }
    }

    pub fn left(peer_id: &str) -> Self {
        Self {
            event: PresenceEvent::PeerLeft,
            peer_id: peer_id.to_owned(),
            has_stream: None,
            nonce: None,
        }
    }

    pub fn request_connection(peer_id: &str, has_stream: bool) -> Self {
        Self {
            event: PresenceEvent::RequestConnection,
            peer_id: peer_id.to_owned(),
            has_stream: Some(has_stream),
            nonce: None,
        }
    }
}

/// Everything that travels over a signaling scope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ChannelMessage {
    Signal(SignalingMessage),
    Presence(RoomPresence),
}

impl From<SignalingMessage> for ChannelMessage {
    fn from(msg: SignalingMessage) -> Self {
        Self::Signal(msg)
    }
}

impl From<RoomPresence> for ChannelMessage {
    fn from(msg: RoomPresence) -> Self {
        Self::Presence(msg)
    }
}
