//! Lifecycle of a single call attempt.

pub mod timer;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::CallError;
use crate::peer::types::SessionDescription;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "status", content = "direction", rename_all = "kebab-case")]
pub enum CallStatus {
    Idle,
    Ringing(Direction),
    Connecting,
    Connected,
    Ended,
    Rejected,
    NoAnswer,
}

impl CallStatus {
    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::NoAnswer)
    }

    /// Ringing, connecting or connected.
    pub fn is_live(self) -> bool {
        !self.is_idle() && !self.is_terminal()
    }

    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        use Direction::*;

        matches!(
            (self, next),
            (Idle, Ringing(_))
                | (Idle, Connecting)
                | (Ringing(Outgoing), NoAnswer | Connecting | Ended | Rejected)
                | (Ringing(Incoming), Connecting | Ended)
                | (Connecting, Connected | Ended)
                | (Connected, Ended)
                | (Ended | Rejected | NoAnswer, Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ringing(Direction::Outgoing) => "ringing-outgoing",
            Self::Ringing(Direction::Incoming) => "ringing-incoming",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::NoAnswer => "no-answer",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session reached a terminal status.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    Cancelled,
    Missed,
    NoAnswer,
    TransportFailed,
    Failed,
    LeftRoom,
}

impl EndReason {
    /// User-visible outcome, for the reasons that have one.
    pub fn outcome(self) -> Option<&'static str> {
        match self {
            Self::Failed | Self::TransportFailed => Some("call failed"),
            Self::NoAnswer => Some("no answer"),
            Self::Declined => Some("call declined"),
            _ => None,
        }
    }
}

/// Who or what the session talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    Direct { peer_id: String },
    Room { room_id: String },
}

/// One call attempt. Lives from initiation (or the first inbound offer) until
/// the agent resets to idle.
#[derive(Debug)]
pub struct CallSession {
    pub call_id: String,
    pub generation: u64,
    pub target: SessionTarget,
    pub call_type: CallType,
    pub direction: Direction,
    status: CallStatus,
    started_at: Option<DateTime<Utc>>,
    connected_at: Option<Instant>,
    ended_at: Option<Instant>,
    pub end_reason: Option<EndReason>,
    pub(crate) pending_offer: Option<SessionDescription>,
}

impl CallSession {
    fn new(
        call_id: String,
        generation: u64,
        target: SessionTarget,
        call_type: CallType,
        direction: Direction,
        status: CallStatus,
    ) -> Self {
        Self {
            call_id,
            generation,
            target,
            call_type,
            direction,
            status,
            started_at: None,
            connected_at: None,
            ended_at: None,
            end_reason: None,
            pending_offer: None,
        }
    }

    pub fn outgoing(call_id: String, generation: u64, peer_id: String, call_type: CallType) -> Self {
        Self::new(
            call_id,
            generation,
            SessionTarget::Direct { peer_id },
            call_type,
            Direction::Outgoing,
            CallStatus::Ringing(Direction::Outgoing),
        )
    }

    pub fn incoming(
        call_id: String,
        generation: u64,
        peer_id: String,
        call_type: CallType,
        offer: SessionDescription,
    ) -> Self {
        let mut session = Self::new(
            call_id,
            generation,
            SessionTarget::Direct { peer_id },
            call_type,
            Direction::Incoming,
            CallStatus::Ringing(Direction::Incoming),
        );
        session.pending_offer = Some(offer);
        session
    }

    /// A mesh session starts in `connecting` until the room is joined.
    pub fn room(call_id: String, generation: u64, room_id: String, call_type: CallType) -> Self {
        Self::new(
            call_id,
            generation,
            SessionTarget::Room { room_id },
            call_type,
            Direction::Outgoing,
            CallStatus::Connecting,
        )
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn peer_id(&self) -> Option<&str> {
        match &self.target {
            SessionTarget::Direct { peer_id } => Some(peer_id),
            SessionTarget::Room { .. } => None,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.target {
            SessionTarget::Room { room_id } => Some(room_id),
            SessionTarget::Direct { .. } => None,
        }
    }

    pub fn is_room(&self) -> bool {
        matches!(self.target, SessionTarget::Room { .. })
    }

    /// True when `peer_id` is the direct counterpart and `call_id`, if the
    /// message carried one, names this attempt.
    pub fn is_with(&self, peer_id: &str, call_id: Option<&str>) -> bool {
        self.peer_id() == Some(peer_id) && call_id.map_or(true, |id| id == self.call_id)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Time spent connected; frozen once the call leaves `connected`.
    pub fn elapsed(&self) -> Duration {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Applies a validated transition and returns the previous status.
    pub fn transition(&mut self, next: CallStatus) -> Result<CallStatus, CallError> {
        let prev = self.status;
        if !prev.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: prev,
                to: next,
            });
        }

        if next == CallStatus::Connected {
            self.started_at = Some(Utc::now());
            self.connected_at = Some(Instant::now());
        }
        if prev == CallStatus::Connected {
            self.ended_at = Some(Instant::now());
        }
        self.status = next;
        Ok(prev)
    }

    pub fn finish(&mut self, status: CallStatus, reason: EndReason) -> Result<CallStatus, CallError> {
        let prev = self.transition(status)?;
        self.end_reason = Some(reason);
        Ok(prev)
    }
}
