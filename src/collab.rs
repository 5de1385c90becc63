//! External collaborators of the call agent: call-log storage, status
//! notifications and relay token issuance. Only the interfaces live here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::call::{CallStatus, CallType};
use crate::peer::types::ServerConfig;

/// One finished outgoing direct call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallLogEntry {
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub duration_secs: u64,
}

#[async_trait]
pub trait CallLogSink: Send + Sync {
    async fn record(&self, entry: CallLogEntry) -> anyhow::Result<()>;
}

/// Status transition cue for sound/notification triggers.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCue {
    RingingOutgoing,
    RingingIncoming,
    Connecting,
    Connected,
    Ended,
    Rejected,
    NoAnswer,
    Idle,
}

impl From<CallStatus> for StatusCue {
    fn from(status: CallStatus) -> Self {
        use crate::call::Direction;

        match status {
            CallStatus::Idle => Self::Idle,
            CallStatus::Ringing(Direction::Outgoing) => Self::RingingOutgoing,
            CallStatus::Ringing(Direction::Incoming) => Self::RingingIncoming,
            CallStatus::Connecting => Self::Connecting,
            CallStatus::Connected => Self::Connected,
            CallStatus::Ended => Self::Ended,
            CallStatus::Rejected => Self::Rejected,
            CallStatus::NoAnswer => Self::NoAnswer,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, cue: StatusCue);
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub room_name: String,
    pub context_type: String,
    pub context_id: String,
    pub role: String,
}

/// Credential for the managed relay of a room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayToken {
    pub token: String,
    pub url: String,
}

impl RelayToken {
    /// TURN server entry authenticating `participant` with this token.
    pub fn into_server(self, participant: &str) -> ServerConfig {
        ServerConfig::turn("managed-relay", self.url, participant, self.token)
    }
}

#[async_trait]
pub trait TokenService: Send + Sync {
    async fn issue_token(&self, request: TokenRequest) -> anyhow::Result<RelayToken>;
}

/// Collaborator that accepts everything and issues no relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollaborator;

#[async_trait]
impl CallLogSink for NullCollaborator {
    async fn record(&self, _entry: CallLogEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Notifier for NullCollaborator {
    fn notify(&self, _cue: StatusCue) {}
}
