use thiserror::Error;

use crate::call::CallStatus;

/// Errors returned to callers of the local call API.
///
/// Protocol-level anomalies (stale answers, late candidates, messages for
/// abandoned peers) never show up here; they are absorbed by the agent and
/// logged.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,

    #[error("no active call")]
    NoActiveCall,

    #[error("cannot call yourself")]
    SelfCall,

    #[error("invalid call transition from {from} to {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("relay token denied: {0}")]
    TokenDenied(String),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("call agent is not running")]
    AgentStopped,
}

impl CallError {
    /// Acquisition failures are the only errors surfaced to the user as-is.
    pub fn is_acquisition(&self) -> bool {
        matches!(self, Self::MediaAcquisition(_) | Self::TokenDenied(_))
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("not subscribed to scope {0}")]
    NotSubscribed(String),

    #[error("signaling channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create transport: {0}")]
    Create(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("ice candidate rejected: {0}")]
    Candidate(String),

    #[error("track operation failed: {0}")]
    Track(String),

    #[error("transport closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        Self::Negotiation(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("ICE server {0} has an empty url")]
    EmptyUrl(String),

    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
