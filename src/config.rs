//! Runtime configuration of a call agent.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::peer::types::{IceServerKind, ServerConfig};

/// Public STUN servers used when nothing else is configured.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
});

/// How a mesh participant resolves two peers offering to each other at once.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// The offer that arrives last replaces the existing connection.
    #[default]
    LastOfferWins,
    /// The participant with the lower id keeps its own offer and ignores the
    /// colliding one.
    LowerIdInitiates,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CallConfig {
    /// How long an outgoing call rings before it becomes `no-answer`.
    pub ring_timeout_ms: u64,
    /// Display window between a terminal status and the return to idle.
    pub reset_delay_ms: u64,
    pub duration_tick_ms: u64,
    /// Grace period for a `disconnected` transport to come back; zero tears
    /// the connection down immediately.
    pub disconnect_grace_ms: u64,
    /// Scope every participant subscribes to for direct calls.
    pub call_scope: String,
    /// Per-peer capacity of the pending remote candidate queue.
    pub max_pending_candidates: usize,
    pub ice_servers: Vec<ServerConfig>,
    pub tie_break: TieBreak,
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ms: 30_000,
            reset_delay_ms: 2_000,
            duration_tick_ms: 1_000,
            disconnect_grace_ms: 0,
            call_scope: "calls".into(),
            max_pending_candidates: 64,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            tie_break: TieBreak::default(),
            event_capacity: 256,
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_timeout_ms == 0 {
            return Err(ConfigError::Zero("ring_timeout_ms"));
        }
        if self.duration_tick_ms == 0 {
            return Err(ConfigError::Zero("duration_tick_ms"));
        }
        if self.max_pending_candidates == 0 {
            return Err(ConfigError::Zero("max_pending_candidates"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero("event_capacity"));
        }
        validate_ice_servers(&self.ice_servers)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms)
    }

    pub fn disconnect_grace(&self) -> Option<Duration> {
        (self.disconnect_grace_ms > 0).then(|| Duration::from_millis(self.disconnect_grace_ms))
    }
}

pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl(server.id.clone()));
        }
        if server.kind == IceServerKind::Turn
            && (server.username.is_none() || server.credential.is_none())
        {
            return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
        }
    }
    Ok(())
}
