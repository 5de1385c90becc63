//! The call agent: one event-driven task per local participant that owns the
//! active [`CallSession`](crate::call::CallSession), and the cloneable
//! [`CallHandle`] used to drive it.
//!
//! Commands, inbound signaling, transport callbacks and timer fires are all
//! funneled into the agent task and handled one at a time, so no state is
//! shared between tasks.

mod agent;
mod direct;
mod room;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use crate::call::{CallStatus, CallType, Direction};
use crate::collab::{CallLogSink, NullCollaborator, Notifier, TokenService};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::events::{CallEvent, EventBus};
use crate::media::{MediaKind, MediaSource, SyntheticMediaSource};
use crate::peer::connection::RtcTransportFactory;
use crate::peer::manager::PeerConnectionManager;
use crate::peer::state::PeerState;
use crate::peer::transport::TransportFactory;
use crate::signaling::{ChannelClient, SignalingChannel};

use agent::{Agent, AgentEvent, Command};

/// Room to join and how to take part in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    pub room_id: String,
    pub call_type: CallType,
    /// `false` joins listen-only, without acquiring local media.
    pub publish: bool,
    pub context_type: String,
    pub context_id: String,
    pub role: String,
}

impl RoomSpec {
    pub fn new(room_id: impl Into<String>, call_type: CallType) -> Self {
        Self {
            room_id: room_id.into(),
            call_type,
            publish: true,
            context_type: "room".into(),
            context_id: String::new(),
            role: "participant".into(),
        }
    }

    pub fn listen_only(mut self) -> Self {
        self.publish = false;
        self
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub state: PeerState,
    pub has_remote_stream: bool,
    pub safety_number: Option<String>,
}

/// Point-in-time view of the agent.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub call_id: Option<String>,
    pub peer_id: Option<String>,
    pub room_id: Option<String>,
    pub call_type: Option<CallType>,
    pub direction: Option<Direction>,
    pub duration_secs: u64,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub roster: Vec<String>,
    pub peers: Vec<PeerSnapshot>,
}

impl CallSnapshot {
    pub fn peer(&self, peer_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }
}

/// Configures and starts a call agent.
pub struct CallAgentBuilder {
    local_id: String,
    channel: Arc<dyn SignalingChannel>,
    config: CallConfig,
    media_source: Arc<dyn MediaSource>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    log_sink: Arc<dyn CallLogSink>,
    notifier: Arc<dyn Notifier>,
    token_service: Option<Arc<dyn TokenService>>,
}

impl CallAgentBuilder {
    pub fn new(local_id: impl Into<String>, channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            local_id: local_id.into(),
            channel,
            config: CallConfig::default(),
            media_source: Arc::new(SyntheticMediaSource),
            transport_factory: None,
            log_sink: Arc::new(NullCollaborator),
            notifier: Arc::new(NullCollaborator),
            token_service: None,
        }
    }

    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = source;
        self
    }

    /// Defaults to the `webrtc` transport over the configured ICE servers.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn CallLogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn token_service(mut self, service: Arc<dyn TokenService>) -> Self {
        self.token_service = Some(service);
        self
    }

    /// Subscribes to the call scope and starts the agent task.
    pub async fn spawn(self) -> Result<CallHandle, CallError> {
        self.config.validate()?;

        let factory = self.transport_factory.unwrap_or_else(|| {
            Arc::new(RtcTransportFactory::new(self.config.ice_servers.clone()))
        });
        let (peers, notices) = PeerConnectionManager::new(
            self.local_id.clone(),
            factory,
            self.config.max_pending_candidates,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let scope = self.config.call_scope.clone();
        let calls = ChannelClient::subscribe(
            Arc::clone(&self.channel),
            &scope,
            &self.local_id,
            agent::inbound_dispatch(tx.clone(), scope.clone()),
        )
        .await?;

        let events = EventBus::new(self.config.event_capacity);
        let agent = Agent::new(agent::AgentParts {
            local_id: self.local_id.clone(),
            config: self.config,
            channel: self.channel,
            calls,
            peers,
            events: events.clone(),
            media_source: self.media_source,
            log_sink: self.log_sink,
            notifier: self.notifier,
            token_service: self.token_service,
            tx: tx.clone(),
        });
        tokio::spawn(agent.run(rx, notices));
        info!(participant = %self.local_id, scope = %scope, "call agent started");

        Ok(CallHandle {
            inner: Arc::new(HandleInner {
                local_id: self.local_id,
                tx,
            }),
            events,
        })
    }
}

struct HandleInner {
    local_id: String,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let _ = self.tx.send(AgentEvent::Shutdown(None));
    }
}

/// Cloneable control surface of a running agent. The agent stops when the
/// last clone is dropped or [`CallHandle::shutdown`] is called.
#[derive(Clone)]
pub struct CallHandle {
    inner: Arc<HandleInner>,
    events: EventBus,
}

impl CallHandle {
    pub fn builder(local_id: impl Into<String>, channel: Arc<dyn SignalingChannel>) -> CallAgentBuilder {
        CallAgentBuilder::new(local_id, channel)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(AgentEvent::Command(make(reply)))
            .map_err(|_| CallError::AgentStopped)?;
        rx.await.map_err(|_| CallError::AgentStopped)
    }

    /// Starts an outgoing direct call and returns its call id.
    pub async fn start_call(
        &self,
        peer_id: impl Into<String>,
        call_type: CallType,
    ) -> Result<String, CallError> {
        let peer_id = peer_id.into();
        self.request(|reply| Command::StartCall {
            peer_id,
            call_type,
            reply,
        })
        .await?
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// Cancels, declines or ends the active call, or leaves the active room.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await?
    }

    pub async fn join_room(&self, spec: RoomSpec) -> Result<String, CallError> {
        self.request(|reply| Command::JoinRoom { spec, reply }).await?
    }

    pub async fn leave_room(&self) -> Result<(), CallError> {
        self.request(|reply| Command::LeaveRoom { reply }).await?
    }

    pub async fn refresh_room(&self) -> Result<(), CallError> {
        self.request(|reply| Command::RefreshRoom { reply }).await?
    }

    /// Returns whether the flag changed.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.request(|reply| Command::SetTrackEnabled {
            kind: MediaKind::Audio,
            enabled,
            reply,
        })
        .await?
    }

    /// Enabling video on a call without a camera track acquires one and
    /// attaches it to every connection.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.request(|reply| Command::SetTrackEnabled {
            kind: MediaKind::Video,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn status(&self) -> Result<CallStatus, CallError> {
        Ok(self.snapshot().await?.status)
    }

    /// Ends whatever is active and stops the agent.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(AgentEvent::Shutdown(Some(reply)))
            .map_err(|_| CallError::AgentStopped)?;
        rx.await.map_err(|_| CallError::AgentStopped)
    }
}
