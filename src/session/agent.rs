use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::call::timer::CallTimers;
use crate::call::{CallSession, CallStatus, CallType, Direction, EndReason};
use crate::collab::{CallLogEntry, CallLogSink, Notifier, TokenService};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::events::{CallEvent, EventBus};
use crate::media::{LocalMedia, LocalTrack, MediaKind, MediaSource};
use crate::mesh::MeshCoordinator;
use crate::peer::manager::PeerConnectionManager;
use crate::peer::state::PeerState;
use crate::peer::transport::{TransportEvent, TransportNotice, TransportState};
use crate::peer::types::ServerConfig;
use crate::signaling::{ChannelClient, ChannelMessage, SignalingChannel, SignalingMessage};
use crate::utils::random_id;

use super::{CallSnapshot, PeerSnapshot, RoomSpec};

pub(super) enum Command {
    StartCall {
        peer_id: String,
        call_type: CallType,
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    JoinRoom {
        spec: RoomSpec,
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    LeaveRoom {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RefreshRoom {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetTrackEnabled {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
}

#[derive(Debug)]
pub(super) enum TimerKind {
    Ring,
    Reset,
    Tick,
    Grace(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MediaPurpose {
    Outgoing,
    Accept,
}

pub(super) struct RoomSetup {
    pub media: Option<LocalMedia>,
    pub relay: Option<ServerConfig>,
}

/// Everything the agent task reacts to. Results of suspended work carry the
/// generation of the call attempt that started it.
pub(super) enum AgentEvent {
    Command(Command),
    Inbound {
        scope: String,
        message: ChannelMessage,
    },
    Timer {
        generation: u64,
        kind: TimerKind,
    },
    MediaReady {
        generation: u64,
        purpose: MediaPurpose,
        result: Result<LocalMedia, CallError>,
    },
    TrackReady {
        generation: u64,
        result: Result<LocalTrack, CallError>,
    },
    RoomReady {
        generation: u64,
        result: Result<RoomSetup, CallError>,
    },
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Dispatch callback that forwards decoded messages of `scope` to the agent.
pub(super) fn inbound_dispatch(
    tx: mpsc::UnboundedSender<AgentEvent>,
    scope: String,
) -> impl Fn(ChannelMessage) + Send + Sync + 'static {
    move |message| {
        let _ = tx.send(AgentEvent::Inbound {
            scope: scope.clone(),
            message,
        });
    }
}

pub(super) struct AgentParts {
    pub local_id: String,
    pub config: CallConfig,
    pub channel: Arc<dyn SignalingChannel>,
    pub calls: ChannelClient,
    pub peers: PeerConnectionManager,
    pub events: EventBus,
    pub media_source: Arc<dyn MediaSource>,
    pub log_sink: Arc<dyn CallLogSink>,
    pub notifier: Arc<dyn Notifier>,
    pub token_service: Option<Arc<dyn TokenService>>,
    pub tx: mpsc::UnboundedSender<AgentEvent>,
}

pub(super) struct Agent {
    pub(super) local_id: String,
    pub(super) config: CallConfig,
    pub(super) channel: Arc<dyn SignalingChannel>,
    /// Membership in the shared direct-call scope; lives as long as the agent.
    pub(super) calls: ChannelClient,
    pub(super) room_link: Option<ChannelClient>,
    pub(super) peers: PeerConnectionManager,
    pub(super) session: Option<CallSession>,
    pub(super) mesh: Option<MeshCoordinator>,
    pub(super) media: Option<LocalMedia>,
    pub(super) timers: CallTimers,
    pub(super) generation: u64,
    pub(super) events: EventBus,
    pub(super) media_source: Arc<dyn MediaSource>,
    pub(super) log_sink: Arc<dyn CallLogSink>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) token_service: Option<Arc<dyn TokenService>>,
    pub(super) tx: mpsc::UnboundedSender<AgentEvent>,
}

impl Agent {
    pub(super) fn new(parts: AgentParts) -> Self {
        Self {
            local_id: parts.local_id,
            config: parts.config,
            channel: parts.channel,
            calls: parts.calls,
            room_link: None,
            peers: parts.peers,
            session: None,
            mesh: None,
            media: None,
            timers: CallTimers::new(),
            generation: 0,
            events: parts.events,
            media_source: parts.media_source,
            log_sink: parts.log_sink,
            notifier: parts.notifier,
            token_service: parts.token_service,
            tx: parts.tx,
        }
    }

    pub(super) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<AgentEvent>,
        mut notices: mpsc::UnboundedReceiver<TransportNotice>,
    ) {
        let reply = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(AgentEvent::Shutdown(reply)) => break reply,
                    Some(event) => self.handle(event).await,
                    None => break None,
                },
                Some(notice) = notices.recv() => self.on_transport(notice).await,
            }
        };
        self.close().await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn close(mut self) {
        if self.session.as_ref().is_some_and(|s| s.status().is_live()) {
            if let Err(err) = self.hang_up().await {
                debug!(%err, "hang up on shutdown failed");
            }
        }
        self.timers.cancel_all();
        self.peers.teardown_all().await;
        if let Some(media) = self.media.take() {
            self.media_source.release(media);
        }
        if let Some(link) = self.room_link.take() {
            link.unsubscribe().await;
        }
        self.calls.unsubscribe().await;
        info!(participant = %self.local_id, "call agent stopped");
    }

    async fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Command(command) => self.on_command(command).await,
            AgentEvent::Inbound { scope, message } => self.on_inbound(&scope, message).await,
            AgentEvent::Timer { generation, kind } => {
                if generation == self.generation {
                    self.on_timer(kind).await;
                } else {
                    trace!(?kind, generation, "stale timer ignored");
                }
            }
            AgentEvent::MediaReady {
                generation,
                purpose,
                result,
            } => {
                if generation == self.generation {
                    self.on_media_ready(purpose, result).await;
                } else if let Ok(media) = result {
                    debug!(generation, "releasing media of an abandoned call");
                    self.media_source.release(media);
                }
            }
            AgentEvent::TrackReady { generation, result } => {
                if generation == self.generation {
                    self.on_track_ready(result).await;
                } else if let Ok(track) = result {
                    track.set_enabled(false);
                }
            }
            AgentEvent::RoomReady { generation, result } => {
                if generation == self.generation {
                    self.on_room_ready(result).await;
                } else if let Ok(RoomSetup {
                    media: Some(media), ..
                }) = result
                {
                    self.media_source.release(media);
                }
            }
            AgentEvent::Shutdown(_) => {}
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                peer_id,
                call_type,
                reply,
            } => {
                let _ = reply.send(self.start_call(peer_id, call_type).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject().await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            Command::JoinRoom { spec, reply } => {
                let _ = reply.send(self.join_room(spec).await);
            }
            Command::LeaveRoom { reply } => {
                let _ = reply.send(self.leave_room().await);
            }
            Command::RefreshRoom { reply } => {
                let _ = reply.send(self.refresh_room().await);
            }
            Command::SetTrackEnabled {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_track_enabled(kind, enabled));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_inbound(&mut self, scope: &str, message: ChannelMessage) {
        if scope == self.config.call_scope {
            match message {
                ChannelMessage::Signal(msg) if msg.to == self.local_id => {
                    self.on_direct_signal(msg).await
                }
                ChannelMessage::Signal(_) => {}
                ChannelMessage::Presence(presence) => {
                    trace!(?presence, "presence on the call scope ignored");
                }
            }
        } else if self.room_link.as_ref().is_some_and(|l| l.scope() == scope) {
            self.on_room_message(message).await;
        } else {
            trace!(scope, "message for a left scope dropped");
        }
    }

    async fn on_transport(&mut self, notice: TransportNotice) {
        let TransportNotice {
            peer_id,
            connection_id,
            event,
        } = notice;
        if !self.peers.is_current(&peer_id, connection_id) {
            trace!(peer = %peer_id, connection = connection_id, "stale transport event dropped");
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let link = self.room_link.as_ref().unwrap_or(&self.calls);
                self.peers
                    .relay_local_candidate(&peer_id, connection_id, candidate, link)
                    .await;
            }
            TransportEvent::GatheringComplete => {
                self.peers.gathering_complete(&peer_id, connection_id);
            }
            TransportEvent::RemoteTrack(track) => {
                if let Some(stream) = self.peers.apply_remote_track(&peer_id, connection_id, track) {
                    self.events.emit(CallEvent::RemoteStream { peer_id, stream });
                }
            }
            TransportEvent::StateChanged(state) => {
                self.on_peer_state(&peer_id, connection_id, state).await;
            }
        }
    }

    async fn on_peer_state(&mut self, peer_id: &str, connection_id: u64, state: TransportState) {
        let Some(next) = self.peers.apply_state(peer_id, connection_id, state) else {
            return;
        };
        self.events.emit(CallEvent::PeerStateChanged {
            peer_id: peer_id.to_owned(),
            state: next,
        });

        match next {
            PeerState::Connected => {
                self.timers.cancel_grace(peer_id);
                if let Some(sas) = self.peers.safety_number(peer_id) {
                    self.events.emit(CallEvent::SafetyNumber {
                        peer_id: peer_id.to_owned(),
                        sas,
                    });
                }
                let direct_connecting = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.is_with(peer_id, None) && s.status() == CallStatus::Connecting);
                if direct_connecting {
                    self.set_status(CallStatus::Connected);
                }
            }
            PeerState::Disconnected => match self.config.disconnect_grace() {
                Some(grace) => {
                    let post = self.timer_post(TimerKind::Grace(peer_id.to_owned()));
                    if self.timers.arm_grace(peer_id, grace, post) {
                        debug!(peer = peer_id, ?grace, "transport disconnected, waiting for recovery");
                    }
                }
                None => self.on_connection_lost(peer_id).await,
            },
            PeerState::Failed | PeerState::Closed => {
                self.timers.cancel_grace(peer_id);
                self.on_connection_lost(peer_id).await;
            }
            PeerState::New | PeerState::HaveLocalOffer | PeerState::HaveRemoteOffer => {}
        }
    }

    async fn on_connection_lost(&mut self, peer_id: &str) {
        let Some(session) = self.session.as_ref() else {
            self.peers.teardown(peer_id).await;
            return;
        };

        if session.is_room() {
            if let Some((mesh, mut ctx)) = self.mesh_parts() {
                mesh.on_transport_lost(&mut ctx, peer_id).await;
            }
            return;
        }

        if session.is_with(peer_id, None) && session.status().is_live() {
            warn!(call = %session.call_id, peer = peer_id, "transport lost, ending call");
            let end = SignalingMessage::end(&self.local_id, peer_id, Some(&session.call_id));
            self.send_direct(end).await;
            self.finish(CallStatus::Ended, EndReason::TransportFailed).await;
        } else {
            self.peers.teardown(peer_id).await;
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Ring => self.on_ring_timeout().await,
            TimerKind::Reset => self.reset_to_idle(),
            TimerKind::Tick => {
                if let Some(session) = self
                    .session
                    .as_ref()
                    .filter(|s| s.status() == CallStatus::Connected)
                {
                    self.events.emit(CallEvent::Duration {
                        seconds: session.elapsed().as_secs(),
                    });
                }
            }
            TimerKind::Grace(peer_id) => {
                self.timers.cancel_grace(&peer_id);
                let still_down = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|r| r.state == PeerState::Disconnected);
                if still_down {
                    self.on_connection_lost(&peer_id).await;
                }
            }
        }
    }

    pub(super) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Callback for a one-shot timer of the current generation.
    pub(super) fn timer_post(&self, kind: TimerKind) -> impl FnOnce() + Send + 'static {
        let tx = self.tx.clone();
        let generation = self.generation;
        move || {
            let _ = tx.send(AgentEvent::Timer { generation, kind });
        }
    }

    pub(super) async fn send_direct(&self, message: SignalingMessage) {
        if let Err(err) = self.calls.send(message).await {
            warn!(%err, "failed to send call signal");
        }
    }

    /// Moves the session to `next`, reporting it. Invalid transitions are
    /// logged and ignored.
    pub(super) fn set_status(&mut self, next: CallStatus) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.transition(next) {
            Ok(prev) => {
                info!(call = %session.call_id, from = %prev, to = %next, "call status changed");
            }
            Err(err) => {
                debug!(call = %session.call_id, %err, "transition ignored");
                return false;
            }
        }

        if next == CallStatus::Connected {
            let tx = self.tx.clone();
            let generation = self.generation;
            self.timers.start_ticker(self.config.duration_tick(), move || {
                let _ = tx.send(AgentEvent::Timer {
                    generation,
                    kind: TimerKind::Tick,
                });
            });
        }
        self.announce_status();
        true
    }

    pub(super) fn announce_status(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let status = session.status();
        self.events.emit(CallEvent::StatusChanged {
            status,
            peer_id: session.peer_id().map(str::to_owned),
            room_id: session.room_id().map(str::to_owned),
        });
        self.notifier.notify(status.into());
    }

    /// Terminates the session: cancels its timers, tears down every
    /// connection, releases media and schedules the return to idle.
    pub(super) async fn finish(&mut self, status: CallStatus, reason: EndReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(err) = session.finish(status, reason) {
            debug!(call = %session.call_id, %err, "finish ignored");
            return;
        }

        let duration_secs = session.elapsed().as_secs();
        info!(call = %session.call_id, %status, ?reason, duration_secs, "call finished");
        let log_entry = match (session.direction, session.peer_id()) {
            (Direction::Outgoing, Some(peer_id)) => Some(CallLogEntry {
                caller_id: self.local_id.clone(),
                receiver_id: peer_id.to_owned(),
                call_type: session.call_type,
                status,
                duration_secs,
            }),
            _ => None,
        };

        self.timers.cancel_session();
        self.peers.teardown_all().await;
        self.peers.set_relay(None);
        if let Some(media) = self.media.take() {
            self.media_source.release(media);
        }
        if let Some(link) = self.room_link.take() {
            link.unsubscribe().await;
        }
        self.mesh = None;

        self.announce_status();
        if let Some(message) = reason.outcome() {
            self.events.emit(CallEvent::Outcome {
                message: message.to_owned(),
            });
        }

        if let Some(entry) = log_entry {
            let sink = Arc::clone(&self.log_sink);
            tokio::spawn(async move {
                if let Err(err) = sink.record(entry).await {
                    warn!(%err, "failed to record call log");
                }
            });
        }

        let post = self.timer_post(TimerKind::Reset);
        self.timers.arm_reset(self.config.reset_delay(), post);
    }

    pub(super) fn fail_acquisition(&self, err: &CallError) {
        warn!(%err, "acquisition failed");
        self.events.emit(CallEvent::Error {
            message: err.to_string(),
        });
    }

    fn reset_to_idle(&mut self) {
        if !self.session.as_ref().is_some_and(|s| s.status().is_terminal()) {
            return;
        }
        self.set_status(CallStatus::Idle);
        self.session = None;
        self.timers.cancel_all();
        debug!(participant = %self.local_id, "back to idle");
    }

    fn set_track_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<bool, CallError> {
        let Some(session) = self.session.as_ref().filter(|s| s.status().is_live()) else {
            return Err(CallError::NoActiveCall);
        };
        if let Some(changed) = self.media.as_ref().and_then(|m| m.set_enabled(kind, enabled)) {
            debug!(%kind, enabled, changed, "local track toggled");
            return Ok(changed);
        }
        if !enabled || matches!(session.status(), CallStatus::Ringing(_)) {
            return Ok(false);
        }

        let stream_id = self
            .media
            .as_ref()
            .map(|m| m.stream_id().to_owned())
            .unwrap_or_else(|| format!("stream-{}", random_id()));
        let source = Arc::clone(&self.media_source);
        let tx = self.tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = source.acquire_track(kind, &stream_id).await;
            let _ = tx.send(AgentEvent::TrackReady { generation, result });
        });
        Ok(true)
    }

    /// A track acquired mid-call: attach it to every connection.
    async fn on_track_ready(&mut self, result: Result<LocalTrack, CallError>) {
        let Some(session) = self.session.as_ref().filter(|s| s.status().is_live()) else {
            if let Ok(track) = result {
                track.set_enabled(false);
            }
            return;
        };
        let call_type = session.call_type;
        let is_room = session.is_room();

        let track = match result {
            Ok(track) => track,
            Err(err) => {
                self.fail_acquisition(&err);
                return;
            }
        };
        self.media
            .get_or_insert_with(|| LocalMedia::new(track.stream_id.clone()))
            .insert(track.clone());

        let link = self.room_link.as_ref().unwrap_or(&self.calls);
        if let Err(err) = self.peers.publish_track(&track, call_type, link).await {
            warn!(kind = %track.kind, %err, "failed to publish track");
        }
        if is_room {
            if let Some((mesh, mut ctx)) = self.mesh_parts() {
                mesh.on_local_stream(&mut ctx).await;
            }
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        let session = self.session.as_ref();
        let peers = self
            .peers
            .peer_ids()
            .into_iter()
            .filter_map(|peer_id| {
                let record = self.peers.get(&peer_id)?;
                Some(PeerSnapshot {
                    state: record.state,
                    has_remote_stream: record.remote_stream.is_some(),
                    safety_number: record.safety_number(),
                    peer_id,
                })
            })
            .collect();

        CallSnapshot {
            status: session.map_or(CallStatus::Idle, CallSession::status),
            call_id: session.map(|s| s.call_id.clone()),
            peer_id: session.and_then(CallSession::peer_id).map(str::to_owned),
            room_id: session.and_then(CallSession::room_id).map(str::to_owned),
            call_type: session.map(|s| s.call_type),
            direction: session.filter(|s| !s.is_room()).map(|s| s.direction),
            duration_secs: session.map_or(0, |s| s.elapsed().as_secs()),
            audio_enabled: self.media.as_ref().is_some_and(|m| m.is_enabled(MediaKind::Audio)),
            video_enabled: self.media.as_ref().is_some_and(|m| m.is_enabled(MediaKind::Video)),
            roster: self.mesh.as_ref().map(MeshCoordinator::roster).unwrap_or_default(),
            peers,
        }
    }
}
