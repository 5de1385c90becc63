//! Mesh room handling.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::call::{CallSession, CallStatus, EndReason};
use crate::collab::{TokenRequest, TokenService};
use crate::error::CallError;
use crate::media::MediaSource;
use crate::mesh::{MeshContext, MeshCoordinator};
use crate::signaling::{ChannelClient, ChannelMessage, PresenceEvent, SignalKind};
use crate::utils::{random_id, room_scope};

use super::agent::{inbound_dispatch, Agent, AgentEvent, RoomSetup};
use super::RoomSpec;

/// Relay token first, then local media; either failure aborts the join.
async fn prepare_room(
    spec: &RoomSpec,
    participant: &str,
    tokens: Option<Arc<dyn TokenService>>,
    source: Arc<dyn MediaSource>,
) -> Result<RoomSetup, CallError> {
    let relay = match tokens {
        Some(service) => {
            let request = TokenRequest {
                room_name: spec.room_id.clone(),
                context_type: spec.context_type.clone(),
                context_id: spec.context_id.clone(),
                role: spec.role.clone(),
            };
            let token = service
                .issue_token(request)
                .await
                .map_err(|e| CallError::TokenDenied(format!("{e:#}")))?;
            Some(token.into_server(participant))
        }
        None => None,
    };

    let media = if spec.publish {
        Some(source.acquire(spec.call_type).await?)
    } else {
        None
    };
    Ok(RoomSetup { media, relay })
}

impl Agent {
    /// The coordinator plus the agent state it operates on, while joined.
    pub(super) fn mesh_parts(&mut self) -> Option<(&mut MeshCoordinator, MeshContext<'_>)> {
        let call_type = self.session.as_ref()?.call_type;
        let mesh = self.mesh.as_mut()?;
        let link = self.room_link.as_ref()?;
        Some((
            mesh,
            MeshContext {
                peers: &mut self.peers,
                link,
                media: self.media.as_ref(),
                events: &self.events,
                call_type,
            },
        ))
    }

    fn joined_room(&self) -> Option<&CallSession> {
        self.session
            .as_ref()
            .filter(|s| s.is_room() && s.status() == CallStatus::Connected)
    }

    pub(super) async fn join_room(&mut self, spec: RoomSpec) -> Result<String, CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }

        self.timers.cancel_all();
        self.peers.retain_pending(None);
        let call_id = random_id();
        let generation = self.next_generation();
        info!(room = %spec.room_id, publish = spec.publish, "joining room");
        self.session = Some(CallSession::room(
            call_id.clone(),
            generation,
            spec.room_id.clone(),
            spec.call_type,
        ));
        self.announce_status();

        let tokens = self.token_service.clone();
        let source = Arc::clone(&self.media_source);
        let participant = self.local_id.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = prepare_room(&spec, &participant, tokens, source).await;
            let _ = tx.send(AgentEvent::RoomReady { generation, result });
        });
        Ok(call_id)
    }

    pub(super) async fn on_room_ready(&mut self, result: Result<RoomSetup, CallError>) {
        let Some(room_id) = self
            .session
            .as_ref()
            .filter(|s| s.status() == CallStatus::Connecting)
            .and_then(CallSession::room_id)
            .map(str::to_owned)
        else {
            if let Ok(RoomSetup {
                media: Some(media), ..
            }) = result
            {
                self.media_source.release(media);
            }
            return;
        };

        let setup = match result {
            Ok(setup) => setup,
            Err(err) => {
                self.fail_acquisition(&err);
                self.finish(CallStatus::Ended, EndReason::Failed).await;
                return;
            }
        };
        self.peers.set_relay(setup.relay);
        self.media = setup.media;

        let scope = room_scope(&room_id);
        let link = ChannelClient::subscribe(
            Arc::clone(&self.channel),
            &scope,
            &self.local_id,
            inbound_dispatch(self.tx.clone(), scope.clone()),
        )
        .await;
        match link {
            Ok(link) => self.room_link = Some(link),
            Err(err) => {
                warn!(room = %room_id, %err, "failed to subscribe to room");
                self.finish(CallStatus::Ended, EndReason::Failed).await;
                return;
            }
        }

        self.mesh = Some(MeshCoordinator::new(
            room_id.clone(),
            self.local_id.clone(),
            self.config.tie_break,
        ));
        if let Some((mesh, ctx)) = self.mesh_parts() {
            mesh.announce(&ctx).await;
        }
        info!(room = %room_id, "room joined");
        self.set_status(CallStatus::Connected);
    }

    pub(super) async fn on_room_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Presence(presence) => {
                if presence.peer_id == self.local_id {
                    return;
                }
                if presence.event == PresenceEvent::PeerLeft {
                    self.timers.cancel_grace(&presence.peer_id);
                }
                let Some((mesh, mut ctx)) = self.mesh_parts() else {
                    return;
                };
                let has_stream = presence.has_stream.unwrap_or(false);
                match presence.event {
                    PresenceEvent::PeerJoined => {
                        mesh.on_peer_joined(&mut ctx, &presence.peer_id, has_stream, presence.nonce)
                            .await
                    }
                    PresenceEvent::PeerLeft => mesh.on_peer_left(&mut ctx, &presence.peer_id).await,
                    PresenceEvent::RequestConnection => {
                        mesh.on_request_connection(&mut ctx, &presence.peer_id, has_stream)
                            .await
                    }
                }
            }
            ChannelMessage::Signal(msg) => {
                if msg.to != self.local_id || self.mesh.is_none() {
                    return;
                }
                match msg.kind {
                    SignalKind::Offer => {
                        let Some(offer) = msg.sdp else {
                            return;
                        };
                        if let Some((mesh, mut ctx)) = self.mesh_parts() {
                            mesh.on_offer(
                                &mut ctx,
                                &msg.from,
                                msg.call_id.as_deref(),
                                offer,
                                msg.renegotiation,
                            )
                            .await;
                        }
                    }
                    SignalKind::Answer => {
                        let Some(answer) = msg.sdp else {
                            return;
                        };
                        if let Some((mesh, mut ctx)) = self.mesh_parts() {
                            mesh.on_answer(&mut ctx, &msg.from, msg.call_id.as_deref(), answer)
                                .await;
                        }
                    }
                    SignalKind::IceCandidate => {
                        if let Some(candidate) = msg.candidate {
                            self.peers
                                .add_remote_candidate(&msg.from, msg.call_id.as_deref(), candidate)
                                .await;
                        }
                    }
                    SignalKind::End => {
                        if let Some((mesh, mut ctx)) = self.mesh_parts() {
                            mesh.on_peer_left(&mut ctx, &msg.from).await;
                        }
                    }
                    SignalKind::Reject => {
                        debug!(from = %msg.from, "reject inside a room ignored");
                    }
                }
            }
        }
    }

    pub(super) async fn leave_room(&mut self) -> Result<(), CallError> {
        let in_room = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_room() && s.status().is_live());
        if !in_room {
            return Err(CallError::NoActiveCall);
        }

        if let Some((mesh, mut ctx)) = self.mesh_parts() {
            info!(room = %mesh.room_id(), "leaving room");
            mesh.leave(&mut ctx).await;
        }
        self.finish(CallStatus::Ended, EndReason::LeftRoom).await;
        Ok(())
    }

    pub(super) async fn refresh_room(&mut self) -> Result<(), CallError> {
        if self.joined_room().is_none() {
            return Err(CallError::NoActiveCall);
        }
        if let Some((mesh, mut ctx)) = self.mesh_parts() {
            mesh.request_connections(&ctx).await;
            mesh.on_local_stream(&mut ctx).await;
        }
        Ok(())
    }
}
