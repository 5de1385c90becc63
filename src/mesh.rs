//! Full-mesh room coordination on top of the peer connection manager.
//!
//! Every participant announces itself with `peer-joined`; participants that
//! were already in the room initiate the connection to the newcomer. The
//! coordinator only keeps the roster; connections live in the manager.
//!
//! Every offer carries a fresh negotiation id in `callId`, echoed by the
//! answer and the candidates of that connection. When two participants offer
//! to each other at once and both answer the other's offer, neither answer
//! matches a pending offer; the participant with the lower id then offers
//! again so the pair settles on one offerer.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::call::CallType;
use crate::config::TieBreak;
use crate::events::{CallEvent, EventBus};
use crate::media::LocalMedia;
use crate::peer::manager::{PeerConnectionManager, Renegotiation};
use crate::peer::types::SessionDescription;
use crate::signaling::{ChannelClient, RoomPresence};
use crate::utils::random_id;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RosterEntry {
    has_stream: bool,
    nonce: Option<String>,
}

/// Borrowed agent state a mesh operation works on.
pub struct MeshContext<'a> {
    pub peers: &'a mut PeerConnectionManager,
    pub link: &'a ChannelClient,
    pub media: Option<&'a LocalMedia>,
    pub events: &'a EventBus,
    pub call_type: CallType,
}

impl MeshContext<'_> {
    fn has_stream(&self) -> bool {
        self.media.is_some_and(LocalMedia::has_stream)
    }
}

#[derive(Debug)]
pub struct MeshCoordinator {
    room_id: String,
    local_id: String,
    nonce: String,
    tie_break: TieBreak,
    roster: HashMap<String, RosterEntry>,
    /// Peers whose offer replaced one of ours; we re-offer if they answered
    /// ours as well.
    collided: HashSet<String>,
}

impl MeshCoordinator {
    pub fn new(room_id: impl Into<String>, local_id: impl Into<String>, tie_break: TieBreak) -> Self {
        Self {
            room_id: room_id.into(),
            local_id: local_id.into(),
            nonce: random_id(),
            tie_break,
            roster: HashMap::new(),
            collided: HashSet::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn roster(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.roster.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn knows(&self, peer_id: &str) -> bool {
        self.roster.contains_key(peer_id)
    }

    pub async fn announce(&self, ctx: &MeshContext<'_>) {
        let presence = RoomPresence::joined(&self.local_id, ctx.has_stream(), &self.nonce);
        if let Err(err) = ctx.link.send(presence).await {
            warn!(room = %self.room_id, %err, "failed to announce join");
        }
    }

    /// Asks everyone without a connection to us to offer again.
    pub async fn request_connections(&self, ctx: &MeshContext<'_>) {
        let presence = RoomPresence::request_connection(&self.local_id, ctx.has_stream());
        if let Err(err) = ctx.link.send(presence).await {
            warn!(room = %self.room_id, %err, "failed to request connections");
        }
    }

    async fn offer(&self, ctx: &mut MeshContext<'_>, peer_id: &str) {
        let negotiation = random_id();
        info!(room = %self.room_id, peer = peer_id, %negotiation, "initiating mesh connection");
        if let Err(err) = ctx
            .peers
            .open_offer(peer_id, Some(negotiation.as_str()), ctx.call_type, ctx.media, ctx.link)
            .await
        {
            warn!(room = %self.room_id, peer = peer_id, %err, "failed to offer");
        }
    }

    fn should_connect(&self, ctx: &MeshContext<'_>, peer_id: &str) -> bool {
        let remote_stream = self.roster.get(peer_id).is_some_and(|e| e.has_stream);
        (remote_stream || ctx.has_stream()) && !ctx.peers.has_live(peer_id)
    }

    pub async fn on_peer_joined(
        &mut self,
        ctx: &mut MeshContext<'_>,
        peer_id: &str,
        has_stream: bool,
        nonce: Option<String>,
    ) {
        let entry = RosterEntry {
            has_stream,
            nonce: nonce.clone(),
        };
        match self.roster.insert(peer_id.to_owned(), entry) {
            Some(previous) if nonce.is_some() && previous.nonce == nonce => {
                debug!(room = %self.room_id, peer = peer_id, "duplicate join announcement");
                return;
            }
            Some(_) => {
                if ctx.peers.teardown(peer_id).await {
                    info!(room = %self.room_id, peer = peer_id, "peer rejoined, dropping old connection");
                    ctx.events.emit(CallEvent::RemoteStreamRemoved {
                        peer_id: peer_id.to_owned(),
                    });
                }
            }
            None => {}
        }
        ctx.events.emit(CallEvent::PeerJoined {
            peer_id: peer_id.to_owned(),
            has_stream,
        });

        if self.should_connect(ctx, peer_id) {
            self.offer(ctx, peer_id).await;
        }
    }

    pub async fn on_request_connection(
        &mut self,
        ctx: &mut MeshContext<'_>,
        peer_id: &str,
        has_stream: bool,
    ) {
        let known = self.roster.contains_key(peer_id);
        self.roster
            .entry(peer_id.to_owned())
            .and_modify(|e| e.has_stream = has_stream)
            .or_insert(RosterEntry {
                has_stream,
                nonce: None,
            });
        if !known {
            ctx.events.emit(CallEvent::PeerJoined {
                peer_id: peer_id.to_owned(),
                has_stream,
            });
        }
        if self.should_connect(ctx, peer_id) {
            self.offer(ctx, peer_id).await;
        }
    }

    pub async fn on_offer(
        &mut self,
        ctx: &mut MeshContext<'_>,
        from: &str,
        call_id: Option<&str>,
        offer: SessionDescription,
        renegotiation: bool,
    ) {
        if renegotiation {
            match ctx
                .peers
                .renegotiate_offer(from, offer, ctx.call_type, ctx.media, ctx.link)
                .await
            {
                Ok(Renegotiation::NoConnection) => debug!(room = %self.room_id, peer = from, "renegotiation without a connection dropped"),
                Ok(outcome) => debug!(room = %self.room_id, peer = from, ?outcome, "renegotiation handled"),
                Err(err) => warn!(room = %self.room_id, peer = from, %err, "renegotiation failed"),
            }
            return;
        }

        if let Some(record) = ctx.peers.get(from) {
            if record.remote_sdp.as_deref() == Some(offer.sdp.as_str()) {
                debug!(room = %self.room_id, peer = from, "duplicate offer dropped");
                return;
            }
            if record.is_live() && record.awaiting_answer() {
                let lower = self.local_id.as_str() < from;
                if self.tie_break == TieBreak::LowerIdInitiates && lower {
                    debug!(room = %self.room_id, peer = from, "offer collision, keeping ours");
                    return;
                }
                debug!(room = %self.room_id, peer = from, "offer collision, answering theirs");
                if lower {
                    self.collided.insert(from.to_owned());
                }
            }
        }

        if !self.roster.contains_key(from) {
            self.roster.insert(
                from.to_owned(),
                RosterEntry {
                    has_stream: false,
                    nonce: None,
                },
            );
            ctx.events.emit(CallEvent::PeerJoined {
                peer_id: from.to_owned(),
                has_stream: false,
            });
        }

        if let Err(err) = ctx
            .peers
            .answer_offer(from, call_id, offer, ctx.media, ctx.link)
            .await
        {
            warn!(room = %self.room_id, peer = from, %err, "failed to answer offer");
        }
    }

    pub async fn on_answer(
        &mut self,
        ctx: &mut MeshContext<'_>,
        from: &str,
        call_id: Option<&str>,
        answer: SessionDescription,
    ) {
        match ctx.peers.apply_answer(from, call_id, answer).await {
            Ok(true) => {
                self.collided.remove(from);
                if let Err(err) = ctx
                    .peers
                    .flush_renegotiation(from, ctx.call_type, ctx.link)
                    .await
                {
                    warn!(room = %self.room_id, peer = from, %err, "queued renegotiation failed");
                }
            }
            Ok(false) if self.collided.remove(from) => {
                info!(room = %self.room_id, peer = from, "both offers were answered, offering again");
                self.offer(ctx, from).await;
            }
            Ok(false) => debug!(room = %self.room_id, peer = from, "unexpected mesh answer dropped"),
            Err(err) => {
                warn!(room = %self.room_id, peer = from, %err, "failed to apply mesh answer");
                self.on_transport_lost(ctx, from).await;
            }
        }
    }

    pub async fn on_peer_left(&mut self, ctx: &mut MeshContext<'_>, peer_id: &str) {
        self.collided.remove(peer_id);
        if self.roster.remove(peer_id).is_none() && !ctx.peers.contains(peer_id) {
            return;
        }
        if ctx.peers.teardown(peer_id).await {
            ctx.events.emit(CallEvent::RemoteStreamRemoved {
                peer_id: peer_id.to_owned(),
            });
        }
        info!(room = %self.room_id, peer = peer_id, "peer left");
        ctx.events.emit(CallEvent::PeerLeft {
            peer_id: peer_id.to_owned(),
        });
    }

    /// Drops the failed connection; the peer stays on the roster and is not
    /// redialed.
    pub async fn on_transport_lost(&mut self, ctx: &mut MeshContext<'_>, peer_id: &str) {
        self.collided.remove(peer_id);
        if ctx.peers.teardown(peer_id).await {
            warn!(room = %self.room_id, peer = peer_id, "mesh connection lost");
            ctx.events.emit(CallEvent::RemoteStreamRemoved {
                peer_id: peer_id.to_owned(),
            });
        }
    }

    /// Local media became available: connect to listen-only peers that had
    /// no reason to connect before.
    pub async fn on_local_stream(&mut self, ctx: &mut MeshContext<'_>) {
        for peer_id in self.roster() {
            if self.should_connect(ctx, &peer_id) {
                self.offer(ctx, &peer_id).await;
            }
        }
    }

    pub async fn leave(&mut self, ctx: &mut MeshContext<'_>) {
        if let Err(err) = ctx.link.send(RoomPresence::left(&self.local_id)).await {
            warn!(room = %self.room_id, %err, "failed to announce leave");
        }
        ctx.peers.teardown_all().await;
        self.roster.clear();
        self.collided.clear();
    }
}
