//! Per-peer connection bookkeeping and the offer/answer/ICE exchange.
//!
//! The manager owns one [`PeerConnectionRecord`] per remote peer. Transport
//! callbacks arrive on the notice channel returned by
//! [`PeerConnectionManager::new`]; every notice carries the connection id it
//! was created with, and notices from a replaced connection are ignored.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::call::CallType;
use crate::error::CallError;
use crate::logger::dump_candidate;
use crate::media::{LocalMedia, LocalTrack};
use crate::peer::ice::PendingCandidates;
use crate::peer::state::{PeerConnectionRecord, PeerState};
use crate::peer::transport::{
    MediaTransport, TransportEventSink, TransportFactory, TransportNotice, TransportRequest,
    TransportState,
};
use crate::peer::types::{IceCandidate, RemoteStream, RemoteTrack, ServerConfig, SessionDescription};
use crate::signaling::{ChannelClient, SignalingMessage};

/// What became of an inbound renegotiation offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renegotiation {
    Answered,
    NoConnection,
    /// Both sides offered; this side replaced the connection.
    Restarted,
    /// Both sides offered; the peer replaces the connection.
    AwaitingRestart,
}

pub struct PeerConnectionManager {
    local_id: String,
    factory: Arc<dyn TransportFactory>,
    notices: mpsc::UnboundedSender<TransportNotice>,
    records: HashMap<String, PeerConnectionRecord>,
    pending: PendingCandidates,
    relay: Option<ServerConfig>,
    next_connection_id: u64,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        max_pending_candidates: usize,
    ) -> (Self, mpsc::UnboundedReceiver<TransportNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id: local_id.into(),
            factory,
            notices,
            records: HashMap::new(),
            pending: PendingCandidates::new(max_pending_candidates),
            relay: None,
            next_connection_id: 0,
        };
        (manager, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Managed relay added to transports created from now on.
    pub fn set_relay(&mut self, relay: Option<ServerConfig>) {
        self.relay = relay;
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerConnectionRecord> {
        self.records.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.records.contains_key(peer_id)
    }

    pub fn has_live(&self, peer_id: &str) -> bool {
        self.records.get(peer_id).is_some_and(PeerConnectionRecord::is_live)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pending_len(&self, peer_id: &str) -> usize {
        self.pending.len(peer_id)
    }

    pub fn safety_number(&self, peer_id: &str) -> Option<String> {
        self.records.get(peer_id)?.safety_number()
    }

    /// True when `connection_id` is the current connection of `peer_id`.
    pub fn is_current(&self, peer_id: &str, connection_id: u64) -> bool {
        self.records
            .get(peer_id)
            .is_some_and(|r| r.connection_id == connection_id)
    }

    async fn create_record(
        &mut self,
        peer_id: &str,
        call_id: Option<&str>,
    ) -> Result<PeerConnectionRecord, CallError> {
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        let request = TransportRequest {
            peer_id: peer_id.to_owned(),
            connection_id,
            relay: self.relay.clone(),
        };
        let sink = TransportEventSink::new(peer_id, connection_id, self.notices.clone());
        let transport = self.factory.create_transport(request, sink).await?;
        Ok(PeerConnectionRecord::new(
            peer_id,
            connection_id,
            call_id.map(str::to_owned),
            transport,
        ))
    }

    /// Removes the record of `peer_id` without touching its pending
    /// candidates.
    async fn close_record(&mut self, peer_id: &str) -> bool {
        let Some(record) = self.records.remove(peer_id) else {
            return false;
        };
        close_transport(peer_id, &record.transport).await;
        debug!(peer = peer_id, connection = record.connection_id, "peer connection closed");
        true
    }

    async fn attach_media(
        transport: &Arc<dyn MediaTransport>,
        media: Option<&LocalMedia>,
    ) -> Result<(), CallError> {
        if let Some(media) = media {
            for track in media.tracks() {
                transport.add_track(track).await?;
            }
        }
        Ok(())
    }

    /// Caller path: new connection, local tracks, offer sent to `peer_id`.
    /// An existing record for the peer is replaced.
    pub async fn open_offer(
        &mut self,
        peer_id: &str,
        call_id: Option<&str>,
        call_type: CallType,
        media: Option<&LocalMedia>,
        link: &ChannelClient,
    ) -> Result<(), CallError> {
        if self.close_record(peer_id).await {
            debug!(peer = peer_id, "replacing existing connection with a new offer");
        }

        let mut record = self.create_record(peer_id, call_id).await?;
        let transport = Arc::clone(&record.transport);
        let offer = match Self::local_offer(&transport, media).await {
            Ok(offer) => offer,
            Err(err) => {
                close_transport(peer_id, &transport).await;
                return Err(err);
            }
        };

        record.local_sdp = Some(offer.sdp.clone());
        record.state = PeerState::HaveLocalOffer;
        record.awaiting_answer = true;
        let connection_id = record.connection_id;
        self.records.insert(peer_id.to_owned(), record);

        info!(peer = peer_id, connection = connection_id, "sending offer");
        let message = SignalingMessage::offer(&self.local_id, peer_id, call_id, call_type, offer);
        if let Err(err) = link.send(message).await {
            self.close_record(peer_id).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn local_offer(
        transport: &Arc<dyn MediaTransport>,
        media: Option<&LocalMedia>,
    ) -> Result<SessionDescription, CallError> {
        Self::attach_media(transport, media).await?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Callee path: new connection for a remote offer, local tracks, answer
    /// sent back. Buffered candidates are replayed once the offer is applied.
    pub async fn answer_offer(
        &mut self,
        peer_id: &str,
        call_id: Option<&str>,
        offer: SessionDescription,
        media: Option<&LocalMedia>,
        link: &ChannelClient,
    ) -> Result<(), CallError> {
        if self.close_record(peer_id).await {
            debug!(peer = peer_id, "replacing existing connection with the inbound offer");
        }

        let mut record = self.create_record(peer_id, call_id).await?;
        let transport = Arc::clone(&record.transport);
        let remote_sdp = offer.sdp.clone();
        if let Err(err) = transport.set_remote_description(offer).await {
            close_transport(peer_id, &transport).await;
            return Err(err.into());
        }
        record.remote_description_set = true;
        record.remote_sdp = Some(remote_sdp);
        record.state = PeerState::HaveRemoteOffer;
        self.flush_pending(&mut record).await;

        let answer = match Self::local_answer(&transport, media).await {
            Ok(answer) => answer,
            Err(err) => {
                close_transport(peer_id, &transport).await;
                return Err(err);
            }
        };
        record.local_sdp = Some(answer.sdp.clone());
        let connection_id = record.connection_id;
        self.records.insert(peer_id.to_owned(), record);

        info!(peer = peer_id, connection = connection_id, "sending answer");
        let message = SignalingMessage::answer(&self.local_id, peer_id, call_id, answer);
        if let Err(err) = link.send(message).await {
            self.close_record(peer_id).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn local_answer(
        transport: &Arc<dyn MediaTransport>,
        media: Option<&LocalMedia>,
    ) -> Result<SessionDescription, CallError> {
        Self::attach_media(transport, media).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Applies an answer to a connection that is waiting for one. Returns
    /// `false` when there is nothing to apply it to.
    pub async fn apply_answer(
        &mut self,
        peer_id: &str,
        call_id: Option<&str>,
        answer: SessionDescription,
    ) -> Result<bool, CallError> {
        let Some(mut record) = self.records.remove(peer_id) else {
            debug!(peer = peer_id, "answer for unknown peer dropped");
            return Ok(false);
        };
        if !record.awaiting_answer || !same_call(record.call_id.as_deref(), call_id) {
            debug!(peer = peer_id, state = %record.state, "stale answer dropped");
            self.records.insert(peer_id.to_owned(), record);
            return Ok(false);
        }

        let remote_sdp = answer.sdp.clone();
        let result = record.transport.set_remote_description(answer).await;
        if result.is_ok() {
            record.awaiting_answer = false;
            record.remote_description_set = true;
            record.remote_sdp = Some(remote_sdp);
            self.flush_pending(&mut record).await;
        }
        self.records.insert(peer_id.to_owned(), record);
        result?;
        debug!(peer = peer_id, "answer applied");
        Ok(true)
    }

    /// Applies a renegotiation offer on the existing connection and answers
    /// it. When both sides renegotiated at once, the side with the lower id
    /// rebuilds the connection with a fresh offer and the other side drops
    /// the colliding offer.
    pub async fn renegotiate_offer(
        &mut self,
        peer_id: &str,
        offer: SessionDescription,
        call_type: CallType,
        media: Option<&LocalMedia>,
        link: &ChannelClient,
    ) -> Result<Renegotiation, CallError> {
        let restarts = self.local_id.as_str() < peer_id;
        let Some(record) = self.records.get_mut(peer_id).filter(|r| r.is_live()) else {
            return Ok(Renegotiation::NoConnection);
        };
        if record.awaiting_answer {
            if !restarts {
                debug!(peer = peer_id, "renegotiation glare, waiting for the peer to restart");
                record.restart_expected = true;
                return Ok(Renegotiation::AwaitingRestart);
            }
            let call_id = record.call_id.clone();
            info!(peer = peer_id, "renegotiation glare, restarting connection");
            self.open_offer(peer_id, call_id.as_deref(), call_type, media, link)
                .await?;
            return Ok(Renegotiation::Restarted);
        }
        let transport = Arc::clone(&record.transport);
        let call_id = record.call_id.clone();

        transport.set_remote_description(offer.clone()).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        if let Some(record) = self.records.get_mut(peer_id) {
            record.remote_sdp = Some(offer.sdp);
            record.local_sdp = Some(answer.sdp.clone());
        }

        debug!(peer = peer_id, "answering renegotiation");
        let message = SignalingMessage::answer(&self.local_id, peer_id, call_id.as_deref(), answer);
        link.send(message).await?;
        self.flush_renegotiation(peer_id, call_type, link).await?;
        Ok(Renegotiation::Answered)
    }

    /// True when the peer is expected to replace the connection with a fresh
    /// offer after renegotiation glare.
    pub fn restart_expected(&self, peer_id: &str) -> bool {
        self.records.get(peer_id).is_some_and(|r| r.restart_expected)
    }

    /// Sends the renegotiation queued behind an offer that has since been
    /// answered. Returns `false` when nothing was queued.
    pub async fn flush_renegotiation(
        &mut self,
        peer_id: &str,
        call_type: CallType,
        link: &ChannelClient,
    ) -> Result<bool, CallError> {
        let Some(record) = self
            .records
            .get_mut(peer_id)
            .filter(|r| r.renegotiation_queued && !r.awaiting_answer && r.is_live())
        else {
            return Ok(false);
        };
        record.renegotiation_queued = false;
        debug!(peer = peer_id, "sending queued renegotiation");
        self.send_renegotiation(peer_id, call_type, link).await?;
        Ok(true)
    }

    async fn send_renegotiation(
        &mut self,
        peer_id: &str,
        call_type: CallType,
        link: &ChannelClient,
    ) -> Result<(), CallError> {
        let Some(record) = self.records.get(peer_id) else {
            return Ok(());
        };
        let transport = Arc::clone(&record.transport);
        let call_id = record.call_id.clone();

        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        if let Some(record) = self.records.get_mut(peer_id) {
            record.local_sdp = Some(offer.sdp.clone());
            record.awaiting_answer = true;
        }

        let message =
            SignalingMessage::offer(&self.local_id, peer_id, call_id.as_deref(), call_type, offer)
                .renegotiating();
        link.send(message).await?;
        Ok(())
    }

    /// Applies a remote candidate, or buffers it until the remote description
    /// of the peer is set. Failures are logged and swallowed.
    pub async fn add_remote_candidate(
        &mut self,
        peer_id: &str,
        call_id: Option<&str>,
        candidate: IceCandidate,
    ) {
        dump_candidate("REMOTE", peer_id, &candidate);
        let Some(record) = self.records.get_mut(peer_id) else {
            self.pending.push(peer_id, call_id, candidate);
            return;
        };
        if !same_call(record.call_id.as_deref(), call_id) {
            debug!(peer = peer_id, "candidate for another call dropped");
            return;
        }
        if !record.remote_description_set {
            self.pending.push(peer_id, call_id, candidate);
            trace!(peer = peer_id, queued = self.pending.len(peer_id), "candidate buffered");
            return;
        }
        apply_candidate(record, candidate).await;
    }

    async fn flush_pending(&mut self, record: &mut PeerConnectionRecord) {
        let queued = self.pending.take(&record.peer_id, record.call_id.as_deref());
        if queued.is_empty() {
            return;
        }
        debug!(peer = %record.peer_id, count = queued.len(), "replaying buffered candidates");
        for candidate in queued {
            apply_candidate(record, candidate).await;
        }
    }

    /// Relays a locally gathered candidate of a current connection.
    pub async fn relay_local_candidate(
        &mut self,
        peer_id: &str,
        connection_id: u64,
        candidate: IceCandidate,
        link: &ChannelClient,
    ) {
        let Some(record) = self.records.get_mut(peer_id) else {
            return;
        };
        if record.connection_id != connection_id {
            trace!(peer = peer_id, connection = connection_id, "stale local candidate dropped");
            return;
        }
        record.local_candidates.record(&candidate);
        let message = SignalingMessage::ice_candidate(
            &self.local_id,
            peer_id,
            record.call_id.as_deref(),
            candidate,
        );
        if let Err(err) = link.send(message).await {
            warn!(peer = peer_id, %err, "failed to relay local candidate");
        }
    }

    pub fn gathering_complete(&self, peer_id: &str, connection_id: u64) {
        if let Some(record) = self
            .records
            .get(peer_id)
            .filter(|r| r.connection_id == connection_id)
        {
            record.local_candidates.analyze(peer_id);
        }
    }

    /// Records a transport state report. Returns the new record state, or
    /// `None` for a stale or non-moving report.
    pub fn apply_state(
        &mut self,
        peer_id: &str,
        connection_id: u64,
        state: TransportState,
    ) -> Option<PeerState> {
        let record = self
            .records
            .get_mut(peer_id)
            .filter(|r| r.connection_id == connection_id)?;
        let next = record.state.after(state)?;
        debug!(peer = peer_id, from = %record.state, to = %next, "peer state changed");
        record.state = next;
        Some(next)
    }

    /// Adds a remote track. Returns the updated stream when the track is new.
    pub fn apply_remote_track(
        &mut self,
        peer_id: &str,
        connection_id: u64,
        track: RemoteTrack,
    ) -> Option<RemoteStream> {
        let record = self
            .records
            .get_mut(peer_id)
            .filter(|r| r.connection_id == connection_id)?;
        if !record.add_remote_track(track) {
            return None;
        }
        record.remote_stream.clone()
    }

    /// Attaches a newly acquired local track to every live connection.
    /// Existing outbound slots are reused; otherwise the track is added and
    /// the connection renegotiated, or the renegotiation is queued while an
    /// offer is outstanding.
    pub async fn publish_track(
        &mut self,
        track: &LocalTrack,
        call_type: CallType,
        link: &ChannelClient,
    ) -> Result<(), CallError> {
        for peer_id in self.peer_ids() {
            let Some(record) = self.records.get(&peer_id).filter(|r| r.is_live()) else {
                continue;
            };
            let transport = Arc::clone(&record.transport);
            let offer_outstanding = record.awaiting_answer;

            if transport.replace_track(track).await? {
                debug!(peer = %peer_id, kind = %track.kind, "replaced outbound track");
                continue;
            }

            transport.add_track(track).await?;
            if offer_outstanding {
                if let Some(record) = self.records.get_mut(&peer_id) {
                    record.renegotiation_queued = true;
                }
                debug!(peer = %peer_id, kind = %track.kind, "offer outstanding, renegotiation queued");
                continue;
            }
            debug!(peer = %peer_id, kind = %track.kind, "renegotiating for added track");
            self.send_renegotiation(&peer_id, call_type, link).await?;
        }
        Ok(())
    }

    /// Closes and forgets the connection of `peer_id` and its buffered
    /// candidates.
    pub async fn teardown(&mut self, peer_id: &str) -> bool {
        self.pending.clear(peer_id);
        self.close_record(peer_id).await
    }

    pub async fn teardown_all(&mut self) {
        for peer_id in self.peer_ids() {
            self.close_record(&peer_id).await;
        }
        self.pending.clear_all();
    }

    pub fn clear_pending(&mut self, peer_id: &str) {
        self.pending.clear(peer_id);
    }

    /// Drops buffered candidates of every peer except `keep`.
    pub fn retain_pending(&mut self, keep: Option<&str>) {
        self.pending.retain_peer(keep);
    }

    pub fn pending_peers(&self) -> usize {
        self.pending.peer_count()
    }
}

fn same_call(record: Option<&str>, message: Option<&str>) -> bool {
    match (record, message) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

async fn apply_candidate(record: &mut PeerConnectionRecord, candidate: IceCandidate) {
    if record.applied_candidates.contains(&candidate) {
        trace!(peer = %record.peer_id, "duplicate candidate skipped");
        return;
    }
    match record.transport.add_ice_candidate(candidate.clone()).await {
        Ok(()) => {
            record.applied_candidates.insert(candidate);
        }
        Err(err) => warn!(peer = %record.peer_id, %err, "failed to apply remote candidate"),
    }
}

async fn close_transport(peer_id: &str, transport: &Arc<dyn MediaTransport>) {
    if let Err(err) = transport.close().await {
        warn!(peer = peer_id, %err, "error while closing transport");
    }
}
