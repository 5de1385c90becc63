//! 1:1 call handling.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::call::{CallSession, CallStatus, CallType, Direction, EndReason};
use crate::error::CallError;
use crate::events::CallEvent;
use crate::media::LocalMedia;
use crate::peer::manager::Renegotiation;
use crate::signaling::{SignalKind, SignalingMessage};
use crate::utils::random_id;

use super::agent::{Agent, AgentEvent, MediaPurpose, TimerKind};

const RINGING_OUT: CallStatus = CallStatus::Ringing(Direction::Outgoing);
const RINGING_IN: CallStatus = CallStatus::Ringing(Direction::Incoming);

impl Agent {
    fn arm_ring_timer(&mut self) {
        let post = self.timer_post(TimerKind::Ring);
        self.timers.arm_ring(self.config.ring_timeout(), post);
    }

    fn acquire_media(&self, purpose: MediaPurpose, call_type: CallType) {
        let source = Arc::clone(&self.media_source);
        let tx = self.tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = source.acquire(call_type).await;
            let _ = tx.send(AgentEvent::MediaReady {
                generation,
                purpose,
                result,
            });
        });
    }

    pub(super) async fn start_call(
        &mut self,
        peer_id: String,
        call_type: CallType,
    ) -> Result<String, CallError> {
        if peer_id == self.local_id {
            return Err(CallError::SelfCall);
        }
        if self.session.is_some() {
            return Err(CallError::Busy);
        }

        self.timers.cancel_all();
        self.peers.retain_pending(None);
        let call_id = random_id();
        let generation = self.next_generation();
        info!(call = %call_id, peer = %peer_id, ?call_type, "starting call");
        self.session = Some(CallSession::outgoing(
            call_id.clone(),
            generation,
            peer_id,
            call_type,
        ));
        self.announce_status();
        self.arm_ring_timer();
        self.acquire_media(MediaPurpose::Outgoing, call_type);
        Ok(call_id)
    }

    pub(super) async fn accept(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref().filter(|s| s.status() == RINGING_IN) else {
            return Err(CallError::NoActiveCall);
        };
        let call_type = session.call_type;

        self.timers.cancel_ring();
        self.set_status(CallStatus::Connecting);
        self.acquire_media(MediaPurpose::Accept, call_type);
        Ok(())
    }

    pub(super) async fn reject(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref().filter(|s| s.status() == RINGING_IN) else {
            return Err(CallError::NoActiveCall);
        };
        let peer_id = session.peer_id().unwrap_or_default().to_owned();
        let reject = SignalingMessage::reject(&self.local_id, &peer_id, Some(&session.call_id));

        info!(peer = %peer_id, "declining incoming call");
        self.send_direct(reject).await;
        self.finish(CallStatus::Ended, EndReason::LocalHangup).await;
        Ok(())
    }

    pub(super) async fn hang_up(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref().filter(|s| s.status().is_live()) else {
            return Err(CallError::NoActiveCall);
        };
        if session.is_room() {
            return self.leave_room().await;
        }
        if session.status() == RINGING_IN {
            return self.reject().await;
        }

        let peer_id = session.peer_id().unwrap_or_default().to_owned();
        let end = SignalingMessage::end(&self.local_id, &peer_id, Some(&session.call_id));
        info!(peer = %peer_id, status = %session.status(), "hanging up");
        self.send_direct(end).await;
        self.finish(CallStatus::Ended, EndReason::LocalHangup).await;
        Ok(())
    }

    pub(super) async fn on_media_ready(
        &mut self,
        purpose: MediaPurpose,
        result: Result<LocalMedia, CallError>,
    ) {
        let expected = match purpose {
            MediaPurpose::Outgoing => RINGING_OUT,
            MediaPurpose::Accept => CallStatus::Connecting,
        };
        let Some(session) = self
            .session
            .as_ref()
            .filter(|s| !s.is_room() && s.status() == expected)
        else {
            if let Ok(media) = result {
                debug!(?purpose, "media arrived after the call moved on");
                self.media_source.release(media);
            }
            return;
        };
        let peer_id = session.peer_id().unwrap_or_default().to_owned();
        let call_id = session.call_id.clone();
        let call_type = session.call_type;

        let media = match result {
            Ok(media) => media,
            Err(err) => {
                self.fail_acquisition(&err);
                if purpose == MediaPurpose::Accept {
                    let end = SignalingMessage::end(&self.local_id, &peer_id, Some(&call_id));
                    self.send_direct(end).await;
                }
                self.finish(CallStatus::Ended, EndReason::Failed).await;
                return;
            }
        };
        self.media = Some(media);

        let result = match purpose {
            MediaPurpose::Outgoing => {
                self.peers
                    .open_offer(&peer_id, Some(&call_id), call_type, self.media.as_ref(), &self.calls)
                    .await
            }
            MediaPurpose::Accept => {
                let offer = self.session.as_mut().and_then(|s| s.pending_offer.take());
                match offer {
                    Some(offer) => {
                        self.peers
                            .answer_offer(&peer_id, Some(&call_id), offer, self.media.as_ref(), &self.calls)
                            .await
                    }
                    None => Err(CallError::NoActiveCall),
                }
            }
        };

        if let Err(err) = result {
            warn!(call = %call_id, peer = %peer_id, %err, "negotiation failed");
            let end = SignalingMessage::end(&self.local_id, &peer_id, Some(&call_id));
            self.send_direct(end).await;
            self.finish(CallStatus::Ended, EndReason::Failed).await;
        }
    }

    pub(super) async fn on_ring_timeout(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        match session.status() {
            RINGING_OUT => {
                let peer_id = session.peer_id().unwrap_or_default().to_owned();
                let end = SignalingMessage::end(&self.local_id, &peer_id, Some(&session.call_id));
                info!(call = %session.call_id, peer = %peer_id, "no answer");
                self.send_direct(end).await;
                self.finish(CallStatus::NoAnswer, EndReason::NoAnswer).await;
            }
            RINGING_IN => {
                info!(call = %session.call_id, "incoming call missed");
                self.finish(CallStatus::Ended, EndReason::Missed).await;
            }
            _ => {}
        }
    }

    pub(super) async fn on_direct_signal(&mut self, msg: SignalingMessage) {
        debug!(kind = ?msg.kind, from = %msg.from, call = ?msg.call_id, "call signal");
        match msg.kind {
            SignalKind::Offer => self.on_offer(msg).await,
            SignalKind::Answer => self.on_answer(msg).await,
            SignalKind::Reject => self.on_reject(msg).await,
            SignalKind::End => self.on_end(msg).await,
            SignalKind::IceCandidate => self.on_candidate(msg).await,
        }
    }

    async fn on_offer(&mut self, msg: SignalingMessage) {
        let Some(offer) = msg.sdp else {
            debug!(from = %msg.from, "offer without description dropped");
            return;
        };
        let call_id = msg.call_id.as_deref();

        if let Some(session) = self.session.as_ref() {
            if session.is_with(&msg.from, call_id) {
                let call_type = session.call_type;
                if msg.renegotiation && session.status().is_live() {
                    match self
                        .peers
                        .renegotiate_offer(&msg.from, offer, call_type, self.media.as_ref(), &self.calls)
                        .await
                    {
                        Ok(Renegotiation::NoConnection) => debug!(from = %msg.from, "renegotiation without a connection dropped"),
                        Ok(outcome) => debug!(from = %msg.from, ?outcome, "renegotiation handled"),
                        Err(err) => warn!(from = %msg.from, %err, "renegotiation failed"),
                    }
                } else if self.peers.restart_expected(&msg.from) {
                    info!(from = %msg.from, "peer restarted the connection");
                    let result = self
                        .peers
                        .answer_offer(&msg.from, call_id, offer, self.media.as_ref(), &self.calls)
                        .await;
                    if let Err(err) = result {
                        warn!(from = %msg.from, %err, "failed to answer restarted connection");
                        let end = SignalingMessage::end(&self.local_id, &msg.from, call_id);
                        self.send_direct(end).await;
                        self.finish(CallStatus::Ended, EndReason::Failed).await;
                    }
                } else {
                    debug!(from = %msg.from, "repeated offer dropped");
                }
                return;
            }

            info!(from = %msg.from, "busy, rejecting offer");
            let reject = SignalingMessage::reject(&self.local_id, &msg.from, call_id);
            self.send_direct(reject).await;
            return;
        }
        if msg.renegotiation {
            debug!(from = %msg.from, "renegotiation while idle dropped");
            return;
        }

        let call_type = msg.call_type.unwrap_or(CallType::Voice);
        let call_id = msg.call_id.unwrap_or_else(random_id);
        let generation = self.next_generation();
        info!(call = %call_id, from = %msg.from, ?call_type, "incoming call");

        self.timers.cancel_all();
        self.peers.retain_pending(Some(msg.from.as_str()));
        self.session = Some(CallSession::incoming(
            call_id,
            generation,
            msg.from.clone(),
            call_type,
            offer,
        ));
        self.announce_status();
        self.events.emit(CallEvent::IncomingCall {
            from: msg.from,
            call_type,
        });
        self.arm_ring_timer();
    }

    async fn on_answer(&mut self, msg: SignalingMessage) {
        let Some(answer) = msg.sdp else {
            return;
        };
        let call_id = msg.call_id.as_deref();
        let Some((status, call_type)) = self
            .session
            .as_ref()
            .filter(|s| s.is_with(&msg.from, call_id))
            .map(|s| (s.status(), s.call_type))
        else {
            debug!(from = %msg.from, "answer without a matching call dropped");
            return;
        };
        if !matches!(
            status,
            RINGING_OUT | CallStatus::Connecting | CallStatus::Connected
        ) {
            debug!(from = %msg.from, %status, "answer out of state dropped");
            return;
        }

        match self.peers.apply_answer(&msg.from, call_id, answer).await {
            Ok(true) => {
                if status == RINGING_OUT {
                    self.timers.cancel_ring();
                    self.set_status(CallStatus::Connecting);
                }
                if let Err(err) = self
                    .peers
                    .flush_renegotiation(&msg.from, call_type, &self.calls)
                    .await
                {
                    warn!(from = %msg.from, %err, "queued renegotiation failed");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(from = %msg.from, %err, "failed to apply answer");
                let end = SignalingMessage::end(&self.local_id, &msg.from, call_id);
                self.send_direct(end).await;
                self.finish(CallStatus::Ended, EndReason::Failed).await;
            }
        }
    }

    async fn on_reject(&mut self, msg: SignalingMessage) {
        let declined = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_with(&msg.from, msg.call_id.as_deref()) && s.status() == RINGING_OUT);
        if !declined {
            debug!(from = %msg.from, "reject without a ringing call dropped");
            return;
        }
        info!(from = %msg.from, "call declined");
        self.finish(CallStatus::Rejected, EndReason::Declined).await;
    }

    async fn on_end(&mut self, msg: SignalingMessage) {
        let Some(status) = self
            .session
            .as_ref()
            .filter(|s| s.is_with(&msg.from, msg.call_id.as_deref()))
            .map(CallSession::status)
            .filter(|s| s.is_live())
        else {
            debug!(from = %msg.from, "end without a live call dropped");
            return;
        };
        let reason = if status == RINGING_IN {
            EndReason::Cancelled
        } else {
            EndReason::RemoteHangup
        };
        info!(from = %msg.from, %status, "remote ended the call");
        self.finish(CallStatus::Ended, reason).await;
    }

    async fn on_candidate(&mut self, msg: SignalingMessage) {
        let Some(candidate) = msg.candidate else {
            return;
        };
        let call_id = msg.call_id.as_deref();
        match self.session.as_ref() {
            Some(s) if s.is_with(&msg.from, call_id) && s.status().is_live() => {}
            // The offer may still be in flight.
            None => {}
            Some(_) => {
                debug!(from = %msg.from, "candidate for another call dropped");
                return;
            }
        }
        self.peers
            .add_remote_candidate(&msg.from, call_id, candidate)
            .await;
    }
}
