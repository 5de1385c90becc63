//! `webrtc`-backed media transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;
use crate::logger::dump_candidate;
use crate::media::{LocalTrack, MediaKind};
use crate::peer::ice::rtc_ice_servers;
use crate::peer::transport::{
    MediaTransport, TransportEvent, TransportEventSink, TransportFactory, TransportRequest,
    TransportState,
};
use crate::peer::types::{IceCandidate, RemoteTrack, SdpKind, ServerConfig, SessionDescription};

/// Builds one [`RtcTransport`] per remote peer.
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn rtc_config(&self, relay: Option<&ServerConfig>) -> RTCConfiguration {
        let mut servers = self.ice_servers.clone();
        servers.extend(relay.cloned());

        RTCConfiguration {
            ice_servers: rtc_ice_servers(&servers),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create_transport(
        &self,
        request: TransportRequest,
        sink: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Create(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Create(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config(request.relay.as_ref()))
                .await
                .map_err(|e| TransportError::Create(e.to_string()))?,
        );

        attach_handlers(&pc, sink);
        debug!(peer = %request.peer_id, connection = request.connection_id, "peer connection created");

        Ok(Arc::new(RtcTransport {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn map_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, sink: TransportEventSink) {
    let candidates = sink.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate("LOCAL", candidates.peer_id(), &candidate);
                    candidates.emit(TransportEvent::LocalCandidate(candidate));
                }
                Err(err) => warn!(peer = candidates.peer_id(), %err, "failed to serialize local candidate"),
            },
            None => {
                candidates.emit(TransportEvent::GatheringComplete);
            }
        }
        Box::pin(async {})
    }));

    let states = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!(peer = states.peer_id(), state = %st, "peer connection state changed");
        states.emit(TransportEvent::StateChanged(map_state(st)));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _tr: Arc<RTCRtpTransceiver>| {
            if let Some(kind) = map_kind(track.kind()) {
                sink.emit(TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }));
            }
            Box::pin(async {})
        },
    ));
}

/// One `RTCPeerConnection` plus the outbound sender of each media kind.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

impl RtcTransport {
    fn sample_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let mime_type = match track.kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            track.stream_id.clone(),
        ))
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let rtc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        Ok(rtc?)
    }

    fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
            other => Err(TransportError::Negotiation(format!(
                "unexpected description type {other}"
            ))),
        }
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Self::from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Self::from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(Self::to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_remote_description(Self::to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let local = Self::sample_track(track);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;

        // RTCP has to be drained for the interceptors to work.
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
            trace!("rtcp reader finished");
        });

        self.senders.lock().await.insert(track.kind, sender);
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        let senders = self.senders.lock().await;
        let Some(sender) = senders.get(&track.kind) else {
            return Ok(false);
        };
        let local = Self::sample_track(track);
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;
        Ok(true)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }
}
