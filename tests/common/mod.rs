#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use callmesh::call::{CallStatus, CallType};
use callmesh::collab::{CallLogEntry, CallLogSink, Notifier, RelayToken, StatusCue, TokenRequest, TokenService};
use callmesh::config::CallConfig;
use callmesh::error::{CallError, TransportError};
use callmesh::events::CallEvent;
use callmesh::media::{LocalMedia, LocalTrack, MediaKind, MediaSource};
use callmesh::peer::transport::{
    MediaTransport, TransportEvent, TransportEventSink, TransportFactory, TransportRequest,
    TransportState,
};
use callmesh::peer::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription};
use callmesh::session::{CallAgentBuilder, CallHandle, CallSnapshot};
use callmesh::signaling::{ChannelClient, ChannelMessage, LocalHub, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Signaling {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Default)]
struct FakeState {
    signaling: Signaling,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    rejected_offers: usize,
    tracks: Vec<LocalTrack>,
    candidates: Vec<IceCandidate>,
    offers: usize,
    connected: bool,
    closed: bool,
}

/// Scripted transport: follows the offer/answer signaling states without
/// rollback, connects once a negotiation completes and announces the remote
/// tracks listed in the remote description.
pub struct FakeTransport {
    pub owner: String,
    pub peer_id: String,
    pub connection_id: u64,
    sink: TransportEventSink,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    fn render(&self, kind: &str, state: &FakeState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 0 IN IP4 0.0.0.0\r\ns={kind}\r\na=fingerprint:sha-256 {}:{}\r\n",
            self.connection_id, self.owner, self.connection_id
        );
        for track in &state.tracks {
            sdp.push_str(&format!("m={} {} {}\r\n", track.kind, track.id, track.stream_id));
        }
        sdp
    }

    fn remote_tracks(sdp: &str) -> Vec<RemoteTrack> {
        sdp.lines()
            .filter_map(|line| line.trim().strip_prefix("m="))
            .filter_map(|rest| {
                let mut parts = rest.split_whitespace();
                let kind = match parts.next()? {
                    "audio" => MediaKind::Audio,
                    "video" => MediaKind::Video,
                    _ => return None,
                };
                Some(RemoteTrack {
                    id: parts.next()?.to_owned(),
                    kind,
                    stream_id: parts.next()?.to_owned(),
                })
            })
            .collect()
    }

    fn host_candidate(&self) -> IceCandidate {
        let mut candidate = IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.1 {} typ host",
            self.connection_id,
            5000 + self.connection_id
        ));
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        candidate
    }

    fn maybe_connect(&self, state: &mut FakeState) {
        if state.closed || state.local.is_none() || state.signaling != Signaling::Stable {
            return;
        }
        let Some(remote) = state.remote.as_ref() else {
            return;
        };
        if !state.connected {
            state.connected = true;
            self.sink.emit(TransportEvent::StateChanged(TransportState::Connecting));
            self.sink.emit(TransportEvent::StateChanged(TransportState::Connected));
        }
        for track in Self::remote_tracks(&remote.sdp) {
            self.sink.emit(TransportEvent::RemoteTrack(track));
        }
    }

    pub fn fail(&self) {
        self.sink.emit(TransportEvent::StateChanged(TransportState::Failed));
    }

    pub fn disconnect(&self) {
        self.sink.emit(TransportEvent::StateChanged(TransportState::Disconnected));
    }

    pub fn reconnect(&self) {
        self.sink.emit(TransportEvent::StateChanged(TransportState::Connected));
    }

    /// Emits a local candidate as if ICE had just gathered it.
    pub fn gather(&self, candidate: IceCandidate) {
        self.sink.emit(TransportEvent::LocalCandidate(candidate));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn track_kinds(&self) -> Vec<MediaKind> {
        self.state.lock().unwrap().tracks.iter().map(|t| t.kind).collect()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().unwrap().offers
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.connected && !state.closed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.state.lock().unwrap().local.as_ref().map(|d| d.sdp.clone())
    }

    /// True when the last local description set was an offer.
    pub fn is_offerer(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .local
            .as_ref()
            .is_some_and(|d| d.kind == SdpKind::Offer)
    }

    /// Remote offers refused because a local offer was pending.
    pub fn rejected_offers(&self) -> usize {
        self.state.lock().unwrap().rejected_offers
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.offers += 1;
        Ok(SessionDescription::offer(self.render("offer", &state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock().unwrap();
        if state.signaling != Signaling::HaveRemoteOffer {
            return Err(TransportError::Negotiation("no remote offer".into()));
        }
        Ok(SessionDescription::answer(self.render("answer", &state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.signaling = match (desc.kind, state.signaling) {
            (SdpKind::Offer, Signaling::Stable | Signaling::HaveLocalOffer) => Signaling::HaveLocalOffer,
            (SdpKind::Answer, Signaling::HaveRemoteOffer) => Signaling::Stable,
            (kind, current) => {
                return Err(TransportError::Negotiation(format!(
                    "local {kind:?} in {current:?}"
                )))
            }
        };
        let first = state.local.is_none();
        state.local = Some(desc);
        if first {
            self.sink.emit(TransportEvent::LocalCandidate(self.host_candidate()));
            self.sink.emit(TransportEvent::GatheringComplete);
        }
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::Negotiation("unparsable description".into()));
        }
        state.signaling = match (desc.kind, state.signaling) {
            (SdpKind::Offer, Signaling::Stable) => Signaling::HaveRemoteOffer,
            (SdpKind::Answer, Signaling::HaveLocalOffer) => Signaling::Stable,
            (kind, current) => {
                if kind == SdpKind::Offer {
                    state.rejected_offers += 1;
                }
                return Err(TransportError::Negotiation(format!(
                    "remote {kind:?} in {current:?}"
                )));
            }
        };
        state.remote = Some(desc);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(TransportError::Candidate("remote description not set".into()));
        }
        if candidate.candidate.contains("malformed") {
            return Err(TransportError::Candidate(candidate.candidate));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.state.lock().unwrap().tracks.push(track.clone());
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        let mut state = self.state.lock().unwrap();
        match state.tracks.iter_mut().find(|t| t.kind == track.kind) {
            Some(slot) => {
                *slot = track.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            self.sink.emit(TransportEvent::StateChanged(TransportState::Closed));
        }
        Ok(())
    }
}

pub struct FakeFactory {
    owner: String,
    created: Mutex<Vec<Arc<FakeTransport>>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl FakeFactory {
    pub fn new(owner: &str) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.to_owned(),
            created: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().unwrap().clone()
    }

    /// Most recent transport created for `peer_id`.
    pub fn latest(&self, peer_id: &str) -> Arc<FakeTransport> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.peer_id == peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("{} has no transport for {peer_id}", self.owner))
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create_transport(
        &self,
        request: TransportRequest,
        sink: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let transport = Arc::new(FakeTransport {
            owner: self.owner.clone(),
            peer_id: request.peer_id.clone(),
            connection_id: request.connection_id,
            sink,
            state: Mutex::new(FakeState::default()),
        });
        self.requests.lock().unwrap().push(request);
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[derive(Default)]
pub struct RecordingLog {
    entries: Mutex<Vec<CallLogEntry>>,
    fail: AtomicBool,
}

impl RecordingLog {
    pub fn entries(&self) -> Vec<CallLogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CallLogSink for RecordingLog {
    async fn record(&self, entry: CallLogEntry) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("call log store unavailable");
        }
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    cues: Mutex<Vec<StatusCue>>,
}

impl RecordingNotifier {
    pub fn cues(&self) -> Vec<StatusCue> {
        self.cues.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, cue: StatusCue) {
        self.cues.lock().unwrap().push(cue);
    }
}

/// Media source whose permission prompt is always denied.
pub struct DeniedMedia;

#[async_trait]
impl MediaSource for DeniedMedia {
    async fn acquire(&self, _call_type: CallType) -> Result<LocalMedia, CallError> {
        Err(CallError::MediaAcquisition("permission denied".into()))
    }

    async fn acquire_track(&self, _kind: MediaKind, _stream_id: &str) -> Result<LocalTrack, CallError> {
        Err(CallError::MediaAcquisition("permission denied".into()))
    }
}

pub struct StaticTokens;

#[async_trait]
impl TokenService for StaticTokens {
    async fn issue_token(&self, request: TokenRequest) -> anyhow::Result<RelayToken> {
        Ok(RelayToken {
            token: format!("token-{}", request.room_name),
            url: "turn:relay.example.org:3478".into(),
        })
    }
}

pub struct DeniedTokens;

#[async_trait]
impl TokenService for DeniedTokens {
    async fn issue_token(&self, _request: TokenRequest) -> anyhow::Result<RelayToken> {
        anyhow::bail!("not a member of this room")
    }
}

pub struct Participant {
    pub handle: CallHandle,
    pub events: broadcast::Receiver<CallEvent>,
    pub factory: Arc<FakeFactory>,
    pub log: Arc<RecordingLog>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Participant {
    pub async fn status(&self) -> CallStatus {
        self.handle.status().await.unwrap()
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        self.handle.snapshot().await.unwrap()
    }

    /// Every event received so far.
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn outcomes(events: &[CallEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::Outcome { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn statuses(events: &[CallEvent]) -> Vec<CallStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::StatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

pub fn hub() -> Arc<LocalHub> {
    callmesh::logger::init("tests");
    Arc::new(LocalHub::new())
}

pub async fn spawn(hub: &Arc<LocalHub>, id: &str) -> Participant {
    spawn_with(hub, id, CallConfig::default(), |builder| builder).await
}

pub async fn spawn_with(
    hub: &Arc<LocalHub>,
    id: &str,
    config: CallConfig,
    customize: impl FnOnce(CallAgentBuilder) -> CallAgentBuilder,
) -> Participant {
    let factory = FakeFactory::new(id);
    let log = Arc::new(RecordingLog::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let channel: Arc<dyn SignalingChannel> = hub.clone();

    let builder = CallHandle::builder(id, channel)
        .config(config)
        .transport_factory(factory.clone())
        .log_sink(log.clone())
        .notifier(notifier.clone());
    let handle = customize(builder).spawn().await.unwrap();
    let events = handle.subscribe();

    Participant {
        handle,
        events,
        factory,
        log,
        notifier,
    }
}

/// Subscribes a bare client to `scope`; inbound messages land in the
/// returned receiver.
pub async fn raw_client(
    hub: &Arc<LocalHub>,
    scope: &str,
    id: &str,
) -> (ChannelClient, mpsc::UnboundedReceiver<ChannelMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let channel: Arc<dyn SignalingChannel> = hub.clone();
    let client = ChannelClient::subscribe(channel, scope, id, move |message| {
        let _ = tx.send(message);
    })
    .await
    .unwrap();
    (client, rx)
}

pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Lets every queued message, callback and spawned task run to completion.
/// Time is paused in these tests, so this only advances the clock once the
/// runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
