use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;

#[derive(Debug, Clone)]
struct PendingCandidate {
    call_id: Option<String>,
    candidate: IceCandidate,
}

/// Queues kept at once; the queue of the least recently seen peer goes first.
pub const MAX_PENDING_PEERS: usize = 32;

/// Remote candidates that arrived before the remote description, queued per
/// peer in arrival order.
#[derive(Debug)]
pub struct PendingCandidates {
    per_peer: HashMap<String, VecDeque<PendingCandidate>>,
    order: VecDeque<String>,
    capacity: usize,
    max_peers: usize,
}

impl PendingCandidates {
    pub fn new(capacity: usize) -> Self {
        Self::with_peer_limit(capacity, MAX_PENDING_PEERS)
    }

    pub fn with_peer_limit(capacity: usize, max_peers: usize) -> Self {
        Self {
            per_peer: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            max_peers: max_peers.max(1),
        }
    }

    /// Queues `candidate`; evicts the oldest entry of a full queue, and the
    /// stalest queue when too many peers are buffered.
    pub fn push(&mut self, peer_id: &str, call_id: Option<&str>, candidate: IceCandidate) {
        self.touch(peer_id);
        let queue = self.per_peer.entry(peer_id.to_owned()).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!(peer = peer_id, capacity = self.capacity, "pending candidate queue full, evicting oldest");
        }
        queue.push_back(PendingCandidate {
            call_id: call_id.map(str::to_owned),
            candidate,
        });
    }

    fn touch(&mut self, peer_id: &str) {
        self.order.retain(|p| p != peer_id);
        while self.order.len() >= self.max_peers {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.per_peer.remove(&evicted);
            debug!(peer = %evicted, "too many pending candidate queues, dropping stalest");
        }
        self.order.push_back(peer_id.to_owned());
    }

    pub fn peer_count(&self) -> usize {
        self.per_peer.len()
    }

    /// Drops every queue but the one of `keep`.
    pub fn retain_peer(&mut self, keep: Option<&str>) {
        self.per_peer.retain(|peer, _| Some(peer.as_str()) == keep);
        self.order.retain(|peer| Some(peer.as_str()) == keep);
    }

    /// Drains the queue of `peer_id`. Entries tagged with another call id are
    /// leftovers of an abandoned attempt and are discarded.
    pub fn take(&mut self, peer_id: &str, call_id: Option<&str>) -> Vec<IceCandidate> {
        self.order.retain(|p| p != peer_id);
        let Some(queue) = self.per_peer.remove(peer_id) else {
            return Vec::new();
        };
        let before = queue.len();
        let kept: Vec<IceCandidate> = queue
            .into_iter()
            .filter(|p| match (p.call_id.as_deref(), call_id) {
                (Some(tagged), Some(current)) => tagged == current,
                _ => true,
            })
            .map(|p| p.candidate)
            .collect();
        if kept.len() < before {
            debug!(peer = peer_id, discarded = before - kept.len(), "discarded stale pending candidates");
        }
        kept
    }

    pub fn len(&self, peer_id: &str) -> usize {
        self.per_peer.get(peer_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.per_peer.values().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self, peer_id: &str) {
        self.per_peer.remove(peer_id);
        self.order.retain(|p| p != peer_id);
    }

    pub fn clear_all(&mut self) {
        self.per_peer.clear();
        self.order.clear();
    }
}

/// Tally of locally gathered candidate types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match candidate.candidate_type() {
            Some("host") => self.host += 1,
            Some("srflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    /// Logs the gathering summary; warns when no relay candidate exists.
    pub fn analyze(&self, peer_id: &str) {
        info!(
            peer = peer_id,
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "candidate gathering complete"
        );
        if self.relay == 0 {
            warn!(peer = peer_id, "no TURN relay candidates gathered, connection through NAT may fail");
        }
    }
}

/// Converts configured servers into the webrtc representation.
pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}
