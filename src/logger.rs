use std::sync::Once;

use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

use crate::peer::types::IceCandidate;

static INIT: Once = Once::new();

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "CALLMESH_LOG";

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init(participant: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed by the host application.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    });

    info!(participant, "logging initialized");
}

/// Trickle-ICE candidate dump.
pub fn dump_candidate(label: &str, peer_id: &str, cand: &IceCandidate) {
    trace!(
        label,
        peer = peer_id,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}
