//! Local media capture owned by the active call session.
//!
//! Actual device capture is outside this crate: a [`MediaSource`] hands out
//! [`LocalTrack`] handles, and the rest of the crate only ever toggles their
//! enabled flags or attaches them to transports.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::call::CallType;
use crate::error::CallError;
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Handle to one captured track. Clones share the enabled flag.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: format!("{kind}-{}", random_id()),
            kind,
            stream_id: stream_id.into(),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::AcqRel) != enabled
    }
}

/// The single local capture of a call: one stream, at most one track per kind.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn has_stream(&self) -> bool {
        !self.tracks.is_empty()
    }

    /// Adds a track, replacing any existing track of the same kind.
    pub fn insert(&mut self, track: LocalTrack) {
        self.tracks.retain(|t| t.kind != track.kind);
        self.tracks.push(track);
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some_and(LocalTrack::is_enabled)
    }

    /// Flips the enabled flag of the track of `kind`; `None` when there is no
    /// such track.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> Option<bool> {
        self.track(kind).map(|t| t.set_enabled(enabled))
    }

    /// Disables every track; called when the session releases the capture.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.set_enabled(false);
        }
        debug!(stream = %self.stream_id, "local media stopped");
    }
}

/// Source of local media. Acquisition may suspend (device permission
/// prompts), so callers must re-validate their state once it resolves.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, call_type: CallType) -> Result<LocalMedia, CallError>;

    async fn acquire_track(&self, kind: MediaKind, stream_id: &str)
        -> Result<LocalTrack, CallError>;

    fn release(&self, media: LocalMedia) {
        media.stop();
    }
}

/// Media source that fabricates track handles without touching devices.
#[derive(Debug, Default, Clone)]
pub struct SyntheticMediaSource;

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, call_type: CallType) -> Result<LocalMedia, CallError> {
        let mut media = LocalMedia::new(format!("stream-{}", random_id()));
        media.insert(LocalTrack::new(MediaKind::Audio, media.stream_id()));
        if call_type == CallType::Video {
            media.insert(LocalTrack::new(MediaKind::Video, media.stream_id()));
        }
        Ok(media)
    }

    async fn acquire_track(
        &self,
        kind: MediaKind,
        stream_id: &str,
    ) -> Result<LocalTrack, CallError> {
        Ok(LocalTrack::new(kind, stream_id))
    }
}
