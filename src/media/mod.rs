//! Local and remote media handles and the capture-source seam.
//!
//! Acquiring capture devices is outside this crate: a [`MediaSource`] hands
//! back a [`LocalMediaHandle`] asynchronously, or fails. The session owns the
//! handle; the connection engine only borrows it to attach tracks.

pub mod synthetic;

pub use synthetic::SyntheticMediaSource;

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Errors reported by a media source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media access denied: {0}")]
    Denied(String),

    #[error("No capture device available: {0}")]
    Unavailable(String),

    #[error("Failed to acquire media: {0}")]
    Failed(String),
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// One outgoing track inside a local stream
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// The track id as it appears in SDP
    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub(crate) fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

/// A captured local stream.
///
/// Not `Clone`: exactly one owner exists at a time. Dropping the handle (or
/// calling [`LocalMediaHandle::release`]) stops the capture.
pub struct LocalMediaHandle {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMediaHandle {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Give up the capture stream
    pub fn release(self) {
        log::debug!(
            "Releasing local stream {} ({} track(s))",
            self.stream_id,
            self.tracks.len()
        );
    }
}

impl fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("stream_id", &self.stream_id)
            .field(
                "tracks",
                &self.tracks.iter().map(|t| (t.kind, t.id().to_string())).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A track received from the partner, handed to the renderer.
#[derive(Clone)]
pub struct RemoteMediaHandle {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteMediaHandle {
    /// Describe a remote track without a live RTP source
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            track: None,
        }
    }

    /// Wrap a live webrtc-rs remote track
    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        let kind = if track.kind() == RTPCodecType::Video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
            track: Some(track),
        }
    }

    /// The live RTP source, if any
    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for RemoteMediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMediaHandle")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("live", &self.track.is_some())
            .finish()
    }
}

/// Asynchronous acquisition of a local capture stream.
///
/// The returned future is `'static` so the session can run it off its event
/// queue while relay events keep being processed.
pub trait MediaSource: Send + Sync {
    fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<LocalMediaHandle, MediaError>>;
}
