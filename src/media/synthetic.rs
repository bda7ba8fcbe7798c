//! Media source backed by webrtc-rs static-sample tracks.
//!
//! There is no capture device behind these tracks; the application writes
//! encoded samples into them (for example from a file, a generator or an
//! external encoder). Useful for headless peers and demos.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{LocalMediaHandle, LocalTrack, MediaConstraints, MediaError, MediaKind, MediaSource};

/// Produces OPUS audio and VP8 video sample tracks on demand
pub struct SyntheticMediaSource {
    /// Prefix for generated stream ids
    label: String,
    /// Audio sample rate (48000 recommended)
    sample_rate: u32,
    /// Number of audio channels (1 or 2)
    channels: u16,
    next_stream: AtomicU64,
}

impl SyntheticMediaSource {
    /// Create a source producing 48kHz stereo OPUS + VP8 tracks.
    ///
    /// # Arguments
    /// * `label` - Prefix for stream ids (e.g., the client id)
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            sample_rate: 48000,
            channels: 2,
            next_stream: AtomicU64::new(1),
        }
    }

    /// Override the audio format
    pub fn with_audio_format(mut self, sample_rate: u32, channels: u16) -> Self {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self
    }

    fn build(&self, constraints: MediaConstraints) -> Result<LocalMediaHandle, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::Failed(
                "At least one of audio or video must be requested".to_string(),
            ));
        }

        let stream_id = format!(
            "{}-stream-{}",
            self.label,
            self.next_stream.fetch_add(1, Ordering::SeqCst)
        );
        let mut tracks = Vec::new();

        if constraints.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: self.sample_rate,
                    channels: self.channels,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                format!("{}-audio", stream_id),
                stream_id.clone(),
            ));
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                track,
            });
        }

        if constraints.video {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                format!("{}-video", stream_id),
                stream_id.clone(),
            ));
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                track,
            });
        }

        Ok(LocalMediaHandle::new(stream_id, tracks))
    }
}

impl MediaSource for SyntheticMediaSource {
    fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<LocalMediaHandle, MediaError>> {
        future::ready(self.build(constraints)).boxed()
    }
}
