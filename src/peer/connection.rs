//! Connection engine: one peer connection per matched partner.
//!
//! [`ConnectionEngine`] is the seam the negotiation state machine drives.
//! [`RtcConnectionEngine`] wraps RTCPeerConnection from webrtc-rs and handles
//! SDP exchange with ICE candidates embedded in the descriptions.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{LocalMediaHandle, RemoteMediaHandle};
use crate::sdp::SessionDescriptor;

/// Upper bound on waiting for ICE gathering after setting a local description
const GATHERING_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors raised by a connection engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    #[error("Failed to create {kind}: {reason}")]
    CreateDescription { kind: &'static str, reason: String },

    #[error("Failed to set {side} description: {reason}")]
    ApplyDescription { side: &'static str, reason: String },

    #[error("Nothing to roll back: {0}")]
    Rollback(String),

    #[error("Failed to attach tracks: {0}")]
    AttachTracks(String),

    #[error("Failed to close peer connection: {0}")]
    Close(String),
}

/// Called when the media configuration changed and a fresh offer is needed
pub type DescriptionNeededHandler = Box<dyn Fn() + Send + Sync>;

/// Called for every track received from the partner
pub type RemoteTrackHandler = Box<dyn Fn(RemoteMediaHandle) + Send + Sync>;

/// Description exchange primitives used by the negotiation controller.
///
/// Every operation is asynchronous and may fail; failures are returned, never
/// panicked. One engine exists per partner and is closed on teardown, so
/// handlers registered here never outlive the match they belong to.
pub trait ConnectionEngine: Send + Sync {
    /// Create an offer reflecting the currently attached tracks
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescriptor, EngineError>>;

    /// Create an answer to `remote`, applying it first if it is not already
    /// the current remote description
    fn create_answer<'a>(
        &'a self,
        remote: &'a SessionDescriptor,
    ) -> BoxFuture<'a, Result<SessionDescriptor, EngineError>>;

    fn set_remote_description(
        &self,
        desc: SessionDescriptor,
    ) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Apply a local description. Returns the description as applied, which
    /// may carry more than the input (e.g. gathered ICE candidates).
    fn set_local_description(
        &self,
        desc: SessionDescriptor,
    ) -> BoxFuture<'_, Result<SessionDescriptor, EngineError>>;

    /// Discard a local offer that has not been answered yet
    fn rollback(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Discard a remote offer that was applied but never answered
    fn rollback_remote(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Add the handle's tracks to the connection. The handle is only borrowed.
    fn attach_tracks<'a>(
        &'a self,
        media: &'a LocalMediaHandle,
    ) -> BoxFuture<'a, Result<(), EngineError>>;

    fn on_description_needed(&self, handler: DescriptionNeededHandler);

    fn on_remote_track(&self, handler: RemoteTrackHandler);

    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>>;
}

type HandlerSlot<T> = Arc<Mutex<Option<T>>>;

/// webrtc-rs backed engine
pub struct RtcConnectionEngine {
    /// The RTCPeerConnection instance
    peer_connection: Arc<RTCPeerConnection>,
    /// Senders for attached tracks, keyed by track id
    senders: Mutex<Vec<(String, Arc<RTCRtpSender>)>>,
    description_needed: HandlerSlot<DescriptionNeededHandler>,
    remote_track: HandlerSlot<RemoteTrackHandler>,
}

impl RtcConnectionEngine {
    /// Create a new engine.
    ///
    /// # Arguments
    /// * `api` - Shared WebRTC API instance
    /// * `config` - RTCConfiguration with ICE servers
    pub async fn new(api: &API, config: RTCConfiguration) -> Result<Self, EngineError> {
        let peer_connection = api
            .new_peer_connection(config)
            .await
            .map_err(|e| EngineError::Create(e.to_string()))?;
        let peer_connection = Arc::new(peer_connection);

        let description_needed: HandlerSlot<DescriptionNeededHandler> =
            Arc::new(Mutex::new(None));
        let remote_track: HandlerSlot<RemoteTrackHandler> = Arc::new(Mutex::new(None));

        // Forward negotiation-needed into whatever handler is installed
        let slot = description_needed.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            if let Some(handler) = slot.lock().as_ref() {
                handler();
            }
            Box::pin(async {})
        }));

        // Setup on_track handler for incoming media
        let slot = remote_track.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let handle = RemoteMediaHandle::from_track(track);
                log::info!(
                    "Remote {} track {} (stream {})",
                    handle.kind,
                    handle.id,
                    handle.stream_id
                );
                if let Some(handler) = slot.lock().as_ref() {
                    handler(handle);
                }
                Box::pin(async {})
            },
        ));

        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::info!("Peer connection state: {}", state);
                Box::pin(async {})
            },
        ));

        Ok(Self {
            peer_connection,
            senders: Mutex::new(Vec::new()),
            description_needed,
            remote_track,
        })
    }

    /// Get the peer connection for advanced usage
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// Number of attached outgoing tracks
    pub fn attached_track_count(&self) -> usize {
        self.senders.lock().len()
    }

    async fn current_remote_sdp(&self) -> Option<String> {
        self.peer_connection
            .remote_description()
            .await
            .map(|d| d.sdp)
    }
}

impl ConnectionEngine for RtcConnectionEngine {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescriptor, EngineError>> {
        async move {
            let offer = self
                .peer_connection
                .create_offer(None)
                .await
                .map_err(|e| EngineError::CreateDescription {
                    kind: "offer",
                    reason: e.to_string(),
                })?;
            SessionDescriptor::from_rtc(&offer).map_err(|reason| EngineError::CreateDescription {
                kind: "offer",
                reason,
            })
        }
        .boxed()
    }

    fn create_answer<'a>(
        &'a self,
        remote: &'a SessionDescriptor,
    ) -> BoxFuture<'a, Result<SessionDescriptor, EngineError>> {
        async move {
            if self.current_remote_sdp().await.as_deref() != Some(remote.sdp()) {
                self.set_remote_description(remote.clone()).await?;
            }

            let answer = self
                .peer_connection
                .create_answer(None)
                .await
                .map_err(|e| EngineError::CreateDescription {
                    kind: "answer",
                    reason: e.to_string(),
                })?;
            SessionDescriptor::from_rtc(&answer).map_err(|reason| {
                EngineError::CreateDescription {
                    kind: "answer",
                    reason,
                }
            })
        }
        .boxed()
    }

    fn set_remote_description(
        &self,
        desc: SessionDescriptor,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            let apply_failed = |reason: String| EngineError::ApplyDescription {
                side: "remote",
                reason,
            };
            let rtc = desc.to_rtc().map_err(apply_failed)?;
            self.peer_connection
                .set_remote_description(rtc)
                .await
                .map_err(|e| apply_failed(e.to_string()))
        }
        .boxed()
    }

    fn set_local_description(
        &self,
        desc: SessionDescriptor,
    ) -> BoxFuture<'_, Result<SessionDescriptor, EngineError>> {
        async move {
            let apply_failed = |reason: String| EngineError::ApplyDescription {
                side: "local",
                reason,
            };
            let rtc = desc.to_rtc().map_err(apply_failed)?;

            // Candidates are not trickled; wait for gathering so they end up in the SDP
            let mut gathering_done = self.peer_connection.gathering_complete_promise().await;

            self.peer_connection
                .set_local_description(rtc)
                .await
                .map_err(|e| apply_failed(e.to_string()))?;

            if tokio::time::timeout(GATHERING_TIMEOUT, gathering_done.recv())
                .await
                .is_err()
            {
                log::warn!(
                    "ICE gathering did not finish within {:?}, sending partial candidates",
                    GATHERING_TIMEOUT
                );
            }

            match self.peer_connection.local_description().await {
                Some(applied) => SessionDescriptor::from_rtc(&applied).map_err(apply_failed),
                None => Ok(desc),
            }
        }
        .boxed()
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            let mut rollback = self
                .peer_connection
                .pending_local_description()
                .await
                .ok_or_else(|| EngineError::Rollback("no pending local offer".to_string()))?;
            rollback.sdp_type = RTCSdpType::Rollback;

            self.peer_connection
                .set_local_description(rollback)
                .await
                .map_err(|e| EngineError::Rollback(e.to_string()))
        }
        .boxed()
    }

    fn rollback_remote(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            let mut rollback = self
                .peer_connection
                .pending_remote_description()
                .await
                .ok_or_else(|| EngineError::Rollback("no pending remote offer".to_string()))?;
            rollback.sdp_type = RTCSdpType::Rollback;

            self.peer_connection
                .set_remote_description(rollback)
                .await
                .map_err(|e| EngineError::Rollback(e.to_string()))
        }
        .boxed()
    }

    fn attach_tracks<'a>(
        &'a self,
        media: &'a LocalMediaHandle,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            for local in media.tracks() {
                let already_attached = self
                    .senders
                    .lock()
                    .iter()
                    .any(|(id, _)| id == local.id());
                if already_attached {
                    continue;
                }

                let sender = self
                    .peer_connection
                    .add_track(local.as_track_local())
                    .await
                    .map_err(|e| EngineError::AttachTracks(e.to_string()))?;

                // Drain RTCP so interceptors (NACK, reports) keep working
                let rtcp_sender = sender.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while rtcp_sender.read(&mut buf).await.is_ok() {}
                });

                log::debug!("Attached {} track {}", local.kind, local.id());
                self.senders.lock().push((local.id().to_string(), sender));
            }
            Ok(())
        }
        .boxed()
    }

    fn on_description_needed(&self, handler: DescriptionNeededHandler) {
        *self.description_needed.lock() = Some(handler);
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.remote_track.lock() = Some(handler);
    }

    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            // Drop handlers first so nothing fires into a dead session
            self.description_needed.lock().take();
            self.remote_track.lock().take();
            self.senders.lock().clear();

            self.peer_connection
                .close()
                .await
                .map_err(|e| EngineError::Close(e.to_string()))
        }
        .boxed()
    }
}
