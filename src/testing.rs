//! Test doubles shared by the unit tests.
//!
//! [`MockEngine`] follows the offer/answer signaling-state rules of a real
//! peer connection (stable, have-local-offer, have-remote-offer) so that
//! negotiation mistakes such as answering without a remote offer fail the
//! same way they would against webrtc-rs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

use crate::media::{
    LocalMediaHandle, MediaConstraints, MediaError, MediaKind, MediaSource, RemoteMediaHandle,
    SyntheticMediaSource,
};
use crate::peer::{
    ConnectionEngine, DescriptionNeededHandler, EngineError, EngineFactory, RemoteTrackHandler,
};
use crate::sdp::{SdpKind, SessionDescriptor};
use crate::session::{SessionController, SessionEvent};
use crate::signaling::{OutboundSignal, RelayEvent, SignalingTransport, Subscribers, Subscription, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Default)]
pub struct MockEngineState {
    pub signaling: SignalingState,
    pub current_local: Option<SessionDescriptor>,
    pub current_remote: Option<SessionDescriptor>,
    /// Remote description in force before the pending remote offer
    pub stable_remote: Option<SessionDescriptor>,
    pub pending_local: Option<SessionDescriptor>,
    pub attached: Vec<String>,
    pub announced_remote: HashSet<String>,
    pub offers_created: u32,
    pub rollbacks: u32,
    pub remote_rollbacks: u32,
    pub closed: bool,
    pub fail_create_offer: bool,
    /// Apply the remote offer, then fail to produce an answer
    pub fail_create_answer: bool,
    pub fail_set_local: bool,
    pub fail_set_remote: bool,
    pub fail_attach: bool,
}

/// In-memory connection engine; clones share state
#[derive(Clone)]
pub struct MockEngine {
    label: String,
    state: Arc<Mutex<MockEngineState>>,
    description_needed: Arc<Mutex<Option<DescriptionNeededHandler>>>,
    remote_track: Arc<Mutex<Option<RemoteTrackHandler>>>,
}

impl MockEngine {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Arc::new(Mutex::new(MockEngineState::default())),
            description_needed: Arc::new(Mutex::new(None)),
            remote_track: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockEngineState> {
        self.state.lock()
    }

    pub fn signaling(&self) -> SignalingState {
        self.state.lock().signaling
    }

    /// Simulate the engine asking for a new offer
    pub fn fire_description_needed(&self) {
        if let Some(handler) = self.description_needed.lock().as_ref() {
            handler();
        }
    }

    fn describe(&self, kind: SdpKind, serial: u32) -> SessionDescriptor {
        let state = self.state.lock();
        let mut sdp = format!("v=0\r\no=mock {} {}\r\na={}\r\n", self.label, serial, kind.as_str());
        for id in &state.attached {
            sdp.push_str(&format!("a=track:{}\r\n", id));
        }
        match kind {
            SdpKind::Offer => SessionDescriptor::offer(sdp),
            SdpKind::Answer => SessionDescriptor::answer(sdp),
        }
    }

    fn apply_remote(&self, desc: &SessionDescriptor) -> Result<(), EngineError> {
        let fail = |reason: &str| EngineError::ApplyDescription {
            side: "remote",
            reason: reason.to_string(),
        };

        let new_tracks: Vec<String> = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(fail("engine closed"));
            }
            if state.fail_set_remote {
                return Err(fail("injected failure"));
            }
            match (desc.kind(), state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.stable_remote = state.current_remote.clone();
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.current_local = state.pending_local.take();
                }
                (kind, signaling) => {
                    return Err(fail(&format!(
                        "cannot apply remote {} in {:?}",
                        kind.as_str(),
                        signaling
                    )))
                }
            }
            state.current_remote = Some(desc.clone());

            let ids: Vec<String> = desc
                .sdp()
                .lines()
                .filter_map(|line| line.strip_prefix("a=track:"))
                .map(|id| id.to_string())
                .collect();
            ids.into_iter()
                .filter(|id| state.announced_remote.insert(id.clone()))
                .collect()
        };

        if let Some(handler) = self.remote_track.lock().as_ref() {
            for id in new_tracks {
                let (stream_id, kind) = match id.strip_suffix("-video") {
                    Some(stream) => (stream.to_string(), MediaKind::Video),
                    None => (
                        id.strip_suffix("-audio").unwrap_or(&id).to_string(),
                        MediaKind::Audio,
                    ),
                };
                handler(RemoteMediaHandle::new(id.clone(), stream_id, kind));
            }
        }
        Ok(())
    }
}

impl ConnectionEngine for MockEngine {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescriptor, EngineError>> {
        let result = {
            let mut state = self.state.lock();
            if state.fail_create_offer || state.signaling == SignalingState::HaveRemoteOffer {
                Err(EngineError::CreateDescription {
                    kind: "offer",
                    reason: format!("cannot offer in {:?}", state.signaling),
                })
            } else {
                state.offers_created += 1;
                Ok(state.offers_created)
            }
        };
        future::ready(result.map(|serial| self.describe(SdpKind::Offer, serial))).boxed()
    }

    fn create_answer<'a>(
        &'a self,
        remote: &'a SessionDescriptor,
    ) -> BoxFuture<'a, Result<SessionDescriptor, EngineError>> {
        async move {
            let already_applied = {
                let state = self.state.lock();
                state.signaling == SignalingState::HaveRemoteOffer
                    && state.current_remote.as_ref() == Some(remote)
            };
            if !already_applied {
                self.apply_remote(remote)?;
            }
            if self.state.lock().fail_create_answer {
                return Err(EngineError::CreateDescription {
                    kind: "answer",
                    reason: "injected failure".to_string(),
                });
            }
            Ok(self.describe(SdpKind::Answer, 0))
        }
        .boxed()
    }

    fn set_remote_description(
        &self,
        desc: SessionDescriptor,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        future::ready(self.apply_remote(&desc)).boxed()
    }

    fn set_local_description(
        &self,
        desc: SessionDescriptor,
    ) -> BoxFuture<'_, Result<SessionDescriptor, EngineError>> {
        let mut state = self.state.lock();
        let result = match (desc.kind(), state.signaling) {
            _ if state.fail_set_local => Err(EngineError::ApplyDescription {
                side: "local",
                reason: "injected failure".to_string(),
            }),
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                state.signaling = SignalingState::HaveLocalOffer;
                state.pending_local = Some(desc.clone());
                Ok(desc)
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                state.signaling = SignalingState::Stable;
                state.current_local = Some(desc.clone());
                Ok(desc)
            }
            (kind, signaling) => Err(EngineError::ApplyDescription {
                side: "local",
                reason: format!("cannot apply local {} in {:?}", kind.as_str(), signaling),
            }),
        };
        future::ready(result).boxed()
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        let mut state = self.state.lock();
        let result = if state.signaling == SignalingState::HaveLocalOffer {
            state.signaling = SignalingState::Stable;
            state.pending_local = None;
            state.rollbacks += 1;
            Ok(())
        } else {
            Err(EngineError::Rollback("no pending local offer".to_string()))
        };
        future::ready(result).boxed()
    }

    fn rollback_remote(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        let mut state = self.state.lock();
        let result = if state.signaling == SignalingState::HaveRemoteOffer {
            state.signaling = SignalingState::Stable;
            state.current_remote = state.stable_remote.take();
            state.remote_rollbacks += 1;
            Ok(())
        } else {
            Err(EngineError::Rollback("no pending remote offer".to_string()))
        };
        future::ready(result).boxed()
    }

    fn attach_tracks<'a>(
        &'a self,
        media: &'a LocalMediaHandle,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        let result = {
            let mut state = self.state.lock();
            if state.fail_attach {
                Err(EngineError::AttachTracks("injected failure".to_string()))
            } else {
                let mut added = false;
                for track in media.tracks() {
                    if !state.attached.iter().any(|id| id == track.id()) {
                        state.attached.push(track.id().to_string());
                        added = true;
                    }
                }
                // Like a browser, ask for an offer once a call is up
                Ok(added && state.current_local.is_some())
            }
        };
        if let Ok(true) = result {
            self.fire_description_needed();
        }
        future::ready(result.map(|_| ())).boxed()
    }

    fn on_description_needed(&self, handler: DescriptionNeededHandler) {
        *self.description_needed.lock() = Some(handler);
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.remote_track.lock() = Some(handler);
    }

    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        self.description_needed.lock().take();
        self.remote_track.lock().take();
        self.state.lock().closed = true;
        future::ready(Ok(())).boxed()
    }
}

/// Hands out [`MockEngine`]s and keeps a clone of each for inspection
#[derive(Default)]
pub struct MockEngineFactory {
    label: String,
    engines: Mutex<Vec<MockEngine>>,
    pub fail_create: AtomicBool,
}

impl MockEngineFactory {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            ..Default::default()
        })
    }

    pub fn created(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn engine(&self, index: usize) -> MockEngine {
        self.engines.lock()[index].clone()
    }

    pub fn last(&self) -> MockEngine {
        let engines = self.engines.lock();
        engines[engines.len() - 1].clone()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self) -> BoxFuture<'_, Result<Box<dyn ConnectionEngine>, EngineError>> {
        let result = if self.fail_create.load(Ordering::SeqCst) {
            Err(EngineError::Create("injected failure".to_string()))
        } else {
            let mut engines = self.engines.lock();
            let engine = MockEngine::new(&format!("{}-{}", self.label, engines.len() + 1));
            engines.push(engine.clone());
            Ok(Box::new(engine) as Box<dyn ConnectionEngine>)
        };
        future::ready(result).boxed()
    }
}

/// Transport that records what is sent and lets tests play the relay
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundSignal>>,
    subscribers: Arc<Subscribers>,
    pub fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            subscribers: Subscribers::new(),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Deliver an inbound relay event
    pub fn emit(&self, event: RelayEvent) {
        self.subscribers.publish(event);
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<OutboundSignal> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl SignalingTransport for RecordingTransport {
    fn send(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("injected failure".to_string()));
        }
        self.sent.lock().push(signal);
        Ok(())
    }

    fn subscribe(&self) -> Result<Subscription, TransportError> {
        self.subscribers.subscribe()
    }
}

/// Media source that always fails
pub struct FailingMediaSource(pub MediaError);

impl MediaSource for FailingMediaSource {
    fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<LocalMediaHandle, MediaError>> {
        future::ready(Err(self.0.clone())).boxed()
    }
}

/// Media source whose acquisitions complete only when the test opens the gate
pub struct GatedMediaSource {
    inner: Arc<SyntheticMediaSource>,
    gate: Arc<Notify>,
    pub requests: Arc<AtomicUsize>,
}

impl GatedMediaSource {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SyntheticMediaSource::new(label)),
            gate: Arc::new(Notify::new()),
            requests: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Let one pending (or the next) acquisition complete
    pub fn open(&self) {
        self.gate.notify_one();
    }
}

impl MediaSource for GatedMediaSource {
    fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<LocalMediaHandle, MediaError>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.clone();
        let inner = self.inner.clone();
        async move {
            gate.notified().await;
            inner.acquire(constraints).await
        }
        .boxed()
    }
}

/// Process every input that is ready, yielding so spawned acquisitions run
pub async fn drain(session: &mut SessionController) {
    let mut idle_rounds = 0;
    while idle_rounds < 8 {
        match session.try_next_input() {
            Some(input) => {
                idle_rounds = 0;
                if let Err(e) = session.handle_input(input).await {
                    log::debug!("Input failed: {}", e);
                }
            }
            None => {
                idle_rounds += 1;
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Drain two sessions until neither has work left
pub async fn drain_pair(a: &mut SessionController, b: &mut SessionController) {
    for _ in 0..4 {
        drain(a).await;
        drain(b).await;
    }
}

pub fn collect_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
