//! Session lifecycle: match tracking, media and the per-partner negotiation.
//!
//! A [`SessionController`] consumes one queue of inputs: relay events, engine
//! notifications, media acquisition results, offer deadlines and commands
//! from a [`SessionHandle`]. Inputs are handled one at a time.
//!
//! Every match change bumps an epoch. Engine notifications and media results
//! carry the epoch they were started under and are discarded when it no
//! longer matches, so nothing from a previous partner leaks into the next.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::CallConfig;
use crate::media::{LocalMediaHandle, MediaError, MediaSource, RemoteMediaHandle};
use crate::negotiation::{Channel, NegotiationController, NegotiationError, NegotiationState, Role};
use crate::peer::{ConnectionEngine, EngineError, EngineFactory};
use crate::sdp::SessionDescriptor;
use crate::signaling::{PartnerId, RelayEvent, SignalingTransport, Subscription, TransportError};

/// Relay-driven match lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Searching for a partner
    Waiting,
    /// Paired with a partner
    Matched,
    /// No partner; initial state and after the partner left
    Disconnected,
}

/// Errors reported by the session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("No partner matched")]
    NotMatched,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No connection engine for the current partner")]
    NoConnection,

    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),

    #[error("Connection engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Signaling error: {0}")]
    Transport(#[from] TransportError),
}

/// What the application gets to see
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The relay has no partner for us yet
    Waiting,
    Matched { partner: PartnerId, role: Role },
    /// The partner went away; the call is torn down
    PartnerLeft { partner: PartnerId },
    /// An offer is held until the application accepts it
    IncomingCall { from: PartnerId },
    StateChanged {
        partner: PartnerId,
        state: NegotiationState,
    },
    RemoteTrack {
        partner: PartnerId,
        track: RemoteMediaHandle,
    },
    CallFailed {
        partner: Option<PartnerId>,
        error: CallError,
    },
}

/// Notifications raised by the connection engine
#[derive(Debug)]
pub enum EngineEvent {
    DescriptionNeeded,
    RemoteTrack(RemoteMediaHandle),
}

/// Requests from the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    InitiateCall,
    AcceptIncomingCall,
    /// Add another set of local streams to the established call
    SendStreams,
    Shutdown,
}

/// One entry of the session's input queue
#[derive(Debug)]
pub enum SessionInput {
    Relay(RelayEvent),
    /// The relay connection ended
    RelayClosed,
    Engine {
        epoch: u64,
        event: EngineEvent,
    },
    MediaReady {
        epoch: u64,
        result: Result<LocalMediaHandle, MediaError>,
    },
    /// The outstanding offer's deadline passed
    OfferDeadline,
    Command(Command),
}

/// What to do once local media is available
enum MediaIntent {
    Call,
    Answer {
        offer: SessionDescriptor,
        round: Option<u32>,
    },
    /// Attach to the running call; the engine asks for the renegotiation
    SendStreams,
}

/// Offer waiting for the application to accept it
struct HeldOffer {
    offer: SessionDescriptor,
    round: Option<u32>,
}

/// Cloneable handle for sending commands to a running session
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    /// Call the matched partner
    pub fn initiate_call(&self) -> Result<(), CallError> {
        self.send(Command::InitiateCall)
    }

    /// Answer the incoming call held while `auto_accept` is off
    pub fn accept_incoming_call(&self) -> Result<(), CallError> {
        self.send(Command::AcceptIncomingCall)
    }

    /// Send another set of local streams to the partner mid-call
    pub fn send_streams(&self) -> Result<(), CallError> {
        self.send(Command::SendStreams)
    }

    /// Stop the session and release everything it holds
    pub fn shutdown(&self) -> Result<(), CallError> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.inputs
            .send(SessionInput::Command(command))
            .map_err(|_| CallError::InvalidState("session has stopped".to_string()))
    }
}

/// Top-level call orchestrator for one client
pub struct SessionController {
    config: CallConfig,
    /// Our relay identifier
    local_id: String,
    transport: Arc<dyn SignalingTransport>,
    media_source: Arc<dyn MediaSource>,
    engines: Arc<dyn EngineFactory>,
    /// Inbound relay events; dropped on shutdown
    subscription: Option<Subscription>,
    match_state: MatchState,
    partner: Option<PartnerId>,
    epoch: u64,
    /// Highest round token used so far, across matches
    last_round: u32,
    negotiation: Option<NegotiationController>,
    /// Attached in acquisition order
    local_media: Vec<LocalMediaHandle>,
    remote_media: Vec<RemoteMediaHandle>,
    pending_media: Option<MediaIntent>,
    pending_incoming: Option<HeldOffer>,
    inputs_tx: mpsc::UnboundedSender<SessionInput>,
    inputs_rx: mpsc::UnboundedReceiver<SessionInput>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    stopped: bool,
}

enum Woken {
    Relay(Option<RelayEvent>),
    Input(Option<SessionInput>),
    Deadline,
}

async fn recv_relay(subscription: &mut Option<Subscription>) -> Option<RelayEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn attach_all(
    negotiation: &NegotiationController,
    media: &[LocalMediaHandle],
) -> Result<(), EngineError> {
    for handle in media {
        negotiation.attach_media(handle).await?;
    }
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl SessionController {
    /// Create a session and subscribe to the relay.
    ///
    /// # Arguments
    /// * `config` - Call settings
    /// * `transport` - Relay connection
    /// * `media_source` - Local capture
    /// * `engines` - Creates one connection engine per match
    ///
    /// # Returns
    /// The session and the receiving end of its event stream
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn SignalingTransport>,
        media_source: Arc<dyn MediaSource>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), CallError> {
        let subscription = transport.subscribe()?;
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Self {
            local_id: config.client_id.clone(),
            config,
            transport,
            media_source,
            engines,
            subscription: Some(subscription),
            match_state: MatchState::Disconnected,
            partner: None,
            epoch: 0,
            last_round: 0,
            negotiation: None,
            local_media: Vec::new(),
            remote_media: Vec::new(),
            pending_media: None,
            pending_incoming: None,
            inputs_tx,
            inputs_rx,
            events_tx,
            stopped: false,
        };
        Ok((session, events_rx))
    }

    /// Get a handle for sending commands
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inputs: self.inputs_tx.clone(),
        }
    }

    /// Our identifier on the relay
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Get the current match state
    pub fn match_state(&self) -> MatchState {
        self.match_state
    }

    /// Get the active partner, if any
    pub fn partner(&self) -> Option<&PartnerId> {
        self.partner.as_ref()
    }

    /// Glare role for the current match
    pub fn role(&self) -> Option<Role> {
        self.negotiation.as_ref().map(|n| n.role())
    }

    /// Negotiation state for the current partner, if any
    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        self.negotiation.as_ref().map(|n| n.state())
    }

    /// Whether local media is held for the current partner
    pub fn has_local_media(&self) -> bool {
        !self.local_media.is_empty()
    }

    /// Tracks received from the current partner
    pub fn remote_tracks(&self) -> &[RemoteMediaHandle] {
        &self.remote_media
    }

    /// Whether shutdown completed or the relay connection ended
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Process inputs until shutdown or until the relay connection ends
    pub async fn run(mut self) {
        log::info!("Session {} started", self.local_id);
        while !self.stopped {
            let Some(input) = self.next_input().await else {
                break;
            };
            if let Err(e) = self.handle_input(input).await {
                log::warn!("Session {}: {}", self.local_id, e);
            }
        }
        self.teardown().await;
        log::info!("Session {} stopped", self.local_id);
    }

    /// Wait for the next input
    pub async fn next_input(&mut self) -> Option<SessionInput> {
        let deadline = self.offer_deadline();
        let woken = tokio::select! {
            event = recv_relay(&mut self.subscription) => Woken::Relay(event),
            input = self.inputs_rx.recv() => Woken::Input(input),
            _ = sleep_until_deadline(deadline) => Woken::Deadline,
        };

        match woken {
            Woken::Relay(Some(event)) => Some(SessionInput::Relay(event)),
            Woken::Relay(None) => {
                self.subscription = None;
                Some(SessionInput::RelayClosed)
            }
            Woken::Input(input) => input,
            Woken::Deadline => Some(SessionInput::OfferDeadline),
        }
    }

    /// Next input if one is ready now
    pub fn try_next_input(&mut self) -> Option<SessionInput> {
        if let Some(event) = self.subscription.as_mut().and_then(|s| s.try_recv()) {
            return Some(SessionInput::Relay(event));
        }
        if let Ok(input) = self.inputs_rx.try_recv() {
            return Some(input);
        }
        match self.offer_deadline() {
            Some(deadline) if deadline <= Instant::now() => Some(SessionInput::OfferDeadline),
            _ => None,
        }
    }

    /// Handle one input
    pub async fn handle_input(&mut self, input: SessionInput) -> Result<(), CallError> {
        match input {
            SessionInput::Relay(event) => self.on_relay_event(event).await,
            SessionInput::RelayClosed => {
                log::warn!("Relay connection lost");
                self.teardown().await;
                self.match_state = MatchState::Disconnected;
                self.stopped = true;
                Err(self.fail(CallError::Transport(TransportError::Closed(
                    "relay connection lost".to_string(),
                ))))
            }
            SessionInput::Engine { epoch, event } => {
                if epoch != self.epoch {
                    log::debug!("Discarding engine event from a previous match: {:?}", event);
                    return Ok(());
                }
                self.on_engine_event(event).await
            }
            SessionInput::MediaReady { epoch, result } => self.on_media_ready(epoch, result).await,
            SessionInput::OfferDeadline => self.on_offer_deadline().await,
            SessionInput::Command(Command::InitiateCall) => self.initiate_call().await,
            SessionInput::Command(Command::AcceptIncomingCall) => self.accept_incoming_call().await,
            SessionInput::Command(Command::SendStreams) => self.send_streams().await,
            SessionInput::Command(Command::Shutdown) => {
                self.shutdown().await;
                Ok(())
            }
        }
    }

    async fn on_relay_event(&mut self, event: RelayEvent) -> Result<(), CallError> {
        if let Some(from) = event.sender() {
            if self.partner.as_ref() != Some(from) {
                log::debug!(
                    "Discarding {} from {} (active partner: {:?})",
                    event.name(),
                    from,
                    self.partner
                );
                return Ok(());
            }
        }

        match event {
            RelayEvent::MatchFound {
                partner_id,
                self_id,
                polite,
            } => self.on_match_found(partner_id, self_id, polite).await,
            RelayEvent::Waiting { message } => {
                self.on_waiting(message).await;
                Ok(())
            }
            RelayEvent::PartnerDisconnected { message } => {
                self.on_partner_disconnected(message).await;
                Ok(())
            }
            RelayEvent::IncomingCall { offer, round, .. } => {
                self.on_incoming_call(offer, round).await
            }
            RelayEvent::CallAnswer { answer, round, .. } => {
                self.on_remote_answer(Channel::Call, answer, round).await
            }
            RelayEvent::NegoOffer { offer, round, .. } => {
                let before = self.negotiation_state();
                let result = match self.negotiation.as_mut() {
                    Some(negotiation) => negotiation
                        .on_remote_offer(Channel::Renegotiation, offer, round)
                        .await
                        .map(|_| ())
                        .map_err(CallError::Negotiation),
                    None => Ok(()),
                };
                self.report(before, result)
            }
            RelayEvent::NegoAnswer { answer, round, .. } => {
                self.on_remote_answer(Channel::Renegotiation, answer, round)
                    .await
            }
        }
    }

    /// A partner was assigned: fresh engine, fresh negotiation in `Idle`
    async fn on_match_found(
        &mut self,
        partner: PartnerId,
        self_id: Option<String>,
        polite: Option<bool>,
    ) -> Result<(), CallError> {
        if let Some(previous) = self.partner.clone() {
            log::info!("New match replaces {}", previous);
            self.teardown().await;
        }
        if let Some(id) = self_id {
            self.local_id = id;
        }

        self.epoch += 1;
        self.match_state = MatchState::Matched;
        self.partner = Some(partner.clone());

        let role = Role::resolve(&self.local_id, &partner, polite);
        log::info!("Matched with {} ({})", partner, role);
        self.emit(SessionEvent::Matched {
            partner: partner.clone(),
            role,
        });

        let engine = match self.engines.create().await {
            Ok(engine) => engine,
            Err(e) => return Err(self.fail(CallError::Engine(e))),
        };
        self.install_handlers(engine.as_ref());

        self.negotiation = Some(NegotiationController::new(
            partner.clone(),
            role,
            engine,
            self.transport.clone(),
            self.config.offer_timeout(),
            self.last_round,
        ));
        self.emit(SessionEvent::StateChanged {
            partner,
            state: NegotiationState::Idle,
        });
        Ok(())
    }

    async fn on_waiting(&mut self, message: Option<String>) {
        self.teardown().await;
        self.match_state = MatchState::Waiting;
        log::info!(
            "Waiting for a partner{}",
            message.map(|m| format!(": {}", m)).unwrap_or_default()
        );
        self.emit(SessionEvent::Waiting);
    }

    async fn on_partner_disconnected(&mut self, message: Option<String>) {
        let left = self.partner.clone();
        self.teardown().await;
        self.match_state = MatchState::Disconnected;

        if let Some(partner) = left {
            log::info!(
                "Partner {} left{}",
                partner,
                message.map(|m| format!(": {}", m)).unwrap_or_default()
            );
            self.emit(SessionEvent::PartnerLeft { partner });
        }
    }

    /// Start a call to the matched partner.
    ///
    /// Media is acquired first; the offer goes out once it is attached.
    /// Repeated requests while acquisition is pending do nothing.
    async fn initiate_call(&mut self) -> Result<(), CallError> {
        if self.match_state != MatchState::Matched {
            return Err(self.fail(CallError::NotMatched));
        }
        let Some(state) = self.negotiation_state() else {
            return Err(self.fail(CallError::NoConnection));
        };
        if self.pending_media.is_some() {
            log::debug!("Call setup already in progress");
            return Ok(());
        }
        if state != NegotiationState::Idle {
            return Err(self.fail(CallError::InvalidState(format!(
                "cannot start a call while {}",
                state
            ))));
        }

        if self.has_local_media() {
            return self.call_with_media().await;
        }
        self.pending_media = Some(MediaIntent::Call);
        self.acquire_media();
        Ok(())
    }

    /// Accept the offer held while `auto_accept` is off
    async fn accept_incoming_call(&mut self) -> Result<(), CallError> {
        if self.match_state != MatchState::Matched {
            return Err(self.fail(CallError::NotMatched));
        }
        if self.negotiation.is_none() {
            return Err(self.fail(CallError::NoConnection));
        }
        let Some(held) = self.pending_incoming.take() else {
            return Err(self.fail(CallError::InvalidState(
                "no incoming call to accept".to_string(),
            )));
        };

        if self.has_local_media() {
            return self.answer_with_media(held.offer, held.round).await;
        }
        self.pending_media = Some(MediaIntent::Answer {
            offer: held.offer,
            round: held.round,
        });
        self.acquire_media();
        Ok(())
    }

    /// Acquire another set of local streams and add them to the call.
    ///
    /// Attaching changes the local media, so the engine asks for a new
    /// description and the controller sends `nego:offer`.
    async fn send_streams(&mut self) -> Result<(), CallError> {
        if self.match_state != MatchState::Matched {
            return Err(self.fail(CallError::NotMatched));
        }
        let Some(state) = self.negotiation_state() else {
            return Err(self.fail(CallError::NoConnection));
        };
        if self.pending_media.is_some() {
            log::debug!("Media acquisition already in progress");
            return Ok(());
        }
        if !matches!(
            state,
            NegotiationState::Stable | NegotiationState::Renegotiating
        ) {
            return Err(self.fail(CallError::InvalidState(format!(
                "cannot send streams while {}",
                state
            ))));
        }

        self.pending_media = Some(MediaIntent::SendStreams);
        self.acquire_media();
        Ok(())
    }

    async fn on_incoming_call(
        &mut self,
        offer: SessionDescriptor,
        round: Option<u32>,
    ) -> Result<(), CallError> {
        let (Some(state), Some(role)) = (self.negotiation_state(), self.role()) else {
            log::debug!("Discarding incoming call without a connection");
            return Ok(());
        };

        match self.pending_media.take() {
            Some(MediaIntent::Call) if role.is_polite() => {
                log::debug!("Incoming call while setting up ours: answering instead");
                self.pending_media = Some(MediaIntent::Answer { offer, round });
                return Ok(());
            }
            Some(MediaIntent::Call) => {
                log::debug!("Incoming call while setting up ours: keeping ours");
                self.pending_media = Some(MediaIntent::Call);
                return Ok(());
            }
            Some(MediaIntent::Answer { .. }) => {
                log::debug!("Newer incoming call replaces the pending one");
                self.pending_media = Some(MediaIntent::Answer { offer, round });
                return Ok(());
            }
            Some(MediaIntent::SendStreams) => {
                self.pending_media = Some(MediaIntent::SendStreams);
            }
            None => {}
        }

        if state == NegotiationState::Idle {
            if self.has_local_media() {
                return self.answer_with_media(offer, round).await;
            }
            if self.config.auto_accept {
                self.pending_media = Some(MediaIntent::Answer { offer, round });
                self.acquire_media();
            } else if let Some(from) = self.partner.clone() {
                log::info!("Incoming call from {}", from);
                self.pending_incoming = Some(HeldOffer { offer, round });
                self.emit(SessionEvent::IncomingCall { from });
            }
            return Ok(());
        }

        let before = Some(state);
        let result = match self.negotiation.as_mut() {
            Some(negotiation) => negotiation
                .on_remote_offer(Channel::Call, offer, round)
                .await
                .map(|_| ())
                .map_err(CallError::Negotiation),
            None => Ok(()),
        };
        self.report(before, result)
    }

    async fn on_remote_answer(
        &mut self,
        channel: Channel,
        answer: SessionDescriptor,
        round: Option<u32>,
    ) -> Result<(), CallError> {
        let before = self.negotiation_state();
        let result = match self.negotiation.as_mut() {
            Some(negotiation) => negotiation
                .on_remote_answer(channel, answer, round)
                .await
                .map(|_| ())
                .map_err(CallError::Negotiation),
            None => Ok(()),
        };
        self.report(before, result)
    }

    async fn on_engine_event(&mut self, event: EngineEvent) -> Result<(), CallError> {
        match event {
            EngineEvent::DescriptionNeeded => {
                let before = self.negotiation_state();
                let result = match self.negotiation.as_mut() {
                    Some(negotiation) => negotiation
                        .on_description_needed()
                        .await
                        .map_err(CallError::Negotiation),
                    None => Ok(()),
                };
                self.report(before, result)
            }
            EngineEvent::RemoteTrack(track) => {
                if let Some(partner) = self.partner.clone() {
                    log::info!("Remote {} track {} from {}", track.kind, track.id, partner);
                    self.remote_media.push(track.clone());
                    self.emit(SessionEvent::RemoteTrack { partner, track });
                }
                Ok(())
            }
        }
    }

    async fn on_media_ready(
        &mut self,
        epoch: u64,
        result: Result<LocalMediaHandle, MediaError>,
    ) -> Result<(), CallError> {
        if epoch != self.epoch {
            log::debug!("Discarding media acquired for a previous match");
            if let Ok(media) = result {
                media.release();
            }
            return Ok(());
        }
        let Some(intent) = self.pending_media.take() else {
            if let Ok(media) = result {
                media.release();
            }
            return Ok(());
        };

        let media = match result {
            Ok(media) => media,
            Err(e) => return Err(self.fail(CallError::MediaAcquisitionFailed(e))),
        };
        log::debug!("Local media ready: {:?}", media);
        self.local_media.push(media);

        match intent {
            MediaIntent::Call => self.call_with_media().await,
            MediaIntent::Answer { offer, round } => self.answer_with_media(offer, round).await,
            MediaIntent::SendStreams => self.attach_held_media().await,
        }
    }

    async fn on_offer_deadline(&mut self) -> Result<(), CallError> {
        let before = self.negotiation_state();
        let result = match self.negotiation.as_mut() {
            Some(negotiation) => negotiation
                .check_timeout(Instant::now())
                .await
                .map_err(CallError::Negotiation),
            None => Ok(()),
        };
        self.report(before, result)
    }

    /// Attach held media and send the initial offer
    async fn call_with_media(&mut self) -> Result<(), CallError> {
        let before = self.negotiation_state();
        let result = match self.negotiation.as_mut() {
            Some(negotiation) => match attach_all(negotiation, &self.local_media).await {
                Err(e) => Err(CallError::Engine(e)),
                Ok(()) if negotiation.state() == NegotiationState::Idle => negotiation
                    .start_offer()
                    .await
                    .map_err(CallError::Negotiation),
                Ok(()) => Ok(()),
            },
            None => Err(CallError::NoConnection),
        };
        self.report(before, result)
    }

    /// Attach held media to the running call
    async fn attach_held_media(&mut self) -> Result<(), CallError> {
        let result = match self.negotiation.as_ref() {
            Some(negotiation) => attach_all(negotiation, &self.local_media)
                .await
                .map_err(CallError::Engine),
            None => Err(CallError::NoConnection),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Attach held media and answer the partner's offer
    async fn answer_with_media(
        &mut self,
        offer: SessionDescriptor,
        round: Option<u32>,
    ) -> Result<(), CallError> {
        let before = self.negotiation_state();
        let result = match self.negotiation.as_mut() {
            Some(negotiation) => match attach_all(negotiation, &self.local_media).await {
                Err(e) => Err(CallError::Engine(e)),
                Ok(()) if negotiation.state() == NegotiationState::Idle => negotiation
                    .accept_offer(offer, round)
                    .await
                    .map(|_| ())
                    .map_err(CallError::Negotiation),
                Ok(()) => negotiation
                    .on_remote_offer(Channel::Call, offer, round)
                    .await
                    .map(|_| ())
                    .map_err(CallError::Negotiation),
            },
            None => Err(CallError::NoConnection),
        };
        self.report(before, result)
    }

    /// Run acquisition off the queue; the result comes back as an input
    fn acquire_media(&self) {
        let acquisition = self.media_source.acquire(self.config.media);
        let inputs = self.inputs_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = acquisition.await;
            let _ = inputs.send(SessionInput::MediaReady { epoch, result });
        });
    }

    fn install_handlers(&self, engine: &dyn ConnectionEngine) {
        let epoch = self.epoch;

        let inputs = self.inputs_tx.clone();
        engine.on_description_needed(Box::new(move || {
            let _ = inputs.send(SessionInput::Engine {
                epoch,
                event: EngineEvent::DescriptionNeeded,
            });
        }));

        let inputs = self.inputs_tx.clone();
        engine.on_remote_track(Box::new(move |track| {
            let _ = inputs.send(SessionInput::Engine {
                epoch,
                event: EngineEvent::RemoteTrack(track),
            });
        }));
    }

    /// Drop everything tied to the current partner
    async fn teardown(&mut self) {
        self.epoch += 1;
        self.pending_media = None;
        self.pending_incoming = None;

        if let Some(mut negotiation) = self.negotiation.take() {
            self.last_round = self.last_round.max(negotiation.round());
            negotiation.close().await;
            self.emit(SessionEvent::StateChanged {
                partner: negotiation.partner().clone(),
                state: NegotiationState::Closed,
            });
        }
        for media in self.local_media.drain(..) {
            media.release();
        }
        self.remote_media.clear();
        self.partner = None;
    }

    async fn shutdown(&mut self) {
        log::info!("Session {} shutting down", self.local_id);
        self.teardown().await;
        self.match_state = MatchState::Disconnected;
        self.subscription = None;
        self.stopped = true;
    }

    fn offer_deadline(&self) -> Option<Instant> {
        self.negotiation.as_ref().and_then(|n| n.deadline())
    }

    /// Publish a state change if there was one and surface failures
    fn report(
        &self,
        before: Option<NegotiationState>,
        result: Result<(), CallError>,
    ) -> Result<(), CallError> {
        let after = self.negotiation_state();
        if after != before {
            if let (Some(state), Some(partner)) = (after, self.partner.clone()) {
                self.emit(SessionEvent::StateChanged { partner, state });
            }
        }
        result.map_err(|e| self.fail(e))
    }

    fn fail(&self, error: CallError) -> CallError {
        log::warn!("Call failed: {}", error);
        self.emit(SessionEvent::CallFailed {
            partner: self.partner.clone(),
            error: error.clone(),
        });
        error
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::media::{MediaKind, SyntheticMediaSource};
    use crate::signaling::{LoopbackRelay, OutboundSignal};
    use crate::testing::{
        collect_events, drain, drain_pair, FailingMediaSource, GatedMediaSource, MockEngineFactory,
        RecordingTransport, SignalingState,
    };

    struct Harness {
        session: SessionController,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        transport: Arc<RecordingTransport>,
        engines: Arc<MockEngineFactory>,
    }

    fn config(client_id: &str) -> CallConfig {
        CallConfig {
            client_id: client_id.to_string(),
            ..CallConfig::default()
        }
    }

    fn harness_with(config: CallConfig, media: Arc<dyn MediaSource>) -> Harness {
        let transport = RecordingTransport::new();
        let engines = MockEngineFactory::new(&config.client_id);
        let (session, events) =
            SessionController::new(config, transport.clone(), media, engines.clone()).unwrap();
        Harness {
            session,
            events,
            transport,
            engines,
        }
    }

    fn harness(client_id: &str) -> Harness {
        harness_with(
            config(client_id),
            Arc::new(SyntheticMediaSource::new(client_id)),
        )
    }

    fn match_found(partner: &str) -> RelayEvent {
        RelayEvent::MatchFound {
            partner_id: PartnerId::from(partner),
            self_id: None,
            polite: None,
        }
    }

    fn incoming_call(from: &str, round: u32) -> RelayEvent {
        RelayEvent::IncomingCall {
            from: PartnerId::from(from),
            offer: SessionDescriptor::offer(format!(
                "v=0\r\na=track:{0}-stream-1-audio\r\na=track:{0}-stream-1-video\r\n",
                from
            )),
            round: Some(round),
        }
    }

    fn call_answer(from: &str, round: u32) -> RelayEvent {
        RelayEvent::CallAnswer {
            from: PartnerId::from(from),
            answer: SessionDescriptor::answer(format!(
                "v=0\r\na=track:{0}-stream-1-audio\r\na=track:{0}-stream-1-video\r\n",
                from
            )),
            round: Some(round),
        }
    }

    async fn matched(h: &mut Harness, partner: &str) {
        h.transport.emit(match_found(partner));
        drain(&mut h.session).await;
        assert_eq!(h.session.match_state(), MatchState::Matched);
    }

    async fn command(h: &mut Harness, command: Command) -> Result<(), CallError> {
        h.session.handle_input(SessionInput::Command(command)).await
    }

    #[tokio::test]
    async fn test_match_then_call_reaches_stable() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        assert_eq!(h.session.partner(), Some(&PartnerId::from("B")));
        assert_eq!(h.session.role(), Some(Role::Impolite));
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Idle));
        assert!(!h.session.has_local_media());

        h.session.handle().initiate_call().unwrap();
        drain(&mut h.session).await;

        let sent = h.transport.take_sent();
        assert!(matches!(
            &sent[..],
            [OutboundSignal::CallOffer { to, round: 1, .. }] if to.as_str() == "B"
        ));
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::OfferSent));
        assert_eq!(h.engines.last().state().attached.len(), 2);

        h.transport.emit(call_answer("B", 1));
        drain(&mut h.session).await;

        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
        let kinds: Vec<MediaKind> = h.session.remote_tracks().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);

        let events = collect_events(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::StateChanged { state: NegotiationState::Stable, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::RemoteTrack { partner, .. } if partner.as_str() == "B")));
    }

    #[tokio::test]
    async fn test_incoming_call_is_answered() {
        let mut h = harness("A");
        matched(&mut h, "B").await;

        h.transport.emit(incoming_call("B", 1));
        drain(&mut h.session).await;

        assert!(matches!(
            &h.transport.sent()[..],
            [OutboundSignal::CallAnswer { to, round: 1, .. }] if to.as_str() == "B"
        ));
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
        assert!(h.session.has_local_media());
        assert_eq!(h.session.remote_tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_partner_disconnect_during_offer_closes_negotiation() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::OfferSent));
        collect_events(&mut h.events);

        h.transport.emit(RelayEvent::PartnerDisconnected { message: None });
        drain(&mut h.session).await;

        let events = collect_events(&mut h.events);
        assert!(matches!(
            &events[..],
            [
                SessionEvent::StateChanged { state: NegotiationState::Closed, .. },
                SessionEvent::PartnerLeft { partner },
            ] if partner.as_str() == "B"
        ));
        assert_eq!(h.session.match_state(), MatchState::Disconnected);
        assert_eq!(h.session.negotiation_state(), None);
        assert!(!h.session.has_local_media());
        assert!(h.engines.last().state().closed);

        // Late answer from the departed partner
        h.transport.take_sent();
        h.transport.emit(call_answer("B", 1));
        drain(&mut h.session).await;
        assert!(collect_events(&mut h.events).is_empty());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_cancels_round_and_late_answer_is_discarded() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;

        h.transport.emit(RelayEvent::Waiting { message: None });
        drain(&mut h.session).await;
        assert_eq!(h.session.match_state(), MatchState::Waiting);
        assert_eq!(h.session.partner(), None);

        matched(&mut h, "C").await;
        assert_eq!(h.engines.created(), 2);

        h.transport.emit(call_answer("B", 1));
        drain(&mut h.session).await;

        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Idle));
        assert_eq!(h.engines.engine(1).signaling(), SignalingState::Stable);
        assert!(h.engines.engine(1).state().current_remote.is_none());
    }

    #[tokio::test]
    async fn test_media_failure_stays_idle_and_sends_nothing() {
        let mut h = harness_with(
            config("A"),
            Arc::new(FailingMediaSource(MediaError::Denied(
                "camera blocked".to_string(),
            ))),
        );
        matched(&mut h, "B").await;
        collect_events(&mut h.events);

        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;

        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Idle));
        assert!(h.transport.sent().is_empty());
        let events = collect_events(&mut h.events);
        assert!(matches!(
            &events[..],
            [SessionEvent::CallFailed {
                error: CallError::MediaAcquisitionFailed(MediaError::Denied(_)),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_repeated_initiate_while_acquiring_is_noop() {
        let media = GatedMediaSource::new("A");
        let mut h = harness_with(config("A"), media.clone());
        matched(&mut h, "B").await;

        command(&mut h, Command::InitiateCall).await.unwrap();
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;
        assert_eq!(media.requests.load(Ordering::SeqCst), 1);
        assert!(h.transport.sent().is_empty());

        media.open();
        drain(&mut h.session).await;
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_media_arriving_after_teardown_is_released() {
        let media = GatedMediaSource::new("A");
        let mut h = harness_with(config("A"), media.clone());
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;

        h.transport.emit(RelayEvent::PartnerDisconnected { message: None });
        drain(&mut h.session).await;

        media.open();
        drain(&mut h.session).await;

        assert!(!h.session.has_local_media());
        assert!(h.transport.sent().is_empty());
        assert!(h.engines.last().state().attached.is_empty());
    }

    #[tokio::test]
    async fn test_manual_accept() {
        let mut h = harness_with(
            CallConfig {
                auto_accept: false,
                ..config("A")
            },
            Arc::new(SyntheticMediaSource::new("A")),
        );
        matched(&mut h, "B").await;
        collect_events(&mut h.events);

        assert!(matches!(
            command(&mut h, Command::AcceptIncomingCall).await,
            Err(CallError::InvalidState(_))
        ));
        collect_events(&mut h.events);

        h.transport.emit(incoming_call("B", 1));
        drain(&mut h.session).await;
        assert!(h.transport.sent().is_empty());
        assert!(matches!(
            &collect_events(&mut h.events)[..],
            [SessionEvent::IncomingCall { from }] if from.as_str() == "B"
        ));

        h.session.handle().accept_incoming_call().unwrap();
        drain(&mut h.session).await;
        assert!(matches!(
            &h.transport.sent()[..],
            [OutboundSignal::CallAnswer { round: 1, .. }]
        ));
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
    }

    #[tokio::test]
    async fn test_offer_timeout_returns_to_idle() {
        let mut h = harness_with(
            CallConfig {
                offer_timeout_ms: 200,
                ..config("A")
            },
            Arc::new(SyntheticMediaSource::new("A")),
        );
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::OfferSent));

        let input = tokio::time::timeout(Duration::from_secs(2), h.session.next_input())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(input, SessionInput::OfferDeadline));
        let result = h.session.handle_input(input).await;
        assert_eq!(
            result,
            Err(CallError::Negotiation(NegotiationError::OfferTimedOut {
                round: 1
            }))
        );
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Idle));
        assert_eq!(h.engines.last().state().rollbacks, 1);

        // Late answer to the expired round
        h.transport.emit(call_answer("B", 1));
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Idle));

        // Media is still held, so a retry offers right away
        h.transport.take_sent();
        command(&mut h, Command::InitiateCall).await.unwrap();
        assert!(matches!(
            &h.transport.sent()[..],
            [OutboundSignal::CallOffer { round: 2, .. }]
        ));
    }

    #[tokio::test]
    async fn test_polite_side_answers_incoming_call_while_acquiring() {
        let media = GatedMediaSource::new("B");
        let mut h = harness_with(config("B"), media.clone());
        matched(&mut h, "A").await;
        assert_eq!(h.session.role(), Some(Role::Polite));

        command(&mut h, Command::InitiateCall).await.unwrap();
        h.transport.emit(incoming_call("A", 1));
        drain(&mut h.session).await;

        media.open();
        drain(&mut h.session).await;

        assert!(matches!(
            &h.transport.sent()[..],
            [OutboundSignal::CallAnswer { to, round: 1, .. }] if to.as_str() == "A"
        ));
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
    }

    #[tokio::test]
    async fn test_impolite_side_keeps_its_call_while_acquiring() {
        let media = GatedMediaSource::new("A");
        let mut h = harness_with(config("A"), media.clone());
        matched(&mut h, "B").await;

        command(&mut h, Command::InitiateCall).await.unwrap();
        h.transport.emit(incoming_call("B", 1));
        drain(&mut h.session).await;

        media.open();
        drain(&mut h.session).await;

        assert!(matches!(
            &h.transport.sent()[..],
            [OutboundSignal::CallOffer { .. }]
        ));
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::OfferSent));
    }

    #[tokio::test]
    async fn test_messages_from_other_parties_are_discarded() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        collect_events(&mut h.events);

        h.transport.emit(incoming_call("Z", 1));
        drain(&mut h.session).await;

        assert!(h.transport.sent().is_empty());
        assert!(!h.session.has_local_media());
        assert!(collect_events(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_new_match_replaces_previous_partner() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        matched(&mut h, "C").await;

        assert_eq!(h.engines.created(), 2);
        assert!(h.engines.engine(0).state().closed);
        assert!(!h.engines.engine(1).state().closed);
        assert_eq!(h.session.partner(), Some(&PartnerId::from("C")));
    }

    #[tokio::test]
    async fn test_engine_creation_failure() {
        let mut h = harness("A");
        h.engines.fail_create.store(true, Ordering::SeqCst);
        h.transport.emit(match_found("B"));
        drain(&mut h.session).await;

        assert_eq!(h.session.match_state(), MatchState::Matched);
        assert_eq!(h.session.negotiation_state(), None);
        assert_eq!(
            command(&mut h, Command::InitiateCall).await,
            Err(CallError::NoConnection)
        );
    }

    #[tokio::test]
    async fn test_call_before_match_is_rejected() {
        let mut h = harness("A");
        assert_eq!(
            command(&mut h, Command::InitiateCall).await,
            Err(CallError::NotMatched)
        );
        assert!(matches!(
            &collect_events(&mut h.events)[..],
            [SessionEvent::CallFailed { partner: None, error: CallError::NotMatched }]
        ));
    }

    #[tokio::test]
    async fn test_renegotiation_from_engine_notification() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;
        h.transport.emit(call_answer("B", 1));
        drain(&mut h.session).await;
        h.transport.take_sent();

        h.engines.last().fire_description_needed();
        drain(&mut h.session).await;
        assert!(matches!(
            &h.transport.sent()[..],
            [OutboundSignal::NegoOffer { round: 2, .. }]
        ));
        assert_eq!(
            h.session.negotiation_state(),
            Some(NegotiationState::Renegotiating)
        );

        h.transport.emit(RelayEvent::NegoAnswer {
            from: PartnerId::from("B"),
            answer: SessionDescriptor::answer("v=0\r\n"),
            round: Some(2),
        });
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscription() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        assert_eq!(h.transport.subscriber_count(), 1);

        command(&mut h, Command::Shutdown).await.unwrap();

        assert!(h.session.is_stopped());
        assert_eq!(h.transport.subscriber_count(), 0);
        assert!(h.engines.last().state().closed);
    }

    #[tokio::test]
    async fn test_glare_between_two_sessions_over_loopback_relay() {
        let relay = LoopbackRelay::new();
        let a_transport = Arc::new(relay.connect("A"));
        let b_transport = Arc::new(relay.connect("B"));
        let a_engines = MockEngineFactory::new("A");
        let b_engines = MockEngineFactory::new("B");

        let (mut a, _a_events) = SessionController::new(
            config("A"),
            a_transport.clone(),
            Arc::new(SyntheticMediaSource::new("A")),
            a_engines.clone(),
        )
        .unwrap();
        let (mut b, _b_events) = SessionController::new(
            config("B"),
            b_transport.clone(),
            Arc::new(SyntheticMediaSource::new("B")),
            b_engines.clone(),
        )
        .unwrap();

        a_transport.join();
        b_transport.join();
        drain_pair(&mut a, &mut b).await;
        assert_eq!(a.role(), Some(Role::Impolite));
        assert_eq!(b.role(), Some(Role::Polite));

        // Both press "call" and both get their media before any offer travels
        a.handle().initiate_call().unwrap();
        b.handle().initiate_call().unwrap();
        let a_call = a.try_next_input().unwrap();
        let b_call = b.try_next_input().unwrap();
        a.handle_input(a_call).await.unwrap();
        b.handle_input(b_call).await.unwrap();

        let wait = Duration::from_secs(1);
        let a_media = tokio::time::timeout(wait, a.next_input()).await.unwrap().unwrap();
        let b_media = tokio::time::timeout(wait, b.next_input()).await.unwrap().unwrap();
        assert!(matches!(a_media, SessionInput::MediaReady { .. }));
        assert!(matches!(b_media, SessionInput::MediaReady { .. }));
        a.handle_input(a_media).await.unwrap();
        b.handle_input(b_media).await.unwrap();
        assert_eq!(a.negotiation_state(), Some(NegotiationState::OfferSent));
        assert_eq!(b.negotiation_state(), Some(NegotiationState::OfferSent));

        drain_pair(&mut a, &mut b).await;

        assert_eq!(a.negotiation_state(), Some(NegotiationState::Stable));
        assert_eq!(b.negotiation_state(), Some(NegotiationState::Stable));
        assert_eq!(a_engines.last().state().rollbacks, 0);
        assert_eq!(b_engines.last().state().rollbacks, 1);
        assert_eq!(a.remote_tracks().len(), 2);
        assert_eq!(b.remote_tracks().len(), 2);

        // Hanging up on one side reaches the other
        relay.leave("A");
        drain(&mut b).await;
        assert_eq!(b.match_state(), MatchState::Disconnected);
        assert_eq!(b.negotiation_state(), None);
    }

    #[tokio::test]
    async fn test_rounds_keep_increasing_across_matches() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;
        assert!(matches!(
            &h.transport.take_sent()[..],
            [OutboundSignal::CallOffer { round: 1, .. }]
        ));

        h.transport.emit(RelayEvent::Waiting { message: None });
        drain(&mut h.session).await;
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;
        assert!(matches!(
            &h.transport.take_sent()[..],
            [OutboundSignal::CallOffer { round: 2, .. }]
        ));

        // Answer to the offer made during the previous match
        h.transport.emit(call_answer("B", 1));
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::OfferSent));

        h.transport.emit(call_answer("B", 2));
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
    }

    #[tokio::test]
    async fn test_send_streams_renegotiates_established_call() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        command(&mut h, Command::InitiateCall).await.unwrap();
        drain(&mut h.session).await;
        h.transport.emit(call_answer("B", 1));
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
        h.transport.take_sent();

        h.session.handle().send_streams().unwrap();
        drain(&mut h.session).await;

        assert!(matches!(
            &h.transport.take_sent()[..],
            [OutboundSignal::NegoOffer { to, round: 2, .. }] if to.as_str() == "B"
        ));
        assert_eq!(
            h.session.negotiation_state(),
            Some(NegotiationState::Renegotiating)
        );
        assert_eq!(h.engines.last().state().attached.len(), 4);

        h.transport.emit(RelayEvent::NegoAnswer {
            from: PartnerId::from("B"),
            answer: SessionDescriptor::answer("v=0\r\n"),
            round: Some(2),
        });
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
    }

    #[tokio::test]
    async fn test_send_streams_requires_established_call() {
        let mut h = harness("A");
        matched(&mut h, "B").await;

        assert!(matches!(
            command(&mut h, Command::SendStreams).await,
            Err(CallError::InvalidState(_))
        ));
        drain(&mut h.session).await;
        assert!(h.transport.sent().is_empty());
        assert!(!h.session.has_local_media());
    }

    #[tokio::test]
    async fn test_renegotiation_offer_from_previous_partner_is_discarded() {
        let mut h = harness("A");
        matched(&mut h, "B").await;
        h.transport.emit(RelayEvent::Waiting { message: None });
        drain(&mut h.session).await;
        matched(&mut h, "C").await;

        h.transport.emit(incoming_call("C", 1));
        drain(&mut h.session).await;
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
        h.transport.take_sent();
        collect_events(&mut h.events);

        h.transport.emit(RelayEvent::NegoOffer {
            from: PartnerId::from("B"),
            offer: SessionDescriptor::offer("v=0\r\na=track:B-late-audio\r\n"),
            round: Some(5),
        });
        drain(&mut h.session).await;

        assert!(h.transport.sent().is_empty());
        assert!(collect_events(&mut h.events).is_empty());
        assert_eq!(h.session.negotiation_state(), Some(NegotiationState::Stable));
        assert_eq!(h.engines.last().signaling(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_renegotiation_glare_between_two_sessions() {
        let relay = LoopbackRelay::new();
        let a_transport = Arc::new(relay.connect("A"));
        let b_transport = Arc::new(relay.connect("B"));
        let a_engines = MockEngineFactory::new("A");
        let b_engines = MockEngineFactory::new("B");

        let (mut a, _a_events) = SessionController::new(
            config("A"),
            a_transport.clone(),
            Arc::new(SyntheticMediaSource::new("A")),
            a_engines.clone(),
        )
        .unwrap();
        let (mut b, _b_events) = SessionController::new(
            config("B"),
            b_transport.clone(),
            Arc::new(SyntheticMediaSource::new("B")),
            b_engines.clone(),
        )
        .unwrap();

        a_transport.join();
        b_transport.join();
        drain_pair(&mut a, &mut b).await;
        a.handle().initiate_call().unwrap();
        drain_pair(&mut a, &mut b).await;
        assert_eq!(a.negotiation_state(), Some(NegotiationState::Stable));
        assert_eq!(b.negotiation_state(), Some(NegotiationState::Stable));

        // Both engines want a new offer before either side hears the other
        a_engines.last().fire_description_needed();
        b_engines.last().fire_description_needed();
        let a_needed = a.try_next_input().unwrap();
        let b_needed = b.try_next_input().unwrap();
        assert!(matches!(a_needed, SessionInput::Engine { .. }));
        assert!(matches!(b_needed, SessionInput::Engine { .. }));
        a.handle_input(a_needed).await.unwrap();
        b.handle_input(b_needed).await.unwrap();
        assert_eq!(a.negotiation_state(), Some(NegotiationState::Renegotiating));
        assert_eq!(b.negotiation_state(), Some(NegotiationState::Renegotiating));

        drain_pair(&mut a, &mut b).await;

        assert_eq!(a.negotiation_state(), Some(NegotiationState::Stable));
        assert_eq!(b.negotiation_state(), Some(NegotiationState::Stable));
        let a_engine = a_engines.last();
        let b_engine = b_engines.last();
        assert_eq!(a_engine.state().rollbacks, 0);
        assert_eq!(b_engine.state().rollbacks, 1);

        let a_state = a_engine.state();
        let b_state = b_engine.state();
        assert_eq!(a_state.current_remote, b_state.current_local);
        assert_eq!(b_state.current_remote, a_state.current_local);
    }
}
