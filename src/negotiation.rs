//! Offer/answer negotiation with one partner.
//!
//! A [`NegotiationController`] owns the connection engine for a single match
//! and turns signaling events into engine operations and outbound messages:
//!
//! ```text
//! Idle ──start_offer──▶ OfferSent ──call:answer──▶ Stable
//! Idle ──accept_offer─▶ OfferReceived ──answer sent──▶ Stable
//! Stable ──description needed──▶ Renegotiating ──nego:answer──▶ Stable
//! Stable ──nego:offer──▶ (answer sent) Stable
//! any ──close──▶ Closed
//! ```
//!
//! Every local offer carries a round token that the answer has to echo.
//! When both sides offer at once the polite side rolls back and answers,
//! the impolite side ignores the incoming offer and waits for its answer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::media::LocalMediaHandle;
use crate::peer::{ConnectionEngine, EngineError};
use crate::sdp::SessionDescriptor;
use crate::signaling::{OutboundSignal, PartnerId, SignalingTransport, TransportError};

/// Negotiation state for the active partner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing exchanged yet
    Idle,
    /// Initial offer sent, waiting for `call:answer`
    OfferSent,
    /// Answering an offer from the partner
    OfferReceived,
    /// Descriptions agreed on both sides
    Stable,
    /// Renegotiation offer sent, waiting for `nego:answer`
    Renegotiating,
    /// Torn down
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::Stable => "stable",
            NegotiationState::Renegotiating => "renegotiating",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Glare role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rolls back its own offer when offers collide
    Polite,
    /// Keeps its own offer when offers collide
    Impolite,
}

impl Role {
    /// Decide the role for a match.
    ///
    /// An explicit assignment from the relay wins. Otherwise the side whose
    /// identifier sorts lower is impolite, so both ends agree without talking.
    ///
    /// # Arguments
    /// * `local_id` - Our identifier on the relay
    /// * `partner` - The partner's identifier
    /// * `polite` - Role assigned by the relay, if any
    pub fn resolve(local_id: &str, partner: &PartnerId, polite: Option<bool>) -> Self {
        match polite {
            Some(true) => Role::Polite,
            Some(false) => Role::Impolite,
            None if local_id < partner.as_str() => Role::Impolite,
            None => Role::Polite,
        }
    }

    /// Whether this side gives way when offers collide
    pub fn is_polite(&self) -> bool {
        *self == Role::Polite
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Polite => write!(f, "polite"),
            Role::Impolite => write!(f, "impolite"),
        }
    }
}

/// Which exchange a signaling message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// `call:offer` / `incoming:call` / `call:answer`
    Call,
    /// `nego:offer` / `nego:answer`
    Renegotiation,
}

/// What became of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Stale or unexpected; nothing changed
    Discarded,
    /// Offer collided with ours and we keep ours
    GlareIgnored,
}

/// Errors raised while negotiating
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("Cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: NegotiationState,
    },

    #[error("Failed to apply description: {0}")]
    DescriptionApplyFailed(EngineError),

    #[error("Failed to create description: {0}")]
    DescriptionCreateFailed(EngineError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Offer for round {round} was not answered in time")]
    OfferTimedOut { round: u32 },
}

impl NegotiationError {
    fn from_answer_error(e: EngineError) -> Self {
        match e {
            EngineError::CreateDescription { .. } => NegotiationError::DescriptionCreateFailed(e),
            other => NegotiationError::DescriptionApplyFailed(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OutstandingOffer {
    round: u32,
    channel: Channel,
    deadline: Instant,
}

/// Negotiation state machine for one partner
pub struct NegotiationController {
    partner: PartnerId,
    role: Role,
    engine: Box<dyn ConnectionEngine>,
    transport: Arc<dyn SignalingTransport>,
    state: NegotiationState,
    /// Set once the first exchange completed; aborted rounds fall back to
    /// Stable instead of Idle
    established: bool,
    /// Last round token used for a local offer
    round: u32,
    outstanding: Option<OutstandingOffer>,
    last_remote_round: Option<u32>,
    renegotiate_when_stable: bool,
    offer_timeout: Duration,
}

impl NegotiationController {
    /// Create a controller in `Idle`.
    ///
    /// # Arguments
    /// * `partner` - The matched partner
    /// * `role` - Glare role for this match
    /// * `engine` - Fresh engine for this partner, owned from now on
    /// * `transport` - Relay connection for outbound messages
    /// * `offer_timeout` - How long a local offer may stay unanswered
    /// * `last_round` - Highest round token already used by this client; the
    ///   first offer here uses the next one
    pub fn new(
        partner: PartnerId,
        role: Role,
        engine: Box<dyn ConnectionEngine>,
        transport: Arc<dyn SignalingTransport>,
        offer_timeout: Duration,
        last_round: u32,
    ) -> Self {
        Self {
            partner,
            role,
            engine,
            transport,
            state: NegotiationState::Idle,
            established: false,
            round: last_round,
            outstanding: None,
            last_remote_round: None,
            renegotiate_when_stable: false,
            offer_timeout,
        }
    }

    /// Get the partner this controller negotiates with
    pub fn partner(&self) -> &PartnerId {
        &self.partner
    }

    /// Get the glare role for this match
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the current negotiation state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Get the connection engine for advanced usage
    pub fn engine(&self) -> &dyn ConnectionEngine {
        self.engine.as_ref()
    }

    /// Round token of the last local offer
    pub fn round(&self) -> u32 {
        self.round
    }

    /// When the outstanding local offer expires
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.map(|o| o.deadline)
    }

    /// Attach local tracks; the handle stays owned by the caller
    pub async fn attach_media(&self, media: &LocalMediaHandle) -> Result<(), EngineError> {
        self.engine.attach_tracks(media).await
    }

    /// Send the initial offer. Only valid in `Idle`.
    pub async fn start_offer(&mut self) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                op: "start an offer",
                state: self.state,
            });
        }
        self.send_offer(Channel::Call).await
    }

    /// Answer an initial offer from the partner. Only valid in `Idle`.
    ///
    /// # Arguments
    /// * `offer` - The partner's offer
    /// * `round` - Round token carried by the offer, if any
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescriptor,
        round: Option<u32>,
    ) -> Result<Outcome, NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                op: "accept an offer",
                state: self.state,
            });
        }
        if self.is_stale_offer(round) {
            return Ok(Outcome::Discarded);
        }
        self.answer(Channel::Call, offer, round).await?;
        Ok(Outcome::Applied)
    }

    /// Handle an offer from the partner on either channel
    pub async fn on_remote_offer(
        &mut self,
        channel: Channel,
        offer: SessionDescriptor,
        round: Option<u32>,
    ) -> Result<Outcome, NegotiationError> {
        if self.is_stale_offer(round) {
            return Ok(Outcome::Discarded);
        }

        match self.state {
            NegotiationState::Closed | NegotiationState::OfferReceived => {
                log::debug!(
                    "Discarding offer from {} while {}",
                    self.partner,
                    self.state
                );
                return Ok(Outcome::Discarded);
            }
            NegotiationState::OfferSent | NegotiationState::Renegotiating => {
                if !self.role.is_polite() {
                    log::debug!(
                        "Glare with {}: keeping our offer (round {})",
                        self.partner,
                        self.round
                    );
                    self.record_remote_round(round);
                    return Ok(Outcome::GlareIgnored);
                }

                log::debug!(
                    "Glare with {}: rolling back our offer (round {})",
                    self.partner,
                    self.round
                );
                if let Some(ours) = self.outstanding.take() {
                    if ours.channel == Channel::Renegotiation {
                        self.renegotiate_when_stable = true;
                    }
                }
                if let Err(e) = self.engine.rollback().await {
                    self.abort_round().await;
                    return Err(NegotiationError::DescriptionApplyFailed(e));
                }
                self.state = self.resting_state();
            }
            NegotiationState::Idle | NegotiationState::Stable => {}
        }

        self.answer(channel, offer, round).await?;
        self.resume_deferred().await?;
        Ok(Outcome::Applied)
    }

    /// Handle an answer from the partner
    pub async fn on_remote_answer(
        &mut self,
        channel: Channel,
        answer: SessionDescriptor,
        round: Option<u32>,
    ) -> Result<Outcome, NegotiationError> {
        let outstanding = match self.outstanding {
            Some(o) if o.channel == channel && round.map_or(true, |r| r == o.round) => o,
            _ => {
                log::debug!(
                    "Discarding {:?} answer from {} for round {:?} (outstanding: {:?})",
                    channel,
                    self.partner,
                    round,
                    self.outstanding.map(|o| o.round)
                );
                return Ok(Outcome::Discarded);
            }
        };

        if let Err(e) = self.engine.set_remote_description(answer).await {
            self.abort_round().await;
            return Err(NegotiationError::DescriptionApplyFailed(e));
        }

        self.outstanding = None;
        self.established = true;
        self.state = NegotiationState::Stable;
        log::info!(
            "Negotiation with {} stable (round {})",
            self.partner,
            outstanding.round
        );

        self.resume_deferred().await?;
        Ok(Outcome::Applied)
    }

    /// The engine wants a new offer.
    ///
    /// Starts a renegotiation when Stable, remembers the request while a
    /// round is in flight, and ignores it before the call is up.
    pub async fn on_description_needed(&mut self) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::Stable => self.send_offer(Channel::Renegotiation).await,
            NegotiationState::Renegotiating | NegotiationState::OfferReceived => {
                self.renegotiate_when_stable = true;
                Ok(())
            }
            NegotiationState::Idle | NegotiationState::OfferSent | NegotiationState::Closed => {
                log::debug!("Ignoring description-needed while {}", self.state);
                Ok(())
            }
        }
    }

    /// Roll back the outstanding offer if its deadline passed
    pub async fn check_timeout(&mut self, now: Instant) -> Result<(), NegotiationError> {
        match self.outstanding {
            Some(o) if o.deadline <= now => {
                log::warn!(
                    "Offer round {} to {} timed out after {:?}",
                    o.round,
                    self.partner,
                    self.offer_timeout
                );
                self.abort_round().await;
                Err(NegotiationError::OfferTimedOut { round: o.round })
            }
            _ => Ok(()),
        }
    }

    /// Release the engine. Idempotent.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.outstanding = None;
        self.renegotiate_when_stable = false;
        self.state = NegotiationState::Closed;
        if let Err(e) = self.engine.close().await {
            log::warn!("Failed to close engine for {}: {}", self.partner, e);
        }
        log::info!("Negotiation with {} closed", self.partner);
    }

    async fn send_offer(&mut self, channel: Channel) -> Result<(), NegotiationError> {
        let offer = self
            .engine
            .create_offer()
            .await
            .map_err(NegotiationError::DescriptionCreateFailed)?;
        let offer = self
            .engine
            .set_local_description(offer)
            .await
            .map_err(NegotiationError::DescriptionApplyFailed)?;

        self.round += 1;
        self.outstanding = Some(OutstandingOffer {
            round: self.round,
            channel,
            deadline: Instant::now() + self.offer_timeout,
        });
        self.state = match channel {
            Channel::Call => NegotiationState::OfferSent,
            Channel::Renegotiation => NegotiationState::Renegotiating,
        };

        let to = self.partner.clone();
        let round = self.round;
        let signal = match channel {
            Channel::Call => OutboundSignal::CallOffer { to, offer, round },
            Channel::Renegotiation => OutboundSignal::NegoOffer { to, offer, round },
        };
        if let Err(e) = self.transport.send(signal) {
            self.abort_round().await;
            return Err(e.into());
        }

        log::info!(
            "Sent {} to {} (round {})",
            match channel {
                Channel::Call => "offer",
                Channel::Renegotiation => "renegotiation offer",
            },
            self.partner,
            round
        );
        Ok(())
    }

    async fn answer(
        &mut self,
        channel: Channel,
        offer: SessionDescriptor,
        round: Option<u32>,
    ) -> Result<(), NegotiationError> {
        self.record_remote_round(round);
        let resting = self.resting_state();
        self.state = NegotiationState::OfferReceived;

        let answer = match self.engine.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.abandon_answer(resting).await;
                return Err(NegotiationError::from_answer_error(e));
            }
        };
        let answer = match self.engine.set_local_description(answer).await {
            Ok(applied) => applied,
            Err(e) => {
                self.abandon_answer(resting).await;
                return Err(NegotiationError::DescriptionApplyFailed(e));
            }
        };

        let to = self.partner.clone();
        let round = round.or(self.last_remote_round).unwrap_or(0);
        let signal = match channel {
            Channel::Call => OutboundSignal::CallAnswer { to, answer, round },
            Channel::Renegotiation => OutboundSignal::NegoAnswer { to, answer, round },
        };
        if let Err(e) = self.transport.send(signal) {
            self.state = resting;
            return Err(e.into());
        }

        self.established = true;
        self.state = NegotiationState::Stable;
        log::info!(
            "Answered {} (round {}), negotiation stable",
            self.partner,
            round
        );
        Ok(())
    }

    /// Start the renegotiation that was asked for while busy
    async fn resume_deferred(&mut self) -> Result<(), NegotiationError> {
        if self.state == NegotiationState::Stable && self.renegotiate_when_stable {
            self.renegotiate_when_stable = false;
            log::debug!("Resuming deferred renegotiation with {}", self.partner);
            self.send_offer(Channel::Renegotiation).await?;
        }
        Ok(())
    }

    /// Drop a remote offer we could not answer so the engine can offer again
    async fn abandon_answer(&mut self, resting: NegotiationState) {
        if let Err(e) = self.engine.rollback_remote().await {
            log::debug!("No remote offer to roll back for {}: {}", self.partner, e);
        }
        self.state = resting;
    }

    /// Give up the current round without retrying
    async fn abort_round(&mut self) {
        if self.outstanding.take().is_some() {
            if let Err(e) = self.engine.rollback().await {
                log::warn!("Rollback after aborted round failed: {}", e);
            }
        }
        self.renegotiate_when_stable = false;
        self.state = self.resting_state();
    }

    fn resting_state(&self) -> NegotiationState {
        if self.established {
            NegotiationState::Stable
        } else {
            NegotiationState::Idle
        }
    }

    fn is_stale_offer(&self, round: Option<u32>) -> bool {
        match (round, self.last_remote_round) {
            (Some(round), Some(last)) if round <= last => {
                log::debug!(
                    "Discarding stale offer from {} (round {} <= {})",
                    self.partner,
                    round,
                    last
                );
                true
            }
            _ => false,
        }
    }

    fn record_remote_round(&mut self, round: Option<u32>) {
        if let Some(round) = round {
            self.last_remote_round = Some(self.last_remote_round.map_or(round, |l| l.max(round)));
        }
    }
}

impl fmt::Debug for NegotiationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationController")
            .field("partner", &self.partner)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("round", &self.round)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}
