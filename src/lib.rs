//! peer-call: one-to-one WebRTC calls between partners paired by a relay.
//!
//! A matchmaking relay pairs two clients and forwards their signaling. This
//! crate runs the client side: it tracks the match, acquires local media,
//! negotiates offers and answers over the relay and resolves glare when both
//! sides offer at once.
//!
//! ## Features
//!
//! - **Match lifecycle**: `matchFound` / `waiting` / `partnerDisconnected`
//! - **Offer/answer negotiation** with renegotiation and round tokens
//! - **Glare resolution**: polite side rolls back, impolite side keeps its offer
//! - **Offer timeout**: unanswered offers are rolled back
//! - **Send streams**: add local media to a running call
//! - **Transports**: WebSocket relay client and an in-process relay
//! - **webrtc-rs engine** with ICE candidates embedded in the descriptions
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use peer_call::{CallConfig, RtcEngineFactory, SessionController, SyntheticMediaSource,
//!                 WsSignalingTransport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CallConfig::from_env()?;
//! let transport = Arc::new(WsSignalingTransport::connect(&config.relay_url).await?);
//! let engines = Arc::new(RtcEngineFactory::new(config.ice_servers.clone())?);
//! let media = Arc::new(SyntheticMediaSource::new(&config.client_id));
//!
//! let (session, mut events) = SessionController::new(config, transport, media, engines)?;
//! let handle = session.handle();
//! tokio::spawn(session.run());
//!
//! while let Some(event) = events.recv().await {
//!     if let peer_call::SessionEvent::Matched { .. } = event {
//!         handle.initiate_call()?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod sdp;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use config::{CallConfig, ConfigError};
pub use ice::{google_stun_servers, IceServerConfig};
pub use media::{
    LocalMediaHandle, MediaConstraints, MediaError, MediaKind, MediaSource, RemoteMediaHandle,
    SyntheticMediaSource,
};
pub use negotiation::{NegotiationController, NegotiationError, NegotiationState, Role};
pub use peer::{ConnectionEngine, EngineError, EngineFactory, RtcConnectionEngine, RtcEngineFactory};
pub use sdp::{SdpKind, SessionDescriptor};
pub use session::{CallError, MatchState, SessionController, SessionEvent, SessionHandle};
pub use signaling::{
    LoopbackRelay, LoopbackTransport, OutboundSignal, PartnerId, RelayEvent, SignalingTransport,
    Subscription, TransportError, WsSignalingTransport,
};
