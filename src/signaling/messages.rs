//! Relay wire format.
//!
//! Every frame is a named event with a JSON payload:
//! `{"event": "call:offer", "data": {"to": "B", "offer": {...}, "round": 1}}`.
//! Inbound parsing also understands the event names used by the original
//! browser relay (`incomming:call`, `call:accepted`, `peer:nego:needed`,
//! `peer:nego:final`).

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::sdp::SessionDescriptor;

/// Event names on the wire
pub mod events {
    pub const MATCH_FOUND: &str = "matchFound";
    pub const WAITING: &str = "waiting";
    pub const PARTNER_DISCONNECTED: &str = "partnerDisconnected";
    pub const CALL_OFFER: &str = "call:offer";
    pub const INCOMING_CALL: &str = "incoming:call";
    pub const CALL_ANSWER: &str = "call:answer";
    pub const NEGO_OFFER: &str = "nego:offer";
    pub const NEGO_ANSWER: &str = "nego:answer";

    pub(super) const LEGACY_INCOMING_CALL: &str = "incomming:call";
    pub(super) const LEGACY_CALL_ACCEPTED: &str = "call:accepted";
    pub(super) const LEGACY_NEGO_NEEDED: &str = "peer:nego:needed";
    pub(super) const LEGACY_NEGO_FINAL: &str = "peer:nego:final";
}

/// Identifier of the matched remote party, as assigned by the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartnerId(String);

impl PartnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PartnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Events delivered by the relay to this client
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The relay paired us with a partner. `self_id` and `polite` are
    /// optional hints for the glare tie-break.
    MatchFound {
        partner_id: PartnerId,
        self_id: Option<String>,
        polite: Option<bool>,
    },
    /// No partner available
    Waiting { message: Option<String> },
    /// The active partner left
    PartnerDisconnected { message: Option<String> },
    /// Initial offer from the partner. A missing `round` applies to the
    /// current round.
    IncomingCall {
        from: PartnerId,
        offer: SessionDescriptor,
        round: Option<u32>,
    },
    CallAnswer {
        from: PartnerId,
        answer: SessionDescriptor,
        round: Option<u32>,
    },
    NegoOffer {
        from: PartnerId,
        offer: SessionDescriptor,
        round: Option<u32>,
    },
    NegoAnswer {
        from: PartnerId,
        answer: SessionDescriptor,
        round: Option<u32>,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchFoundData {
    #[serde(alias = "id")]
    partner_id: PartnerId,
    #[serde(default)]
    self_id: Option<String>,
    #[serde(default)]
    polite: Option<bool>,
}

#[derive(Deserialize, Default)]
struct NoticeData {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct OfferData {
    from: PartnerId,
    offer: SessionDescriptor,
    #[serde(default)]
    round: Option<u32>,
}

#[derive(Deserialize)]
struct AnswerData {
    from: PartnerId,
    #[serde(alias = "ans")]
    answer: SessionDescriptor,
    #[serde(default)]
    round: Option<u32>,
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data)
}

impl RelayEvent {
    /// Parse one relay frame.
    ///
    /// Returns `Ok(None)` for well-formed frames carrying an event this
    /// client does not handle.
    pub fn from_json(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let Envelope { event, data } = serde_json::from_str(text)?;

        let parsed = match event.as_str() {
            events::MATCH_FOUND => {
                let d: MatchFoundData = payload(data)?;
                RelayEvent::MatchFound {
                    partner_id: d.partner_id,
                    self_id: d.self_id,
                    polite: d.polite,
                }
            }
            events::WAITING => {
                let d: NoticeData = payload(data)?;
                RelayEvent::Waiting { message: d.message }
            }
            events::PARTNER_DISCONNECTED => {
                let d: NoticeData = payload(data)?;
                RelayEvent::PartnerDisconnected { message: d.message }
            }
            events::INCOMING_CALL | events::LEGACY_INCOMING_CALL => {
                let d: OfferData = payload(data)?;
                RelayEvent::IncomingCall {
                    from: d.from,
                    offer: d.offer,
                    round: d.round,
                }
            }
            events::CALL_ANSWER | events::LEGACY_CALL_ACCEPTED => {
                let d: AnswerData = payload(data)?;
                RelayEvent::CallAnswer {
                    from: d.from,
                    answer: d.answer,
                    round: d.round,
                }
            }
            events::NEGO_OFFER | events::LEGACY_NEGO_NEEDED => {
                let d: OfferData = payload(data)?;
                RelayEvent::NegoOffer {
                    from: d.from,
                    offer: d.offer,
                    round: d.round,
                }
            }
            events::NEGO_ANSWER | events::LEGACY_NEGO_FINAL => {
                let d: AnswerData = payload(data)?;
                RelayEvent::NegoAnswer {
                    from: d.from,
                    answer: d.answer,
                    round: d.round,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(parsed))
    }

    /// Encode the frame the way a relay would send it
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let frame = match self {
            RelayEvent::MatchFound {
                partner_id,
                self_id,
                polite,
            } => json!({
                "event": events::MATCH_FOUND,
                "data": { "partnerId": partner_id, "selfId": self_id, "polite": polite },
            }),
            RelayEvent::Waiting { message } => json!({
                "event": events::WAITING,
                "data": { "message": message },
            }),
            RelayEvent::PartnerDisconnected { message } => json!({
                "event": events::PARTNER_DISCONNECTED,
                "data": { "message": message },
            }),
            RelayEvent::IncomingCall { from, offer, round } => json!({
                "event": events::INCOMING_CALL,
                "data": { "from": from, "offer": offer, "round": round },
            }),
            RelayEvent::CallAnswer {
                from,
                answer,
                round,
            } => json!({
                "event": events::CALL_ANSWER,
                "data": { "from": from, "answer": answer, "round": round },
            }),
            RelayEvent::NegoOffer { from, offer, round } => json!({
                "event": events::NEGO_OFFER,
                "data": { "from": from, "offer": offer, "round": round },
            }),
            RelayEvent::NegoAnswer {
                from,
                answer,
                round,
            } => json!({
                "event": events::NEGO_ANSWER,
                "data": { "from": from, "answer": answer, "round": round },
            }),
        };
        serde_json::to_string(&frame)
    }

    /// The sender of a signaling event; `None` for relay notices
    pub fn sender(&self) -> Option<&PartnerId> {
        match self {
            RelayEvent::IncomingCall { from, .. }
            | RelayEvent::CallAnswer { from, .. }
            | RelayEvent::NegoOffer { from, .. }
            | RelayEvent::NegoAnswer { from, .. } => Some(from),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::MatchFound { .. } => events::MATCH_FOUND,
            RelayEvent::Waiting { .. } => events::WAITING,
            RelayEvent::PartnerDisconnected { .. } => events::PARTNER_DISCONNECTED,
            RelayEvent::IncomingCall { .. } => events::INCOMING_CALL,
            RelayEvent::CallAnswer { .. } => events::CALL_ANSWER,
            RelayEvent::NegoOffer { .. } => events::NEGO_OFFER,
            RelayEvent::NegoAnswer { .. } => events::NEGO_ANSWER,
        }
    }
}

/// Signaling messages this client sends to its partner via the relay
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    CallOffer {
        to: PartnerId,
        offer: SessionDescriptor,
        round: u32,
    },
    CallAnswer {
        to: PartnerId,
        answer: SessionDescriptor,
        round: u32,
    },
    NegoOffer {
        to: PartnerId,
        offer: SessionDescriptor,
        round: u32,
    },
    NegoAnswer {
        to: PartnerId,
        answer: SessionDescriptor,
        round: u32,
    },
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundSignal::CallOffer { .. } => events::CALL_OFFER,
            OutboundSignal::CallAnswer { .. } => events::CALL_ANSWER,
            OutboundSignal::NegoOffer { .. } => events::NEGO_OFFER,
            OutboundSignal::NegoAnswer { .. } => events::NEGO_ANSWER,
        }
    }

    /// Recipient
    pub fn to(&self) -> &PartnerId {
        match self {
            OutboundSignal::CallOffer { to, .. }
            | OutboundSignal::CallAnswer { to, .. }
            | OutboundSignal::NegoOffer { to, .. }
            | OutboundSignal::NegoAnswer { to, .. } => to,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            OutboundSignal::CallOffer { round, .. }
            | OutboundSignal::CallAnswer { round, .. }
            | OutboundSignal::NegoOffer { round, .. }
            | OutboundSignal::NegoAnswer { round, .. } => *round,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            OutboundSignal::CallOffer { to, offer, round }
            | OutboundSignal::NegoOffer { to, offer, round } => {
                json!({ "to": to, "offer": offer, "round": round })
            }
            OutboundSignal::CallAnswer { to, answer, round }
            | OutboundSignal::NegoAnswer { to, answer, round } => {
                json!({ "to": to, "answer": answer, "round": round })
            }
        };
        serde_json::to_string(&json!({ "event": self.name(), "data": data }))
    }

    /// The event the partner receives once the relay forwards this signal.
    /// `call:offer` arrives as `incoming:call`; the rest keep their name.
    pub fn relayed_from(self, from: PartnerId) -> RelayEvent {
        match self {
            OutboundSignal::CallOffer { offer, round, .. } => RelayEvent::IncomingCall {
                from,
                offer,
                round: Some(round),
            },
            OutboundSignal::CallAnswer { answer, round, .. } => RelayEvent::CallAnswer {
                from,
                answer,
                round: Some(round),
            },
            OutboundSignal::NegoOffer { offer, round, .. } => RelayEvent::NegoOffer {
                from,
                offer,
                round: Some(round),
            },
            OutboundSignal::NegoAnswer { answer, round, .. } => RelayEvent::NegoAnswer {
                from,
                answer,
                round: Some(round),
            },
        }
    }
}
