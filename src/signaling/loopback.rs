//! In-process matchmaking relay.
//!
//! Pairs clients in join order and forwards signaling only between paired
//! clients, the way the hosted relay does. Used for tests and the loopback
//! demo where both parties live in the same process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::messages::{OutboundSignal, PartnerId, RelayEvent};
use super::{SignalingTransport, Subscribers, Subscription, TransportError};

#[derive(Default)]
struct RelayState {
    /// Connected clients and their inbound fan-out
    clients: HashMap<PartnerId, Arc<Subscribers>>,
    /// Client waiting for a partner
    waiting: Option<PartnerId>,
    /// Active pairs, stored in both directions
    pairs: HashMap<PartnerId, PartnerId>,
    /// Number of signals dropped because sender and recipient were not paired
    dropped: u64,
}

impl RelayState {
    fn deliver(&self, to: &PartnerId, event: RelayEvent) {
        if let Some(subscribers) = self.clients.get(to) {
            subscribers.publish(event);
        }
    }

    /// Break the pair `id` belongs to and tell the other side
    fn unpair(&mut self, id: &PartnerId) {
        if let Some(partner) = self.pairs.remove(id) {
            self.pairs.remove(&partner);
            log::info!("[LoopbackRelay] {} left {}", id, partner);
            self.deliver(
                &partner,
                RelayEvent::PartnerDisconnected {
                    message: Some(format!("{} disconnected", id)),
                },
            );
        }
        if self.waiting.as_ref() == Some(id) {
            self.waiting = None;
        }
    }
}

/// Matchmaking relay shared by every client of one process
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
    /// Send an explicit `polite` role with `matchFound`
    assign_roles: bool,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce roles with every match: the client that was waiting is
    /// impolite, the one that joined second is polite.
    pub fn with_assigned_roles() -> Self {
        Self {
            assign_roles: true,
            ..Self::default()
        }
    }

    /// Register a client. Reconnecting with the same id replaces the old
    /// connection.
    pub fn connect(&self, client_id: &str) -> LoopbackTransport {
        let id = PartnerId::from(client_id);
        let subscribers = Subscribers::new();

        let mut state = self.state.lock();
        if let Some(previous) = state.clients.insert(id.clone(), subscribers.clone()) {
            previous.close("replaced by a new connection");
            state.unpair(&id);
        }
        log::debug!("[LoopbackRelay] {} connected", id);

        LoopbackTransport {
            id,
            relay: self.clone(),
            subscribers,
        }
    }

    /// Ask for a partner. Pairs with the waiting client if there is one,
    /// otherwise the caller becomes the waiting client.
    pub fn join(&self, client_id: &str) {
        let id = PartnerId::from(client_id);
        let mut state = self.state.lock();
        if !state.clients.contains_key(&id) {
            log::warn!("[LoopbackRelay] join from unknown client {}", id);
            return;
        }
        state.unpair(&id);

        match state.waiting.take() {
            Some(other) if other != id => {
                state.pairs.insert(id.clone(), other.clone());
                state.pairs.insert(other.clone(), id.clone());
                log::info!("[LoopbackRelay] Matched {} with {}", other, id);

                let (other_polite, id_polite) = if self.assign_roles {
                    (Some(false), Some(true))
                } else {
                    (None, None)
                };
                state.deliver(
                    &other,
                    RelayEvent::MatchFound {
                        partner_id: id.clone(),
                        self_id: Some(other.to_string()),
                        polite: other_polite,
                    },
                );
                state.deliver(
                    &id,
                    RelayEvent::MatchFound {
                        partner_id: other.clone(),
                        self_id: Some(id.to_string()),
                        polite: id_polite,
                    },
                );
            }
            _ => {
                state.waiting = Some(id.clone());
                state.deliver(
                    &id,
                    RelayEvent::Waiting {
                        message: Some("Waiting for a partner".to_string()),
                    },
                );
            }
        }
    }

    /// Leave the current match (or the waiting slot) without disconnecting
    pub fn leave(&self, client_id: &str) {
        self.state.lock().unpair(&PartnerId::from(client_id));
    }

    /// Leave and drop the connection; the client's subscriptions end
    pub fn disconnect(&self, client_id: &str) {
        let id = PartnerId::from(client_id);
        let mut state = self.state.lock();
        state.unpair(&id);
        if let Some(subscribers) = state.clients.remove(&id) {
            subscribers.close("disconnected from relay");
        }
    }

    /// Deliver an arbitrary event to a client, bypassing pairing rules
    pub fn inject(&self, client_id: &str, event: RelayEvent) {
        self.state.lock().deliver(&PartnerId::from(client_id), event);
    }

    pub fn partner_of(&self, client_id: &str) -> Option<PartnerId> {
        self.state
            .lock()
            .pairs
            .get(&PartnerId::from(client_id))
            .cloned()
    }

    /// Signals dropped because the sender was not paired with the recipient
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }

    fn forward(&self, from: &PartnerId, signal: OutboundSignal) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(from) {
            return Err(TransportError::Closed(format!("{} is not connected", from)));
        }

        match state.pairs.get(from) {
            Some(partner) if partner == signal.to() => {
                let to = partner.clone();
                state.deliver(&to, signal.relayed_from(from.clone()));
            }
            _ => {
                log::debug!(
                    "[LoopbackRelay] Dropping {} from {} to unpaired {}",
                    signal.name(),
                    from,
                    signal.to()
                );
                state.dropped += 1;
            }
        }
        Ok(())
    }
}

/// One client's connection to a [`LoopbackRelay`]
pub struct LoopbackTransport {
    id: PartnerId,
    relay: LoopbackRelay,
    subscribers: Arc<Subscribers>,
}

impl LoopbackTransport {
    /// The id this client is known by on the relay
    pub fn id(&self) -> &PartnerId {
        &self.id
    }

    pub fn relay(&self) -> &LoopbackRelay {
        &self.relay
    }

    /// Ask the relay for a partner
    pub fn join(&self) {
        self.relay.join(self.id.as_str());
    }

    pub fn leave(&self) {
        self.relay.leave(self.id.as_str());
    }
}

impl SignalingTransport for LoopbackTransport {
    fn send(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        self.relay.forward(&self.id, signal)
    }

    fn subscribe(&self) -> Result<Subscription, TransportError> {
        self.subscribers.subscribe()
    }
}
