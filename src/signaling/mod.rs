//! Signaling transport to the matchmaking relay.
//!
//! A [`SignalingTransport`] sends [`OutboundSignal`]s and fans inbound
//! [`RelayEvent`]s out to [`Subscription`]s. A subscription unregisters itself
//! when dropped, so a session that goes away stops receiving events without
//! any explicit cleanup.

pub mod loopback;
pub mod messages;
pub mod ws_transport;

pub use loopback::{LoopbackRelay, LoopbackTransport};
pub use messages::{OutboundSignal, PartnerId, RelayEvent};
pub use ws_transport::WsSignalingTransport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a signaling transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Relay connection closed: {0}")]
    Closed(String),

    #[error("Failed to encode signaling message: {0}")]
    Encode(String),
}

/// Bidirectional named-event channel to the relay
pub trait SignalingTransport: Send + Sync {
    /// Queue a message for the relay. Does not wait for delivery.
    fn send(&self, signal: OutboundSignal) -> Result<(), TransportError>;

    /// Register for inbound events. Fails once the transport is closed.
    fn subscribe(&self) -> Result<Subscription, TransportError>;
}

/// Unique subscriber ID
type SubscriberId = u64;

/// Registry of live subscriptions, shared by a transport and its subscriptions
pub struct Subscribers {
    senders: Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<RelayEvent>>>,
    next_id: AtomicU64,
    closed: Mutex<Option<String>>,
}

impl Subscribers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: Mutex::new(None),
        })
    }

    /// Register a new subscription
    pub fn subscribe(self: &Arc<Self>) -> Result<Subscription, TransportError> {
        if let Some(reason) = self.closed.lock().as_ref() {
            return Err(TransportError::Closed(reason.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(id, tx);

        Ok(Subscription {
            id,
            rx,
            registry: Arc::downgrade(self),
        })
    }

    /// Deliver an event to every live subscription
    pub fn publish(&self, event: RelayEvent) {
        let mut senders = self.senders.lock();
        // Receivers that went away without unregistering are pruned here
        senders.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// End every subscription and refuse new ones
    pub fn close(&self, reason: &str) {
        *self.closed.lock() = Some(reason.to_string());
        self.senders.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: SubscriberId) {
        self.senders.lock().remove(&id);
    }
}

/// Scoped stream of inbound relay events.
///
/// Dropping the subscription unregisters it from the transport.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<RelayEvent>,
    registry: std::sync::Weak<Subscribers>,
}

impl Subscription {
    /// Next event, or `None` once the transport closed
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
