//! WebSocket relay client.
//!
//! Flow:
//! 1. Connect to the relay over WebSocket
//! 2. A writer task drains an unbounded channel into the socket
//! 3. A reader task parses text frames into [`RelayEvent`]s and publishes them
//! 4. When the socket closes every subscription ends

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::messages::{OutboundSignal, RelayEvent};
use super::{SignalingTransport, Subscribers, Subscription, TransportError};

/// Relay connection over a WebSocket
pub struct WsSignalingTransport {
    url: String,
    /// Outgoing frames, drained by the writer task
    ws_sender: mpsc::UnboundedSender<Message>,
    subscribers: Arc<Subscribers>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WsSignalingTransport {
    /// Connect to the relay.
    ///
    /// # Arguments
    /// * `url` - Relay URL (ws:// or wss://)
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", url, e)))?;

        log::info!("Connected to relay: {}", url);

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let subscribers = Subscribers::new();
        let publish_to = subscribers.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_stream.next().await {
                    Some(Ok(Message::Text(text))) => match RelayEvent::from_json(&text) {
                        Ok(Some(event)) => {
                            log::debug!("Relay event: {}", event.name());
                            publish_to.publish(event);
                        }
                        Ok(None) => log::debug!("Ignoring unknown relay event: {}", text),
                        Err(e) => log::warn!("Failed to parse relay message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) => break "relay closed the connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("WebSocket error: {}", e),
                    None => break "WebSocket stream ended".to_string(),
                }
            };
            log::info!("Relay connection ended: {}", reason);
            publish_to.close(&reason);
        });

        Ok(Self {
            url: url.to_string(),
            ws_sender: tx,
            subscribers,
            writer,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the socket is still open
    pub fn is_connected(&self) -> bool {
        !self.subscribers.is_closed()
    }

    /// Send a close frame; subscriptions end once the relay confirms
    pub fn close(&self) {
        let _ = self.ws_sender.send(Message::Close(None));
    }
}

impl SignalingTransport for WsSignalingTransport {
    fn send(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        if self.subscribers.is_closed() {
            return Err(TransportError::Closed(self.url.clone()));
        }
        let json = signal
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        log::debug!("Sending {} to {}", signal.name(), signal.to());
        self.ws_sender
            .send(Message::Text(json))
            .map_err(|_| TransportError::Closed(self.url.clone()))
    }

    fn subscribe(&self) -> Result<Subscription, TransportError> {
        self.subscribers.subscribe()
    }
}

impl Drop for WsSignalingTransport {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
        self.subscribers.close("transport dropped");
    }
}
