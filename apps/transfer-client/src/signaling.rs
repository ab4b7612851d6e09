//! Relay client
//!
//! Connects to the signaling relay over WebSocket and exposes it as a pair
//! of typed queues. Every outgoing event carries its session code.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use shared_protocol::{ClientEvent, ServerEvent};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::{ClientError, ClientResult};

/// Queue depth in each direction
const QUEUE_SIZE: usize = 100;

/// A live relay connection
pub struct RelayLink {
    pub handle: RelayHandle,
    /// Events from the relay; ends when the connection closes
    pub incoming: mpsc::Receiver<ServerEvent>,
}

/// Sending half of a relay connection; clones share the connection
#[derive(Clone)]
pub struct RelayHandle {
    outgoing: mpsc::Sender<ClientEvent>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl RelayHandle {
    pub fn new(outgoing: mpsc::Sender<ClientEvent>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            outgoing,
            shutdown: Arc::new(Mutex::new(Some(shutdown))),
        }
    }

    pub async fn send(&self, event: ClientEvent) -> ClientResult<()> {
        self.outgoing
            .send(event)
            .await
            .map_err(|_| ClientError::RelayClosed)
    }

    /// Queue without waiting; false if the queue is full or closed
    pub fn try_send(&self, event: ClientEvent) -> bool {
        self.outgoing.try_send(event).is_ok()
    }

    /// Flush queued events and close the connection
    pub fn disconnect(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
    }
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> ClientResult<RelayLink>;
}

/// [`RelayConnector`] for the WebSocket relay
pub struct WsRelayConnector {
    url: String,
}

impl WsRelayConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self) -> ClientResult<RelayLink> {
        info!("Connecting to relay: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Relay(e.to_string()))?;

        debug!("WebSocket connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Application -> relay
        let (send_tx, mut send_rx) = mpsc::channel::<ClientEvent>(QUEUE_SIZE);
        // Relay -> application
        let (recv_tx, recv_rx) = mpsc::channel::<ServerEvent>(QUEUE_SIZE);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Explicit disconnect, or every handle dropped
                    _ = &mut shutdown_rx => {
                        while let Ok(event) = send_rx.try_recv() {
                            if send_event(&mut ws_tx, &event).await.is_err() {
                                break;
                            }
                        }
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }

                    outgoing = send_rx.recv() => {
                        let Some(event) = outgoing else {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        };
                        if let Err(e) = send_event(&mut ws_tx, &event).await {
                            error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }

                    incoming = ws_rx.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        if recv_tx.send(event).await.is_err() {
                                            debug!("Relay receiver dropped");
                                            break;
                                        }
                                    }
                                    Err(e) => warn!("Failed to parse relay event: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Relay closed connection");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("WebSocket receive error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Relay loop ended");
        });

        Ok(RelayLink {
            handle: RelayHandle::new(send_tx, shutdown_tx),
            incoming: recv_rx,
        })
    }
}

async fn send_event<S>(ws_tx: &mut S, event: &ClientEvent) -> ClientResult<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(event).map_err(shared_protocol::ProtocolError::from)?;
    ws_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| ClientError::Relay(format!("session {}: {e}", event.code())))
}
