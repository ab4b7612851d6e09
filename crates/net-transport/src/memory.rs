//! In-process peer channel
//!
//! Offer and answer carry a rendezvous id inside one [`MemoryConnector`];
//! frames travel over `tokio::sync::mpsc`, so ordering matches the real
//! transport. Clones of a connector share the rendezvous table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    ChannelEvent, EVENT_BUFFER, Negotiated, PeerChannel, PeerConnector, TransportError,
    TransportResult,
};

/// Rewrites frames leaving the offering side (fault injection)
pub type FrameFilter = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Connector for channels that never leave the process
#[derive(Clone, Default)]
pub struct MemoryConnector {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Arc<MemoryChannel>>>,
    candidates_applied: AtomicUsize,
    filter: Mutex<Option<FrameFilter>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `filter` to every frame sent by offering channels
    pub fn with_frame_filter(self, filter: FrameFilter) -> Self {
        *self.hub.filter.lock() = Some(filter);
        self
    }

    /// Candidates applied through any channel of this connector
    pub fn candidates_applied(&self) -> usize {
        self.hub.candidates_applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_offer(&self) -> TransportResult<Negotiated> {
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let channel = Arc::new(MemoryChannel {
            id,
            hub: self.hub.clone(),
            link: Arc::new(LinkState::default()),
            events: events_tx,
            peer: Mutex::new(None),
            filter: self.hub.filter.lock().clone(),
        });
        channel.emit_candidate("offer");
        self.hub.pending.lock().insert(id, channel.clone());

        debug!("Memory offer {} created", id);

        Ok(Negotiated {
            channel,
            description: json!({ "id": id }),
            events: events_rx,
        })
    }

    async fn accept_offer(&self, offer: Value) -> TransportResult<Negotiated> {
        let id = offer
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| TransportError::Negotiation("offer without id".to_string()))?;

        let offerer = self
            .hub
            .pending
            .lock()
            .remove(&id)
            .ok_or_else(|| TransportError::Negotiation(format!("unknown offer {}", id)))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        *offerer.peer.lock() = Some(events_tx.clone());

        let channel = Arc::new(MemoryChannel {
            id,
            hub: self.hub.clone(),
            link: offerer.link.clone(),
            events: events_tx,
            peer: Mutex::new(Some(offerer.events.clone())),
            filter: None,
        });
        channel.emit_candidate("answer");

        debug!("Memory offer {} accepted", id);

        Ok(Negotiated {
            channel,
            description: json!({ "id": id }),
            events: events_rx,
        })
    }
}

#[derive(Default)]
struct LinkState {
    open: AtomicBool,
    closed: AtomicBool,
}

struct MemoryChannel {
    id: u64,
    hub: Arc<Hub>,
    link: Arc<LinkState>,
    events: mpsc::Sender<ChannelEvent>,
    peer: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
    filter: Option<FrameFilter>,
}

impl MemoryChannel {
    fn emit_candidate(&self, side: &str) {
        let _ = self
            .events
            .try_send(ChannelEvent::LocalCandidate(json!({ "memory": self.id, "side": side })));
    }

    fn peer(&self) -> TransportResult<mpsc::Sender<ChannelEvent>> {
        self.peer.lock().clone().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    async fn apply_answer(&self, answer: Value) -> TransportResult<()> {
        if answer.get("id").and_then(Value::as_u64) != Some(self.id) {
            return Err(TransportError::Negotiation("answer for another offer".to_string()));
        }

        let peer = self.peer()?;
        self.link.open.store(true, Ordering::SeqCst);

        let _ = self.events.send(ChannelEvent::Open).await;
        let _ = peer.send(ChannelEvent::Open).await;
        Ok(())
    }

    async fn add_candidate(&self, candidate: Value) -> TransportResult<()> {
        if candidate.get("memory").is_none() {
            return Err(TransportError::Negotiation("foreign candidate".to_string()));
        }
        self.hub.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: String) -> TransportResult<()> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.link.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let frame = match &self.filter {
            Some(filter) => filter(frame),
            None => frame,
        };

        self.peer()?
            .send(ChannelEvent::Message(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Frames are queued at the peer as soon as `send` returns
    async fn flush(&self) -> TransportResult<()> {
        if !self.link.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hub.pending.lock().remove(&self.id);
        if let Some(peer) = self.peer.lock().take() {
            let _ = peer.try_send(ChannelEvent::Closed);
        }
    }
}
