//! Peer channel abstraction
//!
//! The offering side creates a channel together with an offer; the answering
//! side builds its channel from that offer and returns an answer. Both sides
//! then exchange candidates (in any order relative to offer/answer) until the
//! channel reports [`ChannelEvent::Open`]. From there the channel carries
//! ordered, reliable text frames.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::TransportResult;

/// Event emitted by a peer channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A local candidate the peer needs to learn about
    LocalCandidate(Value),
    /// The channel can carry frames
    Open,
    /// A frame from the peer, in send order
    Message(String),
    /// The peer closed the channel
    Closed,
    /// The channel failed
    Error(String),
}

/// A channel plus the description to relay and its event stream
pub struct Negotiated {
    pub channel: Arc<dyn PeerChannel>,
    /// Offer or answer, opaque to everything but the connector
    pub description: Value,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Creates peer channels
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Offering side: a new channel and its offer
    async fn create_offer(&self) -> TransportResult<Negotiated>;

    /// Answering side: a channel built from the peer's offer, plus the answer
    async fn accept_offer(&self, offer: Value) -> TransportResult<Negotiated>;
}

/// An ordered, reliable point-to-point message channel
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Apply the answer relayed back to the offering side
    async fn apply_answer(&self, answer: Value) -> TransportResult<()>;

    /// Apply a candidate relayed from the peer
    async fn add_candidate(&self, candidate: Value) -> TransportResult<()>;

    /// Send one frame
    async fn send(&self, frame: String) -> TransportResult<()>;

    /// Wait until every frame sent so far has been accepted by the peer
    async fn flush(&self) -> TransportResult<()>;

    /// Close immediately, dropping anything in flight
    fn close(&self);
}
