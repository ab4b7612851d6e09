//! Signaling relay
//!
//! Routes join requests, public keys and negotiation payloads between the two
//! participants of a session. Keys and payloads are forwarded untouched; the
//! only session data read here is the file metadata announced on readiness.

use std::sync::Arc;

use dashmap::DashMap;
use shared_protocol::{ClientEvent, ParticipantId, ServerEvent, SessionCode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{JoinOutcome, RegistryError, SessionRegistry};

/// Outgoing queue depth per participant
const OUTBOX_SIZE: usize = 100;

pub struct Relay {
    registry: Arc<SessionRegistry>,
    /// Connected participants: id -> queue drained by the socket writer
    participants: DashMap<ParticipantId, mpsc::Sender<ServerEvent>>,
}

impl Relay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            participants: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Register a new connection
    pub fn connect(&self) -> (ParticipantId, mpsc::Receiver<ServerEvent>) {
        let id = ParticipantId::new();
        let (tx, rx) = mpsc::channel(OUTBOX_SIZE);
        self.participants.insert(id, tx);
        debug!("Participant connected: {}", id);
        (id, rx)
    }

    /// Forget a connection and tell whoever shared a session with it
    pub async fn disconnect(&self, participant: ParticipantId) {
        self.participants.remove(&participant);
        info!("Participant disconnected: {}", participant);

        for (code, other) in self.registry.release(participant) {
            if let Some(other) = other {
                debug!("Session {}: notifying {} of peer-left", code, other);
                self.send_to(other, ServerEvent::PeerLeft).await;
            }
        }
    }

    /// Queue an event for one participant
    pub async fn send_to(&self, participant: ParticipantId, event: ServerEvent) {
        let tx = self.participants.get(&participant).map(|entry| entry.value().clone());
        match tx {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!("Participant {} outbox closed", participant);
                }
            }
            None => debug!("Participant {} is gone, dropping event", participant),
        }
    }

    /// Handle one event from `from`
    pub async fn handle(&self, from: ParticipantId, event: ClientEvent) {
        match event {
            ClientEvent::JoinSession { code, role } => {
                info!("Join {} as {} by {}", code, role, from);

                match self.registry.join(code, role, from) {
                    Ok(JoinOutcome::Ready {
                        file_meta,
                        sender,
                        receiver,
                    }) => {
                        info!("Session {} ready", code);
                        let ready = ServerEvent::SessionReady { file_meta };
                        self.send_to(sender, ready.clone()).await;
                        self.send_to(receiver, ready).await;
                    }
                    Ok(JoinOutcome::Waiting) => debug!("Session {} waiting for peer", code),
                    Ok(JoinOutcome::AlreadyJoined) => {
                        debug!("Session {}: {} already joined as {}", code, from, role)
                    }
                    Ok(JoinOutcome::RoomFull) => {
                        warn!("Session {} is full, rejecting {}", code, from);
                        self.send_to(from, ServerEvent::RoomFull).await;
                    }
                    Err(e) => self.reject(from, code, e).await,
                }
            }

            ClientEvent::PublicKey { code, jwk } => {
                debug!("Public key on {} from {}", code, from);
                self.forward(from, code, ServerEvent::PublicKey { jwk }).await;
            }

            ClientEvent::Signal { code, payload } => {
                debug!("Signal on {} from {}", code, from);
                self.forward(from, code, ServerEvent::Signal { payload }).await;
            }

            ClientEvent::CleanupSession { code } => {
                self.registry.delete(code);
            }
        }
    }

    /// Forward to the other participant; membership is the authorization check
    async fn forward(&self, from: ParticipantId, code: SessionCode, event: ServerEvent) {
        match self.registry.counterpart(code, from) {
            Ok(Some(peer)) => self.send_to(peer, event).await,
            Ok(None) => debug!("Session {}: no peer yet, dropping", code),
            Err(e) => self.reject(from, code, e).await,
        }
    }

    async fn reject(&self, to: ParticipantId, code: SessionCode, error: RegistryError) {
        debug!("Session {}: {} for {}", code, error, to);
        let event = match error {
            RegistryError::NotFound => ServerEvent::SessionNotFound,
            RegistryError::Expired => ServerEvent::SessionExpired,
            other => ServerEvent::Error {
                message: other.to_string(),
            },
        };
        self.send_to(to, event).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use shared_protocol::{FileMeta, ParticipantRole};

    use super::*;

    fn relay() -> Relay {
        Relay::new(Arc::new(SessionRegistry::new(Duration::from_secs(180), 1 << 30)))
    }

    fn meta() -> FileMeta {
        FileMeta::new("photo.png", 1234, "image/png")
    }

    fn join(code: SessionCode, role: ParticipantRole) -> ClientEvent {
        ClientEvent::JoinSession { code, role }
    }

    /// Both sides joined; returns (sender, sender rx, receiver, receiver rx)
    async fn ready_room(
        relay: &Relay,
        code: SessionCode,
    ) -> (
        ParticipantId,
        mpsc::Receiver<ServerEvent>,
        ParticipantId,
        mpsc::Receiver<ServerEvent>,
    ) {
        let (sender, mut sender_rx) = relay.connect();
        let (receiver, mut receiver_rx) = relay.connect();
        relay.handle(sender, join(code, ParticipantRole::Sender)).await;
        relay.handle(receiver, join(code, ParticipantRole::Receiver)).await;

        let expected = ServerEvent::SessionReady { file_meta: meta() };
        assert_eq!(sender_rx.recv().await.unwrap(), expected);
        assert_eq!(receiver_rx.recv().await.unwrap(), expected);
        (sender, sender_rx, receiver, receiver_rx)
    }

    #[tokio::test]
    async fn test_ready_is_sent_once_to_each_side() {
        let relay = relay();
        let code = relay.registry().create(meta()).unwrap();
        let (sender, mut sender_rx, receiver, mut receiver_rx) = ready_room(&relay, code).await;

        // Duplicate joins do not re-announce
        relay.handle(sender, join(code, ParticipantRole::Sender)).await;
        relay.handle(receiver, join(code, ParticipantRole::Receiver)).await;
        assert!(sender_rx.try_recv().is_err());
        assert!(receiver_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_code_gets_not_found_only() {
        let relay = relay();
        let (id, mut rx) = relay.connect();
        let code = SessionCode::parse("654321").unwrap();

        relay.handle(id, join(code, ParticipantRole::Receiver)).await;
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::SessionNotFound);
        assert!(rx.try_recv().is_err());
        assert!(relay.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_code_gets_expired() {
        let relay = relay();
        let code = relay.registry().create(meta()).unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;

        let (id, mut rx) = relay.connect();
        relay.handle(id, join(code, ParticipantRole::Receiver)).await;
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::SessionExpired);
    }

    #[tokio::test]
    async fn test_third_join_gets_room_full() {
        let relay = relay();
        let code = relay.registry().create(meta()).unwrap();
        let (_, _sender_rx, _, _receiver_rx) = ready_room(&relay, code).await;

        let (intruder, mut rx) = relay.connect();
        relay.handle(intruder, join(code, ParticipantRole::Receiver)).await;
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::RoomFull);
    }

    #[tokio::test]
    async fn test_keys_and_signals_are_forwarded_verbatim() {
        let relay = relay();
        let code = relay.registry().create(meta()).unwrap();
        let (sender, mut sender_rx, receiver, mut receiver_rx) = ready_room(&relay, code).await;

        let jwk = json!({"kty": "EC", "crv": "P-256", "x": "abc", "y": "def"});
        relay
            .handle(sender, ClientEvent::PublicKey { code, jwk: jwk.clone() })
            .await;
        assert_eq!(receiver_rx.recv().await.unwrap(), ServerEvent::PublicKey { jwk });

        let payload = json!({"type": "answer", "sdp": {"anything": [1, 2, 3]}});
        relay
            .handle(receiver, ClientEvent::Signal { code, payload: payload.clone() })
            .await;
        assert_eq!(sender_rx.recv().await.unwrap(), ServerEvent::Signal { payload });

        // Nothing echoes back to the originator
        assert!(sender_rx.try_recv().is_err());
        assert!(receiver_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outsider_cannot_inject() {
        let relay = relay();
        let code = relay.registry().create(meta()).unwrap();
        let (_, mut sender_rx, _, mut receiver_rx) = ready_room(&relay, code).await;

        let (outsider, mut outsider_rx) = relay.connect();
        relay
            .handle(outsider, ClientEvent::Signal { code, payload: json!({"type": "offer"}) })
            .await;

        assert!(matches!(outsider_rx.recv().await.unwrap(), ServerEvent::Error { .. }));
        assert!(sender_rx.try_recv().is_err());
        assert!(receiver_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_peer() {
        let relay = relay();
        let code = relay.registry().create(meta()).unwrap();
        let (sender, _sender_rx, _, mut receiver_rx) = ready_room(&relay, code).await;

        relay.disconnect(sender).await;
        assert_eq!(receiver_rx.recv().await.unwrap(), ServerEvent::PeerLeft);
        assert_eq!(relay.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_session() {
        let relay = relay();
        let code = relay.registry().create(meta()).unwrap();
        let (id, _rx) = relay.connect();

        relay.handle(id, ClientEvent::CleanupSession { code }).await;
        relay.handle(id, ClientEvent::CleanupSession { code }).await;
        assert!(relay.registry().is_empty());
    }
}
