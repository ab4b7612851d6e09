//! Sending side of a transfer
//!
//! `start` registers the session, joins the relay and returns the code to
//! share. The rest of the run (key exchange, channel negotiation, streaming)
//! happens in one spawned task driven by a `select!` loop.

use std::sync::Arc;
use std::time::Duration;

use crypto_session::{AgreementKeyPair, ChunkEncoder, CryptoProvider, SymmetricKey};
use net_transport::{ChannelEvent, PeerChannel, PeerConnector};
use serde_json::Value;
use shared_protocol::{
    ChannelMessage, ClientEvent, FileMeta, ParticipantRole, ServerEvent, SessionCode,
    SignalPayload, TransferState,
};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::SessionApi;
use crate::session::{
    AbortOnDrop, FileSource, Progress, Shared, TransferStatus, join_task, next_event, sleep_opt,
};
use crate::signaling::{RelayConnector, RelayHandle};
use crate::{ClientConfig, ClientError, ClientResult};

/// How long a finished stream may still complete after the peer went away
const PEER_GONE_GRACE: Duration = Duration::from_secs(2);

pub struct Sender {
    config: ClientConfig,
    api: Arc<dyn SessionApi>,
    relay: Arc<dyn RelayConnector>,
    connector: Arc<dyn PeerConnector>,
    shared: Arc<Shared>,
}

impl Sender {
    pub fn new(
        config: ClientConfig,
        api: Arc<dyn SessionApi>,
        relay: Arc<dyn RelayConnector>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            config,
            api,
            relay,
            connector,
            shared: Shared::new(),
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.shared.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.shared.subscribe()
    }

    /// Create a session for `source` and wait for a receiver in the background
    pub async fn start(&self, source: FileSource) -> ClientResult<SessionCode> {
        let generation = self.shared.begin()?;
        match self.launch(generation, source).await {
            Ok(code) => Ok(code),
            Err(e) => {
                self.shared.fail(generation, &e);
                Err(e)
            }
        }
    }

    /// Tear everything down and return to idle
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    async fn launch(&self, generation: u64, source: FileSource) -> ClientResult<SessionCode> {
        let (file_meta, reader) = source.open().await?;
        let created = self.api.create_session(&file_meta).await?;
        let code = created.code;
        let deadline = Instant::now() + self.config.session_lifetime;
        info!(
            "Session {} created for {} ({} bytes)",
            code, created.file_meta.name, created.file_meta.size
        );

        self.shared.update(generation, |status| {
            status.code = Some(code);
            status.file_meta = Some(created.file_meta.clone());
        });

        let link = self.relay.connect().await?;
        self.shared.attach_relay(generation, link.handle.clone());
        self.shared
            .set_farewell(generation, ClientEvent::CleanupSession { code });
        link.handle
            .send(ClientEvent::JoinSession {
                code,
                role: ParticipantRole::Sender,
            })
            .await?;

        let run = SenderRun {
            generation,
            shared: self.shared.clone(),
            code,
            file_meta: created.file_meta,
            reader: Some(reader),
            provider: self.config.suite.provider(),
            connector: self.connector.clone(),
            relay: link.handle,
            deadline,
        };
        let task = tokio::spawn(run.run(link.incoming));
        self.shared.attach_task(generation, task);

        Ok(code)
    }
}

struct SenderRun {
    generation: u64,
    shared: Arc<Shared>,
    code: SessionCode,
    file_meta: FileMeta,
    reader: Option<Box<dyn AsyncRead + Send + Unpin>>,
    provider: Arc<dyn CryptoProvider>,
    connector: Arc<dyn PeerConnector>,
    relay: RelayHandle,
    deadline: Instant,
}

impl SenderRun {
    async fn run(mut self, incoming: mpsc::Receiver<ServerEvent>) {
        if let Err(e) = self.drive(incoming).await {
            self.shared.fail(self.generation, &e);
        }
    }

    async fn drive(&mut self, mut incoming: mpsc::Receiver<ServerEvent>) -> ClientResult<()> {
        let code = self.code;
        let expiry = tokio::time::sleep_until(self.deadline);
        tokio::pin!(expiry);

        let mut relay_open = true;
        let mut key_pair: Option<Box<dyn AgreementKeyPair>> = None;
        let mut key: Option<Arc<dyn SymmetricKey>> = None;
        let mut channel: Option<Arc<dyn PeerChannel>> = None;
        let mut channel_events: Option<mpsc::Receiver<ChannelEvent>> = None;
        let mut pending_candidates: Vec<Value> = Vec::new();
        let mut streaming: Option<AbortOnDrop<ClientResult<()>>> = None;
        let mut peer_gone: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = &mut expiry => {
                    info!("Session {} lifetime elapsed", code);
                    drop(streaming.take());
                    self.shared.expire(self.generation);
                    return Ok(());
                }

                _ = sleep_opt(peer_gone) => return Err(ClientError::PeerLeft),

                result = join_task(&mut streaming) => {
                    match result {
                        Ok(Ok(())) => {
                            self.complete().await;
                            return Ok(());
                        }
                        Ok(Err(e)) => return Err(e),
                        Err(e) => {
                            return Err(ClientError::Channel(format!("streaming task failed: {e}")));
                        }
                    }
                }

                event = incoming.recv(), if relay_open => {
                    let Some(event) = event else {
                        if streaming.is_some() {
                            debug!("Relay closed while streaming");
                            relay_open = false;
                            continue;
                        }
                        return Err(ClientError::RelayClosed);
                    };

                    match event {
                        ServerEvent::SessionReady { .. } => {
                            if key_pair.is_some() {
                                continue;
                            }
                            info!("Session {} ready, exchanging keys", code);
                            let pair = self.provider.generate_key_pair()?;
                            self.relay
                                .send(ClientEvent::PublicKey { code, jwk: pair.public_jwk()? })
                                .await?;
                            key_pair = Some(pair);
                        }

                        ServerEvent::PublicKey { jwk } => {
                            if key.is_some() {
                                debug!("Ignoring repeated public key");
                                continue;
                            }
                            let Some(pair) = key_pair.as_ref() else {
                                warn!("Public key arrived before session-ready");
                                continue;
                            };
                            key = Some(pair.derive(&jwk)?);
                            self.shared.set_state(self.generation, TransferState::Connected);

                            let negotiated = self.connector.create_offer().await?;
                            self.shared.attach_channel(self.generation, negotiated.channel.clone());
                            let offer = SignalPayload::Offer { sdp: negotiated.description };
                            self.relay
                                .send(ClientEvent::Signal { code, payload: offer.to_value()? })
                                .await?;

                            for candidate in pending_candidates.drain(..) {
                                negotiated.channel.add_candidate(candidate).await?;
                            }
                            channel = Some(negotiated.channel);
                            channel_events = Some(negotiated.events);
                        }

                        ServerEvent::Signal { payload } => {
                            match SignalPayload::from_value(payload)? {
                                SignalPayload::Answer { sdp } => {
                                    let channel = channel.as_ref().ok_or_else(|| {
                                        ClientError::Negotiation("answer before offer".to_string())
                                    })?;
                                    channel.apply_answer(sdp).await?;
                                }
                                SignalPayload::Ice { candidate } => match &channel {
                                    Some(channel) => channel.add_candidate(candidate).await?,
                                    None => pending_candidates.push(candidate),
                                },
                                SignalPayload::Offer { .. } => warn!("Sender ignores offers"),
                            }
                        }

                        ServerEvent::PeerLeft => {
                            if streaming.is_some() {
                                peer_gone.get_or_insert_with(|| Instant::now() + PEER_GONE_GRACE);
                                relay_open = false;
                                continue;
                            }
                            return Err(ClientError::PeerLeft);
                        }
                        ServerEvent::SessionNotFound => return Err(ClientError::SessionNotFound),
                        ServerEvent::SessionExpired => return Err(ClientError::SessionExpired),
                        ServerEvent::RoomFull => return Err(ClientError::RoomFull),
                        ServerEvent::Error { message } => return Err(ClientError::Relay(message)),
                    }
                }

                event = next_event(&mut channel_events) => {
                    let Some(event) = event else {
                        channel_events = None;
                        continue;
                    };

                    match event {
                        ChannelEvent::LocalCandidate(candidate) => {
                            let ice = SignalPayload::Ice { candidate };
                            self.relay
                                .send(ClientEvent::Signal { code, payload: ice.to_value()? })
                                .await?;
                        }
                        ChannelEvent::Open => {
                            if streaming.is_some() {
                                continue;
                            }
                            let (Some(channel), Some(key), Some(reader)) =
                                (channel.clone(), key.clone(), self.reader.take())
                            else {
                                return Err(ClientError::Negotiation(
                                    "channel opened before the key exchange".to_string(),
                                ));
                            };

                            info!("Channel open, streaming {}", self.file_meta.name);
                            self.shared.set_state(self.generation, TransferState::Transferring);
                            let task = tokio::spawn(stream_file(
                                channel,
                                key,
                                reader,
                                self.file_meta.size,
                                self.shared.clone(),
                                self.generation,
                            ));
                            streaming = Some(AbortOnDrop(task));
                        }
                        ChannelEvent::Message(_) => debug!("Ignoring frame from receiver"),
                        ChannelEvent::Closed => {
                            if streaming.is_some() {
                                peer_gone.get_or_insert_with(|| Instant::now() + PEER_GONE_GRACE);
                                channel_events = None;
                                continue;
                            }
                            return Err(ClientError::ChannelClosed);
                        }
                        ChannelEvent::Error(e) => return Err(ClientError::Channel(e)),
                    }
                }
            }
        }
    }

    async fn complete(&mut self) {
        info!("Session {}: transfer complete", self.code);
        self.shared.update(self.generation, |status| {
            status.state = TransferState::Completed;
            status.progress = 100;
        });
        if self
            .relay
            .send(ClientEvent::CleanupSession { code: self.code })
            .await
            .is_err()
        {
            debug!("Relay already closed, skipping cleanup");
        }
        self.shared.release(self.generation);
    }
}

/// Encrypt and send the whole source, then the done marker
async fn stream_file(
    channel: Arc<dyn PeerChannel>,
    key: Arc<dyn SymmetricKey>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    total: u64,
    shared: Arc<Shared>,
    generation: u64,
) -> ClientResult<()> {
    let mut encoder = ChunkEncoder::new(key, reader);
    let mut progress = Progress::new(total);
    let mut sent: u64 = 0;

    while let Some(frame) = encoder.next_frame().await? {
        if frame.message == ChannelMessage::Done && sent != total {
            return Err(ClientError::Io(std::io::Error::other(format!(
                "source produced {sent} bytes, expected {total}"
            ))));
        }

        channel.send(frame.message.to_json()?).await?;

        if frame.plaintext_len > 0 {
            let len = frame.plaintext_len as u64;
            sent += len;
            let percent = progress.advance(len);
            shared.update(generation, |status| {
                status.bytes = sent;
                status.chunks += 1;
                status.progress = percent;
            });
        }
    }

    channel.flush().await?;
    debug!("Sent {} bytes", sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crypto_session::CipherSuite;
    use net_transport::MemoryConnector;
    use tokio::sync::oneshot;

    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_can_be_spawned() {
        let (outgoing, _outgoing_rx) = mpsc::channel(1);
        let (shutdown, _shutdown_rx) = oneshot::channel();
        let run = SenderRun {
            generation: 1,
            shared: Shared::new(),
            code: SessionCode::parse("123456").unwrap(),
            file_meta: FileMeta::new("a.bin", 1, ""),
            reader: Some(Box::new(std::io::Cursor::new(vec![0u8]))),
            provider: CipherSuite::default().provider(),
            connector: Arc::new(MemoryConnector::new()),
            relay: RelayHandle::new(outgoing, shutdown),
            deadline: Instant::now(),
        };
        let (_events_tx, events) = mpsc::channel(1);

        let future = run.run(events);
        assert_send(&future);
    }
}
