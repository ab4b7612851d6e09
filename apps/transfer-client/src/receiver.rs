//! Receiving side of a transfer

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crypto_session::{AgreementKeyPair, CryptoProvider, SymmetricKey, TAG_SIZE};
use net_transport::{ChannelEvent, PeerChannel, PeerConnector};
use serde_json::Value;
use shared_protocol::{
    ChannelMessage, ClientEvent, EncryptedChunk, FileMeta, ParticipantRole, ServerEvent,
    SessionCode, SignalPayload, TransferState,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::SessionApi;
use crate::session::{Progress, ReceivedFile, Shared, TransferStatus, next_event, sleep_opt};
use crate::signaling::{RelayConnector, RelayHandle};
use crate::{ClientConfig, ClientError, ClientResult};

/// How long the done marker may still arrive after the sender left
const PEER_GONE_GRACE: Duration = Duration::from_secs(2);

/// Ciphertext in arrival order, decrypted as soon as the key exists
///
/// Chunks that arrive before the key are queued and replayed, oldest first,
/// when it is installed. A new chunk never overtakes a queued one. The first
/// chunk that fails to decrypt is fatal; nothing after it is attempted.
///
/// The announced file size bounds the buffer: a chunk that would carry the
/// total past it is refused before it is stored.
pub struct ReceiveBuffer {
    key: Option<Arc<dyn SymmetricKey>>,
    pending: VecDeque<EncryptedChunk>,
    decoded: Vec<Vec<u8>>,
    /// Announced plaintext size
    expected: u64,
    /// Plaintext carried by every accepted chunk, queued or decrypted
    accepted: u64,
    bytes: u64,
    done: bool,
}

impl ReceiveBuffer {
    pub fn new(expected: u64) -> Self {
        Self {
            key: None,
            pending: VecDeque::new(),
            decoded: Vec::new(),
            expected,
            accepted: 0,
            bytes: 0,
            done: false,
        }
    }

    /// Accept one chunk; returns the plaintext bytes decrypted by this call
    pub fn push(&mut self, chunk: EncryptedChunk) -> ClientResult<u64> {
        if self.done {
            return Err(ClientError::Channel("chunk after the done marker".to_string()));
        }

        let carried = chunk.ciphertext.len().saturating_sub(TAG_SIZE) as u64;
        let accepted = self.accepted.saturating_add(carried);
        if accepted > self.expected {
            return Err(ClientError::SizeMismatch {
                received: accepted,
                expected: self.expected,
            });
        }
        self.accepted = accepted;

        if self.key.is_some() && self.pending.is_empty() {
            self.decode_one(&chunk)
        } else {
            self.pending.push_back(chunk);
            Ok(0)
        }
    }

    /// Install the key and drain the queue; returns the bytes decrypted
    pub fn install_key(&mut self, key: Arc<dyn SymmetricKey>) -> ClientResult<u64> {
        self.key = Some(key);
        let mut total = 0;
        while let Some(chunk) = self.pending.pop_front() {
            total += self.decode_one(&chunk)?;
        }
        Ok(total)
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Done marker seen and every chunk decrypted
    pub fn is_complete(&self) -> bool {
        self.done && self.key.is_some() && self.pending.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn decoded_chunks(&self) -> usize {
        self.decoded.len()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether the decrypted total matches the announced size
    pub fn verify_size(&self) -> ClientResult<()> {
        if self.bytes != self.expected {
            return Err(ClientError::SizeMismatch {
                received: self.bytes,
                expected: self.expected,
            });
        }
        Ok(())
    }

    /// Concatenate the decrypted chunks in arrival order
    pub fn into_data(self) -> Vec<u8> {
        self.decoded.concat()
    }

    fn decode_one(&mut self, chunk: &EncryptedChunk) -> ClientResult<u64> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| ClientError::Negotiation("no key to decrypt with".to_string()))?;
        let plaintext = crypto_session::decode(key.as_ref(), chunk)?;
        let len = plaintext.len() as u64;
        self.bytes += len;
        self.decoded.push(plaintext);
        Ok(len)
    }
}

pub struct Receiver {
    config: ClientConfig,
    api: Arc<dyn SessionApi>,
    relay: Arc<dyn RelayConnector>,
    connector: Arc<dyn PeerConnector>,
    shared: Arc<Shared>,
}

impl Receiver {
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

    /// Validate `code`, join its session and receive in the background
    ///
    /// Returns the announced file metadata once the code has been accepted
    /// by the validation API. A code that fails validation never reaches
    /// the relay.
    pub async fn start(&self, code: &str) -> ClientResult<FileMeta> {
        let generation = self.shared.begin()?;
        match self.launch(generation, code).await {
            Ok(file_meta) => Ok(file_meta),
            Err(e) => {
                self.shared.fail(generation, &e);
                Err(e)
            }
        }
    }

    /// The completed file, once; `None` before completion or after a cancel
    pub fn take_file(&self) -> Option<ReceivedFile> {
        self.shared.take_delivered()
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    async fn launch(&self, generation: u64, input: &str) -> ClientResult<FileMeta> {
        let code = SessionCode::parse(input)
            .map_err(|_| ClientError::InvalidCode(input.trim().to_string()))?;

        let check = self.api.check_session(&code.to_string()).await?;
        let (true, Some(file_meta)) = (check.ok, check.file_meta) else {
            return Err(ClientError::SessionNotFound);
        };
        let lifetime = check
            .expires_in_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.session_lifetime);
        info!(
            "Code {} accepted: {} ({} bytes)",
            code, file_meta.name, file_meta.size
        );

        self.shared.update(generation, |status| {
            status.code = Some(code);
            status.file_meta = Some(file_meta.clone());
        });

        let link = self.relay.connect().await?;
        self.shared.attach_relay(generation, link.handle.clone());
        link.handle
            .send(ClientEvent::JoinSession {
                code,
                role: ParticipantRole::Receiver,
            })
            .await?;

        let run = ReceiverRun {
            generation,
            shared: self.shared.clone(),
            code,
            file_meta: file_meta.clone(),
            provider: self.config.suite.provider(),
            connector: self.connector.clone(),
            relay: link.handle,
            admission_timeout: self.config.admission_timeout,
            deadline: Instant::now() + lifetime,
        };
        let task = tokio::spawn(run.run(link.incoming));
        self.shared.attach_task(generation, task);

        Ok(file_meta)
    }
}

struct ReceiverRun {
    generation: u64,
    shared: Arc<Shared>,
    code: SessionCode,
    file_meta: FileMeta,
    provider: Arc<dyn CryptoProvider>,
    connector: Arc<dyn PeerConnector>,
    relay: RelayHandle,
    admission_timeout: Duration,
    deadline: Instant,
}

impl ReceiverRun {
    async fn run(mut self, incoming: mpsc::Receiver<ServerEvent>) {
        if let Err(e) = self.drive(incoming).await {
            self.shared.fail(self.generation, &e);
        }
    }

    async fn drive(&mut self, mut incoming: mpsc::Receiver<ServerEvent>) -> ClientResult<()> {
        let code = self.code;
        let admission = tokio::time::sleep(self.admission_timeout);
        let expiry = tokio::time::sleep_until(self.deadline);
        tokio::pin!(admission, expiry);

        let mut admitted = false;
        let mut relay_open = true;
        let mut key_pair: Option<Box<dyn AgreementKeyPair>> = None;
        let (key_tx, mut key_rx) = watch::channel(false);
        let mut buffer = ReceiveBuffer::new(self.file_meta.size);
        let mut progress = Progress::new(self.file_meta.size);
        let mut pending_offer: Option<Value> = None;
        let mut channel: Option<Arc<dyn PeerChannel>> = None;
        let mut channel_events: Option<mpsc::Receiver<ChannelEvent>> = None;
        let mut pending_candidates: Vec<Value> = Vec::new();
        let mut peer_gone: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = &mut admission, if !admitted => {
                    warn!("Session {}: no session-ready within {:?}", code, self.admission_timeout);
                    return Err(ClientError::AdmissionTimeout);
                }

                _ = &mut expiry => {
                    info!("Session {} lifetime elapsed", code);
                    self.shared.expire(self.generation);
                    return Ok(());
                }

                _ = sleep_opt(peer_gone) => return Err(ClientError::PeerLeft),

                event = incoming.recv(), if relay_open => {
                    let Some(event) = event else {
                        if channel.is_some() {
                            debug!("Relay closed, continuing on the channel");
                            relay_open = false;
                            continue;
                        }
                        return Err(ClientError::RelayClosed);
                    };

                    match event {
                        ServerEvent::SessionReady { file_meta } => {
                            if admitted {
                                continue;
                            }
                            admitted = true;
                            info!("Session {} ready, exchanging keys", code);
                            self.shared.update(self.generation, |status| {
                                status.file_meta = Some(file_meta);
                            });
                            let pair = self.provider.generate_key_pair()?;
                            self.relay
                                .send(ClientEvent::PublicKey { code, jwk: pair.public_jwk()? })
                                .await?;
                            key_pair = Some(pair);
                        }

                        ServerEvent::PublicKey { jwk } => {
                            if buffer.has_key() {
                                debug!("Ignoring repeated public key");
                                continue;
                            }
                            let Some(pair) = key_pair.as_ref() else {
                                warn!("Public key arrived before session-ready");
                                continue;
                            };
                            let key = pair.derive(&jwk)?;
                            self.shared.update(self.generation, |status| {
                                if status.state == TransferState::Waiting {
                                    status.state = TransferState::Connected;
                                }
                            });

                            let replayed = buffer.install_key(key)?;
                            if replayed > 0 {
                                debug!("Replayed {} queued bytes", replayed);
                                self.record(&mut progress, &buffer, replayed);
                            }
                            key_tx.send_replace(true);

                            if buffer.is_complete() {
                                return self.finish(buffer);
                            }
                        }

                        ServerEvent::Signal { payload } => {
                            match SignalPayload::from_value(payload)? {
                                SignalPayload::Offer { sdp } => {
                                    if channel.is_some() || pending_offer.is_some() {
                                        warn!("Ignoring second offer");
                                        continue;
                                    }
                                    pending_offer = Some(sdp);
                                }
                                SignalPayload::Ice { candidate } => match &channel {
                                    Some(channel) => channel.add_candidate(candidate).await?,
                                    None => pending_candidates.push(candidate),
                                },
                                SignalPayload::Answer { .. } => warn!("Receiver ignores answers"),
                            }
                        }

                        ServerEvent::PeerLeft => {
                            if channel.is_some() {
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

                // The offer may arrive before our key; answer only once it exists
                ready = wait_for_key(&mut key_rx), if pending_offer.is_some() => {
                    let (true, Some(offer)) = (ready, pending_offer.take()) else {
                        return Err(ClientError::Negotiation("key exchange abandoned".to_string()));
                    };

                    let negotiated = self.connector.accept_offer(offer).await?;
                    self.shared.attach_channel(self.generation, negotiated.channel.clone());
                    let answer = SignalPayload::Answer { sdp: negotiated.description };
                    self.relay
                        .send(ClientEvent::Signal { code, payload: answer.to_value()? })
                        .await?;

                    for candidate in pending_candidates.drain(..) {
                        negotiated.channel.add_candidate(candidate).await?;
                    }
                    channel = Some(negotiated.channel);
                    channel_events = Some(negotiated.events);
                    self.shared.set_state(self.generation, TransferState::Receiving);
                }

                event = next_event(&mut channel_events) => {
                    let Some(event) = event else {
                        channel_events = None;
                        continue;
                    };

                    match event {
                        ChannelEvent::LocalCandidate(candidate) => {
                            if !relay_open {
                                continue;
                            }
                            let ice = SignalPayload::Ice { candidate };
                            self.relay
                                .send(ClientEvent::Signal { code, payload: ice.to_value()? })
                                .await?;
                        }
                        ChannelEvent::Open => debug!("Channel open"),
                        ChannelEvent::Message(text) => {
                            match ChannelMessage::from_json(&text)? {
                                ChannelMessage::Chunk(chunk) => {
                                    let decoded = buffer.push(chunk)?;
                                    if decoded > 0 {
                                        self.record(&mut progress, &buffer, decoded);
                                    }
                                }
                                ChannelMessage::Done => {
                                    debug!(
                                        "Done marker after {} chunks ({} queued)",
                                        buffer.decoded_chunks(),
                                        buffer.queued()
                                    );
                                    buffer.mark_done();
                                }
                            }

                            if buffer.is_complete() {
                                return self.finish(buffer);
                            }
                        }
                        ChannelEvent::Closed => {
                            channel_events = None;
                            if buffer.is_complete() {
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

    fn record(&self, progress: &mut Progress, buffer: &ReceiveBuffer, decoded: u64) {
        let percent = progress.advance(decoded);
        let bytes = buffer.bytes();
        let chunks = buffer.decoded_chunks() as u64;
        self.shared.update(self.generation, |status| {
            status.bytes = bytes;
            status.chunks = chunks;
            status.progress = percent;
        });
    }

    /// Deliver the file if it is whole
    fn finish(&self, buffer: ReceiveBuffer) -> ClientResult<()> {
        buffer.verify_size()?;
        info!(
            "Session {}: received {} bytes in {} chunks",
            self.code,
            buffer.bytes(),
            buffer.decoded_chunks()
        );
        let file = ReceivedFile {
            meta: self.file_meta.clone(),
            data: buffer.into_data(),
        };
        self.shared.deliver(self.generation, file);
        self.shared.release(self.generation);
        Ok(())
    }
}

/// Resolves once the key has been installed; false if that can no longer happen
async fn wait_for_key(key_rx: &mut watch::Receiver<bool>) -> bool {
    key_rx.wait_for(|ready| *ready).await.is_ok()
}

#[cfg(test)]
mod tests {
    use crypto_session::{AesGcmKey, encrypt_chunk};

    use super::*;

    fn key(byte: u8) -> Arc<dyn SymmetricKey> {
        Arc::new(AesGcmKey::new(&[byte; 32]).unwrap())
    }

    fn sealed(key: &Arc<dyn SymmetricKey>, data: &[u8]) -> EncryptedChunk {
        encrypt_chunk(key.as_ref(), data).unwrap()
    }

    #[test]
    fn test_chunks_before_key_are_replayed_in_order() {
        let k = key(1);
        let mut buffer = ReceiveBuffer::new(18);

        assert_eq!(buffer.push(sealed(&k, b"first ")).unwrap(), 0);
        assert_eq!(buffer.push(sealed(&k, b"second ")).unwrap(), 0);
        assert_eq!(buffer.queued(), 2);

        assert_eq!(buffer.install_key(k.clone()).unwrap(), 13);
        assert_eq!(buffer.queued(), 0);
        assert_eq!(buffer.push(sealed(&k, b"third")).unwrap(), 5);

        buffer.mark_done();
        assert!(buffer.is_complete());
        assert_eq!(buffer.decoded_chunks(), 3);
        assert_eq!(buffer.into_data(), b"first second third");
    }

    #[test]
    fn test_done_before_key_waits_for_replay() {
        let k = key(2);
        let mut buffer = ReceiveBuffer::new(3);
        buffer.push(sealed(&k, b"abc")).unwrap();
        buffer.mark_done();
        assert!(!buffer.is_complete());

        buffer.install_key(k).unwrap();
        assert!(buffer.is_complete());
        assert_eq!(buffer.bytes(), 3);
    }

    #[test]
    fn test_wrong_key_stops_at_first_failure() {
        let k = key(3);
        let mut buffer = ReceiveBuffer::new(6);
        buffer.push(sealed(&k, b"one")).unwrap();
        buffer.push(sealed(&k, b"two")).unwrap();

        assert!(matches!(
            buffer.install_key(key(4)),
            Err(ClientError::Crypto(crypto_session::CryptoError::DecryptionFailed))
        ));
        assert_eq!(buffer.decoded_chunks(), 0);
        // The chunk after the failing one was never attempted
        assert_eq!(buffer.queued(), 1);
    }

    #[test]
    fn test_tampered_chunk_is_rejected() {
        let k = key(5);
        let mut buffer = ReceiveBuffer::new(7);
        buffer.install_key(k.clone()).unwrap();

        let mut chunk = sealed(&k, b"payload");
        chunk.ciphertext[0] ^= 0x01;
        assert!(buffer.push(chunk).is_err());
        assert_eq!(buffer.bytes(), 0);
    }

    #[test]
    fn test_empty_transfer_completes_on_done() {
        let mut buffer = ReceiveBuffer::new(0);
        buffer.install_key(key(6)).unwrap();
        buffer.mark_done();
        assert!(buffer.is_complete());
        assert!(buffer.into_data().is_empty());
    }

    #[test]
    fn test_chunk_past_announced_size_is_refused() {
        let k = key(7);
        let mut buffer = ReceiveBuffer::new(5);
        buffer.push(sealed(&k, b"abc")).unwrap();

        // Refused while still queued, before any key exists
        assert!(matches!(
            buffer.push(sealed(&k, b"def")),
            Err(ClientError::SizeMismatch { received: 6, expected: 5 })
        ));
        assert_eq!(buffer.queued(), 1);

        buffer.install_key(k.clone()).unwrap();
        assert!(buffer.push(sealed(&k, b"de")).is_ok());
        assert!(buffer.push(sealed(&k, b"f")).is_err());
        assert_eq!(buffer.bytes(), 5);
        buffer.verify_size().unwrap();
    }

    #[test]
    fn test_short_stream_fails_size_check() {
        let k = key(8);
        let mut buffer = ReceiveBuffer::new(10);
        buffer.install_key(k.clone()).unwrap();
        buffer.push(sealed(&k, b"four")).unwrap();
        buffer.mark_done();

        assert!(buffer.is_complete());
        assert!(matches!(
            buffer.verify_size(),
            Err(ClientError::SizeMismatch { received: 4, expected: 10 })
        ));
    }

    #[test]
    fn test_chunk_after_done_is_refused() {
        let k = key(9);
        let mut buffer = ReceiveBuffer::new(8);
        buffer.install_key(k.clone()).unwrap();
        buffer.push(sealed(&k, b"half")).unwrap();
        buffer.mark_done();

        assert!(buffer.push(sealed(&k, b"more")).is_err());
        assert_eq!(buffer.bytes(), 4);
    }
}
