//! QUIC peer channel
//!
//! The offering side runs a server endpoint with a throwaway self-signed
//! certificate. The certificate travels inside the offer, so the answering
//! side pins exactly that certificate instead of trusting a CA. Host
//! candidates are `{address, port}` pairs for the offering endpoint; the
//! answering side dials them in arrival order until one connects.
//!
//! Each side sends on its own unidirectional stream. Frames are a u32
//! big-endian length followed by UTF-8 text.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use parking_lot::{Mutex, RwLock};
use quinn::{ClientConfig, Connection, Endpoint, SendStream, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    ChannelEvent, EVENT_BUFFER, MAX_FRAME_SIZE, Negotiated, PeerChannel, PeerConnector,
    TransportError, TransportResult,
};

/// Name carried in the self-signed certificate
pub const SERVER_NAME: &str = "cipherdrop.local";

const ALPN: &[u8] = b"cipherdrop/1";

/// QUIC connector settings
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Address the offering endpoint binds (port is always ephemeral)
    pub bind_ip: IpAddr,
    /// Per-candidate dial timeout
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive: Duration,
    /// Also advertise 127.0.0.1
    pub advertise_loopback: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(5),
            advertise_loopback: true,
        }
    }
}

/// Direct QUIC connections between the two peers
#[derive(Debug, Clone, Default)]
pub struct QuicConnector {
    config: QuicConfig,
}

impl QuicConnector {
    pub fn new(config: QuicConfig) -> Self {
        Self { config }
    }

    fn transport_config(&self) -> TransportResult<TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.config.idle_timeout)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(Some(self.config.keep_alive));
        Ok(transport)
    }

    /// Server config with a fresh self-signed certificate
    fn create_server_config(&self) -> TransportResult<(ServerConfig, CertificateDer<'static>)> {
        let certified_key = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(|e| TransportError::Certificate(e.to_string()))?;

        let cert_der = certified_key.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(certified_key.key_pair.serialize_der());

        let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key.into())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        config.transport_config(Arc::new(self.transport_config()?));

        Ok((config, cert_der))
    }

    /// Client config trusting only the offered certificate
    fn create_client_config(&self, cert: CertificateDer<'static>) -> TransportResult<ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(cert)
            .map_err(|e| TransportError::Certificate(e.to_string()))?;

        let mut crypto = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        config.transport_config(Arc::new(self.transport_config()?));

        Ok(config)
    }

    fn host_candidates(&self, port: u16) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();

        if self.config.bind_ip.is_unspecified() {
            match local_ip_address::local_ip() {
                Ok(ip) => addrs.push(SocketAddr::new(ip, port)),
                Err(e) => debug!("No LAN address: {}", e),
            }
        } else {
            addrs.push(SocketAddr::new(self.config.bind_ip, port));
        }

        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        if self.config.advertise_loopback && !addrs.contains(&loopback) {
            addrs.push(loopback);
        }

        addrs
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn candidate_json(addr: SocketAddr) -> Value {
    json!({ "address": addr.ip().to_string(), "port": addr.port() })
}

fn parse_candidate(candidate: &Value) -> TransportResult<SocketAddr> {
    let ip: IpAddr = candidate
        .get("address")
        .and_then(Value::as_str)
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| TransportError::Negotiation("candidate without address".to_string()))?;
    let port = candidate
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| TransportError::Negotiation("candidate without port".to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

#[async_trait]
impl PeerConnector for QuicConnector {
    async fn create_offer(&self) -> TransportResult<Negotiated> {
        let (server_config, cert) = self.create_server_config()?;
        let endpoint = Endpoint::server(server_config, SocketAddr::new(self.config.bind_ip, 0))?;
        let port = endpoint.local_addr()?.port();

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        for addr in self.host_candidates(port) {
            let _ = events_tx.try_send(ChannelEvent::LocalCandidate(candidate_json(addr)));
        }

        let channel = Arc::new(QuicChannel::new(endpoint.clone(), events_tx, None));

        let accepting = channel.clone();
        let task = tokio::spawn(async move {
            let Some(incoming) = endpoint.accept().await else {
                return;
            };
            match incoming.await {
                Ok(connection) => {
                    info!("Accepted connection from {}", connection.remote_address());
                    accepting.attach(connection).await;
                }
                Err(e) => accepting.fail(e.to_string()).await,
            }
        });
        channel.tasks.lock().push(task);

        info!("QUIC offer listening on port {}", port);

        Ok(Negotiated {
            channel,
            description: json!({
                "type": "quic",
                "cert": STANDARD.encode(cert.as_ref()),
                "serverName": SERVER_NAME,
            }),
            events: events_rx,
        })
    }

    async fn accept_offer(&self, offer: Value) -> TransportResult<Negotiated> {
        let cert = offer
            .get("cert")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Negotiation("offer without certificate".to_string()))?;
        let cert = STANDARD
            .decode(cert)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        let server_name = offer
            .get("serverName")
            .and_then(Value::as_str)
            .unwrap_or(SERVER_NAME)
            .to_string();

        let client_config = self.create_client_config(CertificateDer::from(cert))?;
        let mut endpoint = Endpoint::client(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
        endpoint.set_default_client_config(client_config);

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(QuicChannel::new(endpoint, events_tx, Some(candidate_tx)));

        let task = tokio::spawn(dial(
            channel.clone(),
            candidate_rx,
            server_name,
            self.config.connect_timeout,
        ));
        channel.tasks.lock().push(task);

        Ok(Negotiated {
            channel,
            description: json!({ "type": "quic", "accepted": true }),
            events: events_rx,
        })
    }
}

/// Try relayed candidates one at a time until a connection comes up
async fn dial(
    channel: Arc<QuicChannel>,
    mut candidates: mpsc::UnboundedReceiver<SocketAddr>,
    server_name: String,
    connect_timeout: Duration,
) {
    while let Some(addr) = candidates.recv().await {
        debug!("Dialing candidate {}", addr);

        let connecting = match channel.endpoint.connect(addr, &server_name) {
            Ok(connecting) => connecting,
            Err(e) => {
                debug!("Skipping candidate {}: {}", addr, e);
                continue;
            }
        };

        match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(Ok(connection)) => {
                info!("Connected to {}", addr);
                channel.attach(connection).await;
                return;
            }
            Ok(Err(e)) => warn!("Candidate {} failed: {}", addr, e),
            Err(_) => warn!("Candidate {} timed out", addr),
        }
    }
}

struct QuicChannel {
    endpoint: Endpoint,
    events: mpsc::Sender<ChannelEvent>,
    connection: RwLock<Option<Connection>>,
    send_stream: tokio::sync::Mutex<Option<SendStream>>,
    /// Answering side only
    candidates: Mutex<Option<mpsc::UnboundedSender<SocketAddr>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QuicChannel {
    fn new(
        endpoint: Endpoint,
        events: mpsc::Sender<ChannelEvent>,
        candidates: Option<mpsc::UnboundedSender<SocketAddr>>,
    ) -> Self {
        Self {
            endpoint,
            events,
            connection: RwLock::new(None),
            send_stream: tokio::sync::Mutex::new(None),
            candidates: Mutex::new(candidates),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn attach(&self, connection: Connection) {
        let send = match connection.open_uni().await {
            Ok(send) => send,
            Err(e) => {
                self.fail(e.to_string()).await;
                return;
            }
        };

        *self.send_stream.lock().await = Some(send);
        *self.connection.write() = Some(connection.clone());
        self.candidates.lock().take();

        let _ = self.events.send(ChannelEvent::Open).await;

        let task = tokio::spawn(read_frames(connection, self.events.clone()));
        self.tasks.lock().push(task);
    }

    async fn fail(&self, reason: String) {
        warn!("QUIC channel failed: {}", reason);
        let _ = self.events.send(ChannelEvent::Error(reason)).await;
    }
}

async fn read_frames(connection: Connection, events: mpsc::Sender<ChannelEvent>) {
    let mut recv = match connection.accept_uni().await {
        Ok(recv) => recv,
        Err(e) => {
            debug!("Peer stream not opened: {}", e);
            let _ = events.send(ChannelEvent::Closed).await;
            return;
        }
    };

    loop {
        let mut len_buf = [0u8; 4];
        match recv.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(0)) => {
                debug!("Peer finished its stream");
                let _ = events.send(ChannelEvent::Closed).await;
                return;
            }
            Err(e) => {
                debug!("Peer stream ended: {}", e);
                let _ = events.send(ChannelEvent::Closed).await;
                return;
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            let error = TransportError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            };
            let _ = events.send(ChannelEvent::Error(error.to_string())).await;
            return;
        }

        let mut buf = vec![0u8; len];
        if let Err(e) = recv.read_exact(&mut buf).await {
            let _ = events.send(ChannelEvent::Error(e.to_string())).await;
            return;
        }

        let frame = match String::from_utf8(buf) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = events.send(ChannelEvent::Error(e.to_string())).await;
                return;
            }
        };

        if events.send(ChannelEvent::Message(frame)).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl PeerChannel for QuicChannel {
    async fn apply_answer(&self, answer: Value) -> TransportResult<()> {
        if answer.get("type").and_then(Value::as_str) != Some("quic") {
            return Err(TransportError::Negotiation("answer is not a QUIC answer".to_string()));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: Value) -> TransportResult<()> {
        let addr = parse_candidate(&candidate)?;
        match self.candidates.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(addr);
            }
            // The offering side listens; nothing to dial
            None => debug!("Ignoring candidate {}", addr),
        }
        Ok(())
    }

    async fn send(&self, frame: String) -> TransportResult<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut guard = self.send_stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let len = (frame.len() as u32).to_be_bytes();
        stream
            .write_all(&len)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        stream
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        Ok(())
    }

    async fn flush(&self) -> TransportResult<()> {
        let mut guard = self.send_stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        stream
            .finish()
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        match stream.stopped().await {
            Ok(_) => Ok(()),
            // The peer read everything and hung up before our ack arrived
            Err(quinn::StoppedError::ConnectionLost(quinn::ConnectionError::ApplicationClosed(
                _,
            ))) => {
                debug!("Peer closed after the final frame");
                Ok(())
            }
            Err(e) => Err(TransportError::Stream(e.to_string())),
        }
    }

    fn close(&self) {
        self.candidates.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(connection) = self.connection.write().take() {
            connection.close(0u32.into(), b"closed");
            info!("Connection closed");
        }
        self.endpoint.close(0u32.into(), b"closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_parsing() {
        let addr: SocketAddr = "192.168.1.20:4433".parse().unwrap();
        assert_eq!(parse_candidate(&candidate_json(addr)).unwrap(), addr);

        assert!(parse_candidate(&json!({"address": "nope", "port": 1})).is_err());
        assert!(parse_candidate(&json!({"address": "10.0.0.1", "port": 70000})).is_err());
        assert!(parse_candidate(&json!({"memory": 1})).is_err());
    }

    #[test]
    fn test_loopback_is_advertised_once() {
        let connector = QuicConnector::new(QuicConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        });
        let addrs = connector.host_candidates(9000);
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_loopback_channel() {
        let connector = QuicConnector::new(QuicConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        });

        let mut offer = connector.create_offer().await.unwrap();
        let mut answer = connector.accept_offer(offer.description.clone()).await.unwrap();
        offer.channel.apply_answer(answer.description.clone()).await.unwrap();

        let ChannelEvent::LocalCandidate(candidate) = offer.events.recv().await.unwrap() else {
            panic!("expected a host candidate");
        };
        answer.channel.add_candidate(candidate).await.unwrap();

        assert_eq!(answer.events.recv().await.unwrap(), ChannelEvent::Open);
        assert_eq!(offer.events.recv().await.unwrap(), ChannelEvent::Open);

        for i in 0..3 {
            offer.channel.send(format!("frame-{i}")).await.unwrap();
        }
        offer.channel.flush().await.unwrap();

        for i in 0..3 {
            assert_eq!(
                answer.events.recv().await.unwrap(),
                ChannelEvent::Message(format!("frame-{i}"))
            );
        }
        assert_eq!(answer.events.recv().await.unwrap(), ChannelEvent::Closed);

        offer.channel.close();
        answer.channel.close();
    }
}
