//! Client configuration

use std::time::Duration;

use crypto_session::CipherSuite;
use shared_protocol::DEFAULT_SESSION_LIFETIME_SECS;

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the validation API (without `/api`)
    pub api_url: String,
    /// WebSocket URL of the relay
    pub relay_url: String,
    /// Sender-side session lifetime
    pub session_lifetime: Duration,
    /// How long a receiver waits for `session-ready`
    pub admission_timeout: Duration,
    pub suite: CipherSuite,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000".to_string(),
            relay_url: "ws://localhost:5000/ws".to_string(),
            session_lifetime: Duration::from_secs(DEFAULT_SESSION_LIFETIME_SECS),
            admission_timeout: Duration::from_secs(10),
            suite: CipherSuite::default(),
        }
    }
}

impl ClientConfig {
    /// Point both the API and the relay at one server
    pub fn for_server(server: &str) -> Self {
        let api_url = server.trim_end_matches('/').to_string();
        Self {
            relay_url: relay_url_for(&api_url),
            api_url,
            ..Default::default()
        }
    }
}

/// `http(s)://host` -> `ws(s)://host/ws`
pub fn relay_url_for(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{ws}/ws")
}
