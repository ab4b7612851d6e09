//! CipherDrop Signaling Server
//!
//! Session registry, signaling relay and the HTTP/WebSocket surface around
//! them. The binary in `main.rs` wires these together; tests and embedders
//! can do the same with [`SignalingServer`].

pub mod cleanup;
pub mod config;
mod error;
pub mod http;
pub mod registry;
pub mod relay;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub use config::{Config, ConfigError};
pub use error::*;
pub use http::{AppState, build_router};
pub use registry::{JoinOutcome, SessionRecord, SessionRegistry};
pub use relay::Relay;

/// A registry plus relay, ready to serve
pub struct SignalingServer {
    config: Config,
    relay: Arc<Relay>,
}

impl SignalingServer {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.sessions.lifetime(),
            config.sessions.max_file_size,
        ));
        Self {
            config,
            relay: Arc::new(Relay::new(registry)),
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.relay.registry()
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let cleanup = cleanup::spawn_cleanup_task(
            self.registry().clone(),
            self.config.cleanup.clone(),
        );

        let app = build_router(AppState::new(self.relay.clone()));
        info!("Listening on {}", listener.local_addr()?);

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        cleanup.abort();
        result?;
        Ok(())
    }

    /// Bind an ephemeral loopback port and serve in the background
    pub async fn spawn_local(
        self,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            if let Err(e) = self.serve(listener, std::future::pending()).await {
                tracing::error!("Server stopped: {}", e);
            }
        });

        Ok((addr, handle))
    }
}
