//! CipherDrop Signaling Server
//!
//! Session registry, validation API and WebSocket relay for peer discovery.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use signaling_server::{Config, SignalingServer};

#[derive(Parser)]
#[command(name = "signaling-server", version, about = "CipherDrop signaling server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "signaling.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("signaling_server=debug".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = Config::load_or_default(&args.config)?;
    let addr = config.bind_address()?;

    info!("Starting CipherDrop Signaling Server");
    info!(
        "Session lifetime {}s, max file size {} bytes",
        config.sessions.lifetime_secs, config.sessions.max_file_size
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = SignalingServer::new(config);

    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
