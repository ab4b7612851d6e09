//! CipherDrop command line client

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use crypto_session::CipherSuite;
use net_transport::QuicConnector;
use shared_protocol::TransferState;
use tokio::sync::watch;
use tracing::info;

use transfer_client::{
    ClientConfig, FileSource, HttpSessionApi, Receiver, Sender, TransferStatus, WsRelayConnector,
};

#[derive(Parser)]
#[command(name = "cipherdrop", version, about = "Ephemeral end-to-end encrypted file transfer")]
struct Args {
    /// Server base URL (validation API and relay)
    #[arg(long, global = true, default_value = "http://localhost:5000")]
    server: String,

    /// Relay WebSocket URL, derived from --server when omitted
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Key agreement and cipher: p256 or x25519
    #[arg(long, global = true, default_value = "p256")]
    suite: CipherSuite,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Offer a file and print the code to share
    Send {
        path: PathBuf,

        /// MIME type announced to the receiver
        #[arg(long = "type")]
        content_type: Option<String>,
    },
    /// Receive the file offered under a code
    Receive {
        code: String,

        /// Directory to write the file into
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("transfer_client=info".parse()?)
                .add_directive("net_transport=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = ClientConfig::for_server(&args.server);
    if let Some(relay) = args.relay {
        config.relay_url = relay;
    }
    config.suite = args.suite;

    let api = Arc::new(HttpSessionApi::new(config.api_url.clone()));
    let relay = Arc::new(WsRelayConnector::new(config.relay_url.clone()));
    let connector = Arc::new(QuicConnector::default());

    match args.command {
        Command::Send { path, content_type } => {
            let sender = Sender::new(config, api, relay, connector);
            let code = sender.start(FileSource::Path { path, content_type }).await?;
            println!("Code: {code}");

            let status = wait(sender.subscribe(), || sender.cancel()).await;
            report(&status)?;
        }
        Command::Receive { code, out } => {
            let receiver = Receiver::new(config, api, relay, connector);
            let meta = match receiver.start(&code).await {
                Ok(meta) => meta,
                Err(e) => bail!(e.user_message()),
            };
            println!(
                "Receiving {} ({} bytes, {})",
                meta.name,
                meta.size,
                meta.content_type_or_default()
            );

            let status = wait(receiver.subscribe(), || receiver.cancel()).await;
            report(&status)?;

            if let Some(file) = receiver.take_file() {
                let path = file.save_to(&out).await?;
                println!("Saved to {}", path.display());
            }
        }
    }

    Ok(())
}

/// Print progress until a terminal state, or cancel on Ctrl-C
async fn wait(
    mut updates: watch::Receiver<TransferStatus>,
    cancel: impl FnOnce(),
) -> TransferStatus {
    let mut last_progress = None;
    loop {
        let status = updates.borrow_and_update().clone();
        if last_progress != Some(status.progress) && status.state != TransferState::Waiting {
            eprint!("\r{:?}: {:>3}%", status.state, status.progress);
            last_progress = Some(status.progress);
        }
        if status.state.is_terminal() {
            eprintln!();
            return status;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return status;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling");
                cancel();
                return TransferStatus::default();
            }
        }
    }
}

fn report(status: &TransferStatus) -> anyhow::Result<()> {
    match status.state {
        TransferState::Completed => {
            println!("Done: {} bytes in {} chunks", status.bytes, status.chunks);
            Ok(())
        }
        TransferState::Expired => bail!("Session expired"),
        TransferState::Error => bail!(
            "{}",
            status.error.clone().unwrap_or_else(|| "Transfer failed".to_string())
        ),
        _ => bail!("Cancelled"),
    }
}
