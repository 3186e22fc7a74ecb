//! Bingo relay server binary
//!
//! Hosts the real-time game tree that multi-device games synchronise through.

use bingo_sync::config::{generate_sample_config, ConfigLoader};
use bingo_sync::logging::init_tracing;
use bingo_sync::relay::RelayServer;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bingo-relay")]
#[command(about = "Real-time state relay for multi-device bingo games", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the port
    #[arg(short, long)]
    port: Option<u16>,

    /// Write a sample configuration to this path and exit
    #[arg(long)]
    write_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(path) = args.write_config {
        generate_sample_config(&path)?;
        println!("Wrote sample configuration to {}", path);
        return Ok(());
    }

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(bind) = args.bind {
        config.relay.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.relay.port = port;
    }
    config.validate()?;

    init_tracing(&config.logging);
    info!(address = %config.relay.socket_address(), "Starting bingo relay");

    if let Err(e) = RelayServer::new(config.relay.clone()).run(shutdown_signal()).await {
        error!("Relay failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
