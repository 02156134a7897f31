//! halregd - HAL service registry daemon.
//!
//! Binds the registry's Unix socket, registers the registry's own control
//! interface with itself, publishes a readiness flag file, and serves
//! until interrupted.

use anyhow::Result;
use clap::Parser;
use halreg_core::{IpcConfig, ResolveMode};
use halreg_daemon::server::RegistryServer;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "halregd")]
#[command(about = "HAL service naming and discovery registry daemon")]
struct Args {
    /// Socket path (defaults to halregd.sock under the temp directory)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Readiness flag file written once the daemon is accepting calls
    #[arg(long)]
    ready_file: Option<PathBuf>,

    /// Resolve only exact version matches instead of minimum-minor
    #[arg(long)]
    exact: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let socket_path = args
        .socket
        .unwrap_or_else(|| std::env::temp_dir().join(IpcConfig::SOCKET_FILE_NAME));
    let ready_path = args
        .ready_file
        .unwrap_or_else(|| std::env::temp_dir().join(IpcConfig::READY_FILE_NAME));
    let mode = if args.exact {
        ResolveMode::Exact
    } else {
        ResolveMode::SupportsMinor
    };

    info!("Starting halregd on {}", socket_path.display());

    let _server = RegistryServer::start(&socket_path, mode).await?;

    // Readiness flag: HAL services wait for this before publishing.
    std::fs::write(&ready_path, format!("{}\n", socket_path.display()))?;

    // Intentional stdout: launchers read the socket path from here.
    println!("HALREG_SOCKET={}", socket_path.display());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    let _ = std::fs::remove_file(&ready_path);

    Ok(())
}
