//! Host executable: parses the port arguments, wires up logging and signal
//! handling, and keeps the server alive until SIGINT/SIGTERM.

use std::sync::mpsc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use remote_command_server::{RemoteCommandServer, ServerConfig};

#[derive(Parser)]
#[command(name = "remote-command-server", version, about = "Remote shell-and-filesystem service")]
struct Cli {
    /// UDP port answering discovery probes
    #[arg(default_value_t = 9000)]
    discovery_port: u16,

    /// TCP port carrying the request/response channel
    #[arg(default_value_t = 9001)]
    command_port: u16,

    /// TCP port carrying child process output
    #[arg(default_value_t = 9002)]
    stream_port: u16,

    /// Initial working directory
    #[arg(default_value = ".")]
    cwd: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = RemoteCommandServer::open(ServerConfig {
        discovery_port: cli.discovery_port,
        command_port: cli.command_port,
        stream_port: cli.stream_port,
        working_directory: cli.cwd,
    })
    .context("failed to start server")?;

    info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .expect("BUG: failed to set signal handler");

    shutdown_rx.recv().expect("BUG: shutdown signal was lost");

    info!("Shutdown signal received");
    server.close();

    Ok(())
}
