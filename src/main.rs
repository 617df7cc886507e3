//! simbridge - Simulated-topology to forwarding-plane bridge
//!
//! Listens for simulator clients speaking the frame protocol, authenticates
//! them, and relays Ethernet frames between their virtual interfaces and the
//! forwarding plane.

mod config;
mod network;
mod protocol;
mod relay;
mod session;
mod topology;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::Server;
use relay::{ForwardingPlane, InjectError, PortId};
use topology::MemoryStore;

/// simbridge - bridge simulated topologies to a forwarding plane
#[derive(Parser)]
#[command(name = "simbridge")]
#[command(author = "Simbridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Bridge simulated network topologies to a forwarding plane", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

/// Forwarding plane used when no real switch is wired up: frames are logged
/// and discarded.
struct DiscardPlane;

#[async_trait]
impl ForwardingPlane for DiscardPlane {
    async fn inject_packet(&self, port: PortId, frame: &[u8]) -> Result<(), InjectError> {
        tracing::debug!("Discarding {} byte frame for port {}", frame.len(), port);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Serve { port } => {
            run_serve(config, port).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info();
        }
    }

    Ok(())
}

/// Run the bridge server until interrupted
async fn run_serve(mut config: Config, port_override: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port_override {
        config.network.port = port;
    }

    if config.users.is_empty() {
        tracing::warn!("No users configured; every authentication will fail");
    }

    // All forwarding ports the configured topologies reference.
    let ports: BTreeSet<PortId> = config
        .topologies
        .iter()
        .flat_map(|t| t.interfaces.iter().map(|i| i.port))
        .collect();

    let store = Arc::new(MemoryStore::new(
        config.topologies.clone(),
        config.users.clone(),
    )?);

    let relay = relay::spawn(Arc::new(DiscardPlane));
    relay.switch_up(0, ports.into_iter().collect());

    let mut server = Server::new(config.listener(), store, relay);
    let addr = server.start().await?;

    tracing::info!(
        "simbridge serving {} topologies on {}",
        config.topologies.len(),
        addr
    );
    println!("Listening on {} - press Ctrl+C to stop", addr);

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    tracing::info!("Closing {} live sessions", server.session_count().await);
    server.broadcast_banner("server shutting down").await;
    server.stop().await?;

    // Let the accept loop wind down before exiting.
    while server.is_running().await {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    Ok(())
}

/// Print protocol information
fn print_info() {
    println!("simbridge protocol information");
    println!("==============================\n");
    println!("Default port:     {}", protocol::DEFAULT_PORT);
    println!("Max frame size:   {} bytes", protocol::MAX_FRAME_SIZE);
    println!("Banner capacity:  {} bytes", protocol::BANNER_CAPACITY);
    println!("Close capacity:   {} bytes", protocol::CLOSE_CAPACITY);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["simbridge", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_serve_port_override() {
        let cli = Cli::try_parse_from(["simbridge", "serve", "--port", "4000"]).unwrap();
        match cli.command {
            Commands::Serve { port } => assert_eq!(port, Some(4000)),
            _ => panic!("expected serve command"),
        }
    }
}
