//! Backhaul CLI - reverse tunnel relay and agent
//!
//! `backhaul relay` runs the public endpoint; `backhaul agent` runs inside
//! the private network and dials both the relay and the backend.

mod config;

use anyhow::{Context, Result};
use backhaul_agent::{Agent, AgentConfig};
use backhaul_relay::RelayServer;
use backhaul_transport::TransportConnector;
use backhaul_transport_websocket::{WebSocketConnector, WebSocketListener};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{agent_config, load_config_file, relay_settings, ConfigFile, RelaySettings};

/// Backhaul - expose a private WebSocket backend through a public relay
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Backhaul - expose a private WebSocket backend through a public relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept clients and the agent on a public address
    #[command(long_about = r#"
Accept WebSocket clients on a public address and multiplex them over the
single agent connection.

EXAMPLES:
  # Listen on every interface
  backhaul relay --listen 0.0.0.0:8765

  # Only upgrade requests on /tunnel
  backhaul relay --listen 0.0.0.0:8765 --path /tunnel

ENVIRONMENT VARIABLES:
  BACKHAUL_LISTEN    Address to listen on (host:port)
  BACKHAUL_PATH      WebSocket path to accept
"#)]
    Relay {
        /// Address to listen on (e.g., 0.0.0.0:8765)
        #[arg(long, env = "BACKHAUL_LISTEN")]
        listen: Option<SocketAddr>,

        /// WebSocket path to accept (default: any)
        #[arg(long, env = "BACKHAUL_PATH")]
        path: Option<String>,
    },

    /// Connect to the relay and forward its clients to the backend
    #[command(long_about = r#"
Connect to a relay, identify as its agent and open one backend connection
per relayed client. Reconnects to the relay forever with a fixed delay.

EXAMPLES:
  backhaul agent --relay wss://relay.example.com/tunnel \
    --backend ws://127.0.0.1:8000

  # Using a config file
  backhaul agent --config backhaul.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_RELAY        Relay URL (ws:// or wss://)
  BACKHAUL_BACKEND      Backend URL (ws:// or wss://)
  BACKHAUL_RETRY_DELAY  Seconds between relay connection attempts
"#)]
    Agent {
        /// Relay URL (e.g., wss://relay.example.com/tunnel)
        #[arg(long, env = "BACKHAUL_RELAY")]
        relay: Option<String>,

        /// Backend URL (e.g., ws://127.0.0.1:8000)
        #[arg(long, env = "BACKHAUL_BACKEND")]
        backend: Option<String>,

        /// Seconds to wait before reconnecting to the relay (default: 5)
        #[arg(long, env = "BACKHAUL_RETRY_DELAY")]
        retry_delay: Option<u64>,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn run_relay(settings: RelaySettings) -> Result<()> {
    let listener = WebSocketListener::bind(settings.listen, settings.websocket)
        .await
        .context("Failed to start relay listener")?;

    let server = RelayServer::new(listener);

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let connector: Arc<dyn TransportConnector> = Arc::new(WebSocketConnector::new());
    let agent = Agent::new(config, connector.clone(), connector);

    let config = agent.config();
    info!("Relay: {}", config.relay_url);
    info!("Backend: {}", config.backend_url);
    info!("Retry delay: {:?}", config.retry_delay);

    tokio::select! {
        _ = agent.run() => {
            error!("Agent supervisor stopped unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file: Option<ConfigFile> = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Some(load_config_file(path)?)
        }
        None => None,
    };

    match cli.command {
        Commands::Relay { listen, path } => {
            info!("Backhaul relay starting...");
            let settings = relay_settings(listen, path, file.as_ref())
                .context("Failed to build relay configuration")?;
            run_relay(settings).await?;
        }
        Commands::Agent {
            relay,
            backend,
            retry_delay,
        } => {
            info!("Backhaul agent starting...");
            let config = agent_config(relay, backend, retry_delay, file.as_ref())
                .context("Failed to build agent configuration")?;
            run_agent(config).await?;
        }
    }

    info!("Backhaul stopped");
    Ok(())
}
