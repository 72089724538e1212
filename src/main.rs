//! brokerlink - command line client for a STOMP broker session
//!
//! Connects with the bearer token from the environment variable named in the
//! configuration, then listens on or publishes to destinations.

use brokerlink::config::ClientConfig;
use brokerlink::observability::init_default_logging;
use brokerlink::session::{ClientEvent, Credential};
use brokerlink::BrokerClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Resilient broker session client
#[derive(Parser)]
#[command(name = "brokerlink")]
#[command(about = "Resilient STOMP broker session client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKERLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print deliveries until Ctrl-C
    Listen {
        /// Destination to subscribe to (repeatable)
        #[arg(short, long = "destination", required = true)]
        destinations: Vec<String>,
    },
    /// Publish one JSON payload
    Publish {
        #[arg(short, long)]
        destination: String,
        /// JSON payload
        #[arg(short, long)]
        payload: String,
        /// How long to wait for the connection
        #[arg(long, default_value_t = 15)]
        timeout_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { destinations } => run_listen(config, destinations).await,
        Commands::Publish {
            destination,
            payload,
            timeout_secs,
        } => run_publish(config, destination, payload, Duration::from_secs(timeout_secs)).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["brokerlink.toml", "config/brokerlink.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create brokerlink.toml".into())
}

async fn connect(config: &ClientConfig) -> Result<BrokerClient, Box<dyn std::error::Error>> {
    let token = config.get_token()?;
    let client = BrokerClient::from_config(config)?;
    client.connect(Credential::new(token)).await?;
    Ok(client)
}

async fn run_listen(config: ClientConfig, destinations: Vec<String>) -> CliResult {
    let client = connect(&config).await?;

    let mut subscriptions = Vec::with_capacity(destinations.len());
    for destination in &destinations {
        let subscription = client
            .subscribe(destination, |delivery| {
                println!(
                    "{}",
                    serde_json::json!({
                        "destination": delivery.destination,
                        "message_id": delivery.message_id,
                        "payload": delivery.payload,
                    })
                );
            })
            .await?;
        subscriptions.push(subscription);
    }
    info!(count = subscriptions.len(), "Listening, press Ctrl-C to stop");

    let mut events = client.events();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(ClientEvent::StateChanged(state)) if state.is_closed() => {
                    warn!(state = %state, "Session closed");
                    break;
                }
                Ok(ClientEvent::Diagnostic(e)) if e.is_recoverable() => {
                    warn!(error = %e, "Session diagnostic, retrying")
                }
                Ok(ClientEvent::Diagnostic(e)) => error!(error = %e, "Session diagnostic"),
                Ok(_) => {}
                Err(e) => warn!("Event stream lagged: {}", e),
            }
        }
    }

    if let Ok(stats) = client.stats().await {
        info!(
            healthy = stats.is_healthy(),
            reconnects = stats.reconnect_count,
            "Session summary"
        );
    }
    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    client.disconnect().await;
    Ok(())
}

async fn run_publish(config: ClientConfig, destination: String, payload: String, timeout: Duration) -> CliResult {
    let payload: serde_json::Value = serde_json::from_str(&payload)?;
    let client = connect(&config).await?;

    client.wait_until_connected(timeout).await?;
    client.publish(&destination, &payload)?;

    // Round-trip through the session so the SEND is written before DISCONNECT
    let stats = client.stats().await?;
    info!(
        destination = %destination,
        queued = stats.queued_messages,
        healthy = stats.is_healthy(),
        "Published"
    );
    client.disconnect().await;
    Ok(())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> CliResult {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}
