//! natbridge agent daemon
//!
//! Polls the broker for pending tunnel requests over outbound control
//! connections; no inbound connectivity to this machine is needed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nb_agent::{CycleOutcome, TunnelConnector};
use nb_core::config::{self, AgentConfig};
use nb_protocol::PROTOCOL_VERSION;

#[derive(Parser)]
#[command(name = "nb-agent")]
#[command(about = "natbridge client agent")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client name (overrides config; defaults to hostname)
    #[arg(short, long)]
    name: Option<String>,

    /// Broker address as host:port (overrides config)
    #[arg(short, long)]
    broker: Option<String>,

    /// Keep polling forever instead of stopping after one cycle
    #[arg(short, long)]
    infinite: bool,

    /// Seconds between polling cycles (overrides config)
    #[arg(long)]
    interval: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "=== natbridge agent (protocol version {}) ===",
        PROTOCOL_VERSION
    );

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("agent.toml"));

    let mut config = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        AgentConfig::default()
    };

    // Apply command-line overrides
    if let Some(name) = args.name {
        config.name = Some(name);
    }
    if let Some(broker) = args.broker {
        config.broker_address = broker;
    }
    if args.infinite {
        config.infinite = true;
    }
    if let Some(interval) = args.interval {
        config.retry_interval = std::time::Duration::from_secs(interval);
    }

    // Certificate problems are fatal before the first connection attempt.
    let connector = TunnelConnector::new(config.clone())
        .context("Failed to build TLS connector from agent configuration")?;

    loop {
        match connector.run_cycle().await {
            Ok(CycleOutcome::TunnelStarted(tunnel)) => {
                if config.infinite {
                    // The tunnel drains on its own task; the next cycle
                    // opens a fresh control connection.
                    drop(tunnel);
                } else {
                    let _ = tunnel.await;
                }
            }
            Ok(CycleOutcome::NotInterested) => {}
            Err(e) => {
                tracing::error!("Connection cycle failed: {}", e);
            }
        }

        if !config.infinite {
            break;
        }
        tokio::time::sleep(config.retry_interval).await;
    }

    Ok(())
}
