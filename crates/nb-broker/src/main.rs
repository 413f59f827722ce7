//! natbridge broker daemon
//!
//! Listens for outbound control connections from client agents and exposes
//! their local TCP services through broker-side forwarding ports.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nb_broker::admin::AdminServer;
use nb_broker::forward;
use nb_broker::requests::RequestTable;
use nb_broker::server::ControlServer;
use nb_broker::BrokerState;
use nb_core::config::{self, BrokerConfig};
use nb_core::tls;

#[derive(Parser)]
#[command(name = "nb-broker")]
#[command(about = "natbridge broker daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for the control listener (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

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

    tracing::info!("natbridge broker starting...");

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_dir().join("broker.toml");
        if default_path.exists() {
            config::load_config(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        } else {
            tracing::info!("Using default configuration");
            BrokerConfig::default()
        }
    };
    config.validate().context("Invalid service configuration")?;

    // Override bind address if specified
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    // Certificate material is a startup requirement; nothing is accepted
    // without it.
    let acceptor = tls::build_acceptor(
        &config.cert_path,
        &config.key_path,
        &config.ca_path,
        config.crl_path.as_deref(),
    )
    .context("Failed to build TLS acceptor")?;

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    // Bind permanent services and seed their pending requests
    let requests = Arc::new(RequestTable::new());
    let forwards = forward::start_services(&config, &requests, &cancel)
        .await
        .context("Failed to start forwarding services")?;

    let state = Arc::new(BrokerState::new(config.clone(), requests, forwards));

    // Administrative channel, if configured
    if let Some(admin_addr) = &config.admin_bind_address {
        let admin = AdminServer::bind(
            Arc::clone(&state),
            acceptor.clone(),
            cancel.clone(),
            admin_addr,
        )
        .await?;
        tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                tracing::error!("Admin channel failed: {}", e);
            }
        });
    }

    // Run the control listener
    let server = ControlServer::bind(state, acceptor, cancel.clone(), &bind_addr).await?;
    server.run().await?;

    tracing::info!("Broker shutdown complete");
    Ok(())
}
