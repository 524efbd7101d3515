//! PrintMesh Node - network presence daemon for thermal printer nodes
//!
//! Bootstraps the node:
//! - Loads `.env` and the TOML configuration
//! - Routes every `tracing` event through the async log pipeline
//! - Discovers the node identity and connects to the broker over MQTT
//! - Runs the presence driver until Ctrl-C, then withdraws gracefully

use anyhow::{Context, Result};
use printmesh_node::clock::SystemClock;
use printmesh_node::config::NodeConfig;
use printmesh_node::identity::NodeIdentity;
use printmesh_node::logging::LogPipeline;
use printmesh_node::mqtt::RumqttConnector;
use printmesh_node::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const INBOX_CAPACITY: usize = 16;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("printmesh_node=info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Queue sizing comes from the config, so loading it logs straight to stderr
    let bootstrap = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .finish();
    let config = tracing::subscriber::with_default(bootstrap, NodeConfig::load)
        .context("Failed to load configuration")?;

    // Initialize logging
    let pipeline = LogPipeline::new();
    let pipelined = pipeline.initialize(config.log_settings(), Box::new(std::io::stdout()));
    if pipelined {
        tracing_subscriber::fmt()
            .with_writer(pipeline.handle())
            .with_env_filter(env_filter())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stdout)
            .with_env_filter(env_filter())
            .init();
        warn!("Log pipeline unavailable, writing diagnostics directly to stdout");
    }

    info!("PrintMesh node starting...");

    let identity = NodeIdentity::discover(&config.node).context("Failed to discover node identity")?;

    let (inbox_tx, mut inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let node = Node::start(
        config,
        identity,
        Arc::new(RumqttConnector::new()),
        Arc::new(SystemClock::new()),
        Some(inbox_tx),
    )
    .context("Failed to start node")?;

    // The print engine is external; hand messages over through the log for now.
    tokio::spawn(async move {
        while let Some(message) = inbox_rx.recv().await {
            info!(
                "print job from {}: {}",
                message.sender.as_deref().unwrap_or("anonymous"),
                message.message
            );
        }
    });

    node.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler failed, running until killed: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
    .context("Node execution failed")?;

    // Let the offline record and DISCONNECT leave the socket.
    tokio::time::sleep(Duration::from_millis(300)).await;
    pipeline.flush(Duration::from_secs(1));
    Ok(())
}
