//! Direct state transfer node.
//!
//! Starts an off-chain channel listener for the configured identity and
//! keeps identity-verified inbound channels open until Ctrl-C.
//!
//!   dst-node --config node.toml
//!   dst-node --listen 127.0.0.1:9606 --private-key <hex>

mod config;

use clap::Parser;
use config::NodeConfig;
use dst_channel::new_session;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dst-node", version, about = "Off-chain channel node")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "DST_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Listener address announced to peers (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Listener endpoint path.
    #[arg(long)]
    endpoint: Option<String>,

    /// Hex private key.
    #[arg(long, env = "DST_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Maximum inbound channels waiting for pickup.
    #[arg(long)]
    max_conn: Option<usize>,

    /// Log every message read and written.
    #[arg(long)]
    read_write_logging: bool,
}

impl Args {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(listen) = self.listen {
            config.listener_addr = listen;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(key) = self.private_key {
            config.private_key = Some(key);
        }
        if let Some(max_conn) = self.max_conn {
            config.max_conn = max_conn;
        }
        config.read_write_logging |= self.read_write_logging;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    args.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    let self_id = config.identity()?;
    tracing::info!("Starting node {}", self_id);

    let mut session = new_session(&self_id, &config.session_config()?).await?;
    let mut channels = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            inst = session.channels.recv() => {
                let Some(inst) = inst else { break };
                tracing::info!("Channel from {}", inst.peer_id());
                channels.push(inst);
            }
        }
    }

    tracing::info!("Shutting down, closing {} channel(s)", channels.len());
    for inst in channels.iter().filter(|inst| inst.connected()) {
        if let Err(e) = inst.close().await {
            tracing::warn!("Error closing channel with {}: {}", inst.peer_id(), e);
        }
    }
    session.listener.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
