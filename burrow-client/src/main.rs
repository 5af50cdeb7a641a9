//! Burrow Client - NAT-side component of the reverse tunnel.
//!
//! Holds a persistent control connection to the public server and executes
//! forwarded requests against a local origin.

mod config;
mod executor;
mod health;
mod tunnel;
mod wsproxy;

use anyhow::Result;
use clap::Parser;
use config::ClientConfig;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    info!("Starting burrow-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Client id: {}", config.client_id);
    info!("Server: {}", config.remote_url);
    info!("Forwarding to {}", config.local_url);

    // Fail fast on an unusable LOCAL_URL.
    let origin = config.local_origin()?;

    if config.verify_upstream {
        match health::verify_upstream(&origin.addr, 5).await {
            Ok(latency) => info!("Local origin {} is reachable ({:?})", origin.addr, latency),
            Err(e) => warn!("Local origin {} is not reachable: {}", origin.addr, e),
        }
    }

    tunnel::run_tunnel_loop(Arc::new(config)).await
}
