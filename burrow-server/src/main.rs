//! Burrow Server - public endpoint of the reverse tunnel.
//!
//! Accepts ordinary HTTP(S) and WebSocket traffic on one listener and
//! forwards it, over persistent control channels, to clients behind NAT.

mod config;
mod proxy;
mod registry;
mod relay;
mod tunnel;
mod wsproxy;

use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use config::ServerConfig;
use registry::ClientRegistry;
use relay::RelayState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ClientRegistry>,
    pub relay: Arc<RelayState>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    info!("Starting burrow-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Tunnel connections: {}",
        if config.conn_token.is_some() {
            "token required"
        } else {
            "open"
        }
    );
    info!(
        "Public traffic: {}",
        if config.auth_token.is_some() {
            "token required"
        } else {
            "open"
        }
    );
    if let Some(rule) = &config.auth_rule {
        info!("Auth bypass rule: {}", rule.0.as_str());
    }
    if config.forward_host {
        info!("Forwarding the original Host header");
    }
    if config.buffer_request {
        info!("Request buffering enabled (duplex streaming disabled)");
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        registry: Arc::new(ClientRegistry::new()),
        relay: Arc::new(RelayState::new()),
    };

    let app = Router::new()
        .route("/__connect__", get(tunnel::connect_handler))
        .route("/__ping__", get(tunnel::ping_handler))
        .route("/__ws__", get(wsproxy::ws_tunnel_handler))
        .fallback(proxy::proxy_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Listening on {}", config.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    let live = state.registry.live_count();
    if live > 0 {
        info!("Shutting down, dropping {} connected client(s)", live);
    } else {
        info!("Shutting down");
    }
}
