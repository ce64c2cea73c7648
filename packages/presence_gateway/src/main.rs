use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod bridge;
mod config;
mod connector;
mod driver;
mod gateway;
mod upstream;
mod ws;

use crate::upstream::VoteBackend;
use crate::ws::WsState;

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Presence gateway: channel-multiplexed WebSocket front end for presence streams")]
struct Cli {
    /// Port for the web server (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides server.host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Path to gateway.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "gateway=debug,channel_mux=debug,tower_http=debug,info"
    } else {
        "gateway=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut config = config::resolve(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    info!("Starting presence gateway");

    let backend = VoteBackend::new();
    let gateway = gateway::spawn(Arc::new(backend.clone()), config.upstream.reconnect_delay());

    let state = WsState {
        gateway: gateway.clone(),
        send_capacity: config.server.send_channel_capacity,
    };
    let app = ws::router(state, config.server.static_dir.as_deref())
        .layer(TraceLayer::new_for_http());

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Presence gateway listening on http://{}", actual_addr);
    info!("  GET /ws     - multiplexed WebSocket");
    info!("  GET /health - liveness probe");
    if let Some(dir) = &config.server.static_dir {
        info!("  GET /       - static files from {}", dir.display());
    }

    // Sessions are closed before the listener stops; that ends the upgraded sockets
    let shutdown_gateway = gateway.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, closing sessions and upstream streams...");
        shutdown_gateway.shutdown().await;
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    backend.close();

    info!("Shutdown complete");
    server_result
}
