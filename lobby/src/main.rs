use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use pong_node::config::{DEFAULT_PLAYERS, DEFAULT_PORT};
use pong_node::coord::{service, MemCoordinator};
use pong_node::lobby::{self, LobbyManager};
use pong_node::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Parser)]
#[command(name = "pong-lobby", about = "Pong lobby and coordination service")]
struct Cli {
    /// Interface the HTTP API binds to
    #[arg(long, env = "LOBBY_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "LOBBY_PORT", default_value_t = 8000)]
    port: u16,
    /// Session address advertised to players
    #[arg(long, env = "PONG_HOST", default_value = "127.0.0.1")]
    session_host: String,
    #[arg(long, env = "PONG_PORT", default_value_t = DEFAULT_PORT)]
    session_port: u16,
    /// Capacity of lobbies created by the first join
    #[arg(long, env = "PONG_PLAYERS", default_value_t = DEFAULT_PLAYERS)]
    players: usize,
    /// How often expired coordination leases are swept
    #[arg(long, default_value_t = 100)]
    sweep_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    info!("Lobby starting...");

    let manager = LobbyManager::new(cli.session_host.clone(), cli.session_port, cli.players);
    let store = MemCoordinator::new();
    store.start(Duration::from_millis(cli.sweep_ms));

    let app = Router::new()
        .merge(lobby::router(manager))
        .nest("/v1", service::router(Arc::new(store.clone())))
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Lobby listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /                   - Health check");
    info!("  POST /api/lobbies        - Create the lobby");
    info!("  GET  /api/lobbies        - Show the open lobby");
    info!("  POST /api/lobbies/join   - Join (creates the lobby if needed)");
    info!("  POST /api/lobbies/leave  - Leave");
    info!("  POST /v1/lease/*, /v1/kv/* and GET /v1/watch - Coordination service");
    info!(
        "Players will be sent to {}:{}",
        cli.session_host, cli.session_port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Lobby shutting down");
        })
        .await
        .context("Lobby server failed")?;
    store.stop();
    Ok(())
}
