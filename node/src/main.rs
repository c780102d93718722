use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pong_node::control::StdinInput;
use pong_node::coord::CoordinationService;
use pong_node::{
    telemetry, Backend, ClusterPeer, ClusterSettings, Coordinator, CoordinatorSettings,
    CoordinatorState, HttpCoordinator, Side,
};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "pong-node", about = "Distributed Pong session node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the authoritative coordinator that terminals connect to
    Coordinator {
        #[arg(long)]
        backend: Option<Backend>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Paddles required before snapshots are broadcast
        #[arg(long)]
        players: Option<usize>,
        #[arg(long)]
        game_id: Option<String>,
    },
    /// Run a leaderless peer that plays through stdin
    Peer {
        /// Coordination service mount point
        #[arg(long, env = "PONG_COORD_URL", default_value = "http://localhost:8000/v1")]
        coord_url: String,
        #[arg(long)]
        side: Option<Side>,
        #[arg(long)]
        node_id: Option<String>,
        #[arg(long)]
        players: Option<usize>,
        #[arg(long)]
        game_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    match Cli::parse().command {
        Command::Coordinator {
            backend,
            host,
            port,
            players,
            game_id,
        } => {
            let mut settings =
                CoordinatorSettings::from_env().context("Invalid coordinator configuration")?;
            if let Some(backend) = backend {
                settings.backend = backend;
            }
            if let Some(host) = host {
                settings.address.host = host;
            }
            if let Some(port) = port {
                settings.address.port = port;
            }
            if let Some(players) = players {
                settings.num_players = players;
            }
            if let Some(game_id) = game_id {
                settings.game_id = game_id;
            }
            run_coordinator(settings).await
        }
        Command::Peer {
            coord_url,
            side,
            node_id,
            players,
            game_id,
        } => {
            let mut settings =
                ClusterSettings::from_env().context("Invalid cluster configuration")?;
            if let Some(side) = side {
                settings.side = side;
            }
            if let Some(node_id) = node_id {
                settings.node_id = node_id;
            }
            if let Some(players) = players {
                settings.capacity = players;
            }
            if let Some(game_id) = game_id {
                settings.game_id = game_id;
            }
            run_peer(coord_url, settings).await
        }
    }
}

async fn run_coordinator(settings: CoordinatorSettings) -> Result<()> {
    info!("=== Coordinator Starting ===");
    info!("[1/2] Binding {} endpoint on {}", settings.backend, settings.address);
    let players = settings.num_players;
    let coordinator = Coordinator::bind(settings)
        .await
        .context("Failed to bind coordinator")?;

    info!("[2/2] Waiting for {} players on {}", players, coordinator.local_address());
    coordinator.start()?;

    let mut state = coordinator.subscribe_state();
    tokio::select! {
        _ = state.wait_for(|s| *s == CoordinatorState::Closed) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, draining"),
    }
    coordinator.stop().await.context("Coordinator failed")?;
    info!("=== Coordinator Closed ===");
    Ok(())
}

async fn run_peer(coord_url: String, settings: ClusterSettings) -> Result<()> {
    info!("=== Peer {} Starting ===", settings.node_id);
    info!("[1/2] Using coordination service at {}", coord_url);
    let coord: Arc<dyn CoordinationService> = Arc::new(
        HttpCoordinator::new(coord_url, settings.timing.refresh_interval)
            .context("Failed to build the coordination client")?,
    );
    let side = settings.side;
    let peer = ClusterPeer::new(coord, settings).context("Invalid cluster timing")?;

    info!("[2/2] Joining as {}; type up/down/left/right, empty line to stop, q to quit", side);
    peer.start(Box::new(StdinInput::new(side)))
        .await
        .context("Failed to join the game")?;

    tokio::select! {
        _ = peer.wait() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, leaving"),
    }
    peer.stop().await;
    info!("=== Peer {} Stopped ===", peer.node_id());
    Ok(())
}
