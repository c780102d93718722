use anyhow::{Context, Result};
use clap::Parser;
use pong_node::control::StdinInput;
use pong_node::event::EventBody;
use pong_node::rendezvous::LobbyClient;
use pong_node::{telemetry, Backend, Side, Terminal, TerminalSettings, TerminalState};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Snapshots between two status lines.
const STATUS_EVERY: u64 = 60;

#[derive(Parser)]
#[command(name = "pong-client", about = "Headless Pong terminal")]
struct Cli {
    /// Lobby to ask for the session address, e.g. http://localhost:8000
    #[arg(long, env = "PONG_LOBBY_URL")]
    lobby_url: Option<String>,
    #[arg(long)]
    backend: Option<Backend>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    side: Option<Side>,
    #[arg(long)]
    player_id: Option<String>,
    #[arg(long)]
    game_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    info!("=== Pong Client Starting ===");

    let mut settings = TerminalSettings::from_env().context("Invalid terminal configuration")?;
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }
    if let Some(host) = cli.host {
        settings.address.host = host;
    }
    if let Some(port) = cli.port {
        settings.address.port = port;
    }
    if let Some(side) = cli.side {
        settings.side = side;
    }
    if let Some(player_id) = cli.player_id {
        settings.player_id = player_id;
    }
    if let Some(game_id) = cli.game_id {
        settings.game_id = game_id;
    }

    let lobby = cli.lobby_url.map(LobbyClient::new).transpose()?;
    if let Some(lobby) = &lobby {
        info!("[1/3] Looking up the session through the lobby...");
        settings.address = lobby
            .session_address(&settings.player_id)
            .await
            .context("Lobby lookup failed")?;
    } else {
        info!("[1/3] No lobby configured, using {}", settings.address);
    }

    info!("[2/3] Connecting to {} over {}...", settings.address, settings.backend);
    let player_id = settings.player_id.clone();
    let side = settings.side;
    let terminal = Terminal::connect(settings)
        .await
        .context("Failed to connect to the coordinator")?;

    let mut events = terminal.subscribe();
    tokio::spawn(async move {
        let mut snapshots = 0u64;
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let EventBody::TimeElapsed(tick) = &event.body {
                        snapshots += 1;
                        if snapshots % STATUS_EVERY == 0 {
                            let ball = &tick.game_state.ball;
                            info!(
                                "Ball at ({:.0}, {:.0}), {} paddles",
                                ball.x,
                                ball.y,
                                tick.game_state.paddles.len()
                            );
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("[3/3] Joining as {}; type up/down/left/right, empty line to stop, q to quit", side);
    terminal
        .start(Box::new(StdinInput::new(side)))
        .await
        .context("Failed to join the game")?;

    let mut state = terminal.subscribe_state();
    tokio::select! {
        _ = state.wait_for(|s| *s == TerminalState::Closed) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, leaving"),
    }
    let outcome = terminal.stop().await;

    if let Some(lobby) = &lobby {
        if let Err(e) = lobby.leave(&player_id).await {
            warn!("Failed to leave the lobby: {:#}", e);
        }
    }
    outcome.context("Session ended with an error")?;
    info!("=== Pong Client Stopped ===");
    Ok(())
}
