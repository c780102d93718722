//! Pre-game rendezvous: a single lobby players join before the session starts.

use crate::error::LobbyError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Name given to a lobby created implicitly by the first join.
pub const AUTO_LOBBY_NAME: &str = "Auto-Created Lobby";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lobby {
    pub id: String,
    pub name: String,
    pub max_players: usize,
    /// Number of joined players, kept in step with `players`.
    pub current_players: usize,
    pub players: Vec<String>,
    /// Endpoint of the game session players should connect to.
    pub address: String,
    pub port: u16,
}

impl Lobby {
    fn new(name: String, max_players: usize, address: String, port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            max_players,
            current_players: 0,
            players: Vec::new(),
            address,
            port,
        }
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLobbyRequest {
    pub name: String,
    #[serde(default = "default_max_players")]
    pub max_players: usize,
}

fn default_max_players() -> usize {
    crate::config::DEFAULT_PLAYERS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRequest {
    pub player: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
    pub lobby: Option<Lobby>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Holds at most one lobby at a time.
#[derive(Clone)]
pub struct LobbyManager {
    lobby: Arc<RwLock<Option<Lobby>>>,
    address: String,
    port: u16,
    default_capacity: usize,
}

impl LobbyManager {
    /// `address`/`port` are advertised to players as the session endpoint.
    pub fn new(address: impl Into<String>, port: u16, default_capacity: usize) -> Self {
        Self {
            lobby: Arc::new(RwLock::new(None)),
            address: address.into(),
            port,
            default_capacity,
        }
    }

    pub async fn create(&self, name: &str, max_players: usize) -> Result<Lobby, LobbyError> {
        let mut slot = self.lobby.write().await;
        if slot.is_some() {
            return Err(LobbyError::AlreadyExists);
        }
        let lobby = Lobby::new(name.to_string(), max_players, self.address.clone(), self.port);
        info!("Created lobby {} ({}) for {} players", lobby.name, lobby.id, max_players);
        *slot = Some(lobby.clone());
        Ok(lobby)
    }

    pub async fn get(&self) -> Option<Lobby> {
        self.lobby.read().await.clone()
    }

    /// Adds `player`, creating a default lobby if none is open.
    pub async fn join(&self, player: &str) -> Result<Lobby, LobbyError> {
        let mut slot = self.lobby.write().await;
        let lobby = slot.get_or_insert_with(|| {
            info!("No lobby open, creating one for {}", player);
            Lobby::new(
                AUTO_LOBBY_NAME.to_string(),
                self.default_capacity,
                self.address.clone(),
                self.port,
            )
        });
        if lobby.players.iter().any(|p| p == player) {
            return Err(LobbyError::AlreadyJoined(player.to_string()));
        }
        if lobby.is_full() {
            return Err(LobbyError::Full);
        }
        lobby.players.push(player.to_string());
        lobby.current_players = lobby.players.len();
        info!("{} joined lobby {} ({}/{})", player, lobby.name, lobby.current_players, lobby.max_players);
        Ok(lobby.clone())
    }

    /// Removes `player`. Returns the lobby, or `None` once the last player left and it closed.
    pub async fn leave(&self, player: &str) -> Result<Option<Lobby>, LobbyError> {
        let mut slot = self.lobby.write().await;
        let lobby = slot.as_mut().ok_or(LobbyError::NoLobby)?;
        let before = lobby.players.len();
        lobby.players.retain(|p| p != player);
        if lobby.players.len() == before {
            return Err(LobbyError::NotMember(player.to_string()));
        }
        lobby.current_players = lobby.players.len();
        info!("{} left lobby {}", player, lobby.name);

        if lobby.players.is_empty() {
            info!("Lobby {} is empty, closing", lobby.name);
            *slot = None;
            return Ok(None);
        }
        Ok(Some(lobby.clone()))
    }
}

type Rejection = (StatusCode, Json<ErrorResponse>);

fn reject(err: LobbyError) -> Rejection {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            detail: err.to_string(),
        }),
    )
}

/// REST surface of the lobby.
pub fn router(manager: LobbyManager) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/api/lobbies", post(create_lobby).get(get_lobby))
        .route("/api/lobbies/join", post(join_lobby))
        .route("/api/lobbies/leave", post(leave_lobby))
        .with_state(manager)
}

async fn health_check() -> &'static str {
    "Lobby is alive"
}

async fn create_lobby(
    State(manager): State<LobbyManager>,
    Json(request): Json<CreateLobbyRequest>,
) -> Result<Json<Lobby>, Rejection> {
    manager
        .create(&request.name, request.max_players)
        .await
        .map(Json)
        .map_err(reject)
}

async fn get_lobby(State(manager): State<LobbyManager>) -> impl IntoResponse {
    match manager.get().await {
        Some(lobby) => (StatusCode::OK, Json(Some(lobby))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

async fn join_lobby(
    State(manager): State<LobbyManager>,
    Json(request): Json<PlayerRequest>,
) -> Result<Json<MessageResponse>, Rejection> {
    let lobby = manager.join(&request.player).await.map_err(reject)?;
    Ok(Json(MessageResponse {
        message: format!("{} joined the lobby.", request.player),
        lobby: Some(lobby),
    }))
}

async fn leave_lobby(
    State(manager): State<LobbyManager>,
    Json(request): Json<PlayerRequest>,
) -> Result<Json<MessageResponse>, Rejection> {
    let lobby = manager.leave(&request.player).await.map_err(reject)?;
    let message = match lobby {
        Some(_) => format!("{} left the lobby.", request.player),
        None => format!("{} left the lobby. Lobby is now empty and closed.", request.player),
    };
    Ok(Json(MessageResponse { message, lobby }))
}
