use crate::lobby::{Lobby, MessageResponse, PlayerRequest};
use crate::transport::Address;
use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client of the lobby REST service.
#[derive(Debug, Clone)]
pub struct LobbyClient {
    base_url: String,
    http: reqwest::Client,
}

impl LobbyClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build the lobby client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Joins the lobby (creating it if needed) and returns its current state.
    pub async fn join(&self, player: &str) -> Result<Lobby> {
        info!("Joining lobby at {} as {}", self.base_url, player);
        let response = self.post("/api/lobbies/join", player).await?;
        response.lobby.context("Lobby missing from join response")
    }

    /// Leaves the lobby. `None` means the lobby closed because it became empty.
    pub async fn leave(&self, player: &str) -> Result<Option<Lobby>> {
        Ok(self.post("/api/lobbies/leave", player).await?.lobby)
    }

    /// The open lobby, if any.
    pub async fn current(&self) -> Result<Option<Lobby>> {
        let response = self
            .http
            .get(format!("{}/api/lobbies", self.base_url))
            .send()
            .await
            .context("Failed to reach lobby")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        response
            .error_for_status()
            .context("Lobby lookup rejected")?
            .json()
            .await
            .context("Failed to parse lobby")
    }

    /// Joins and returns the session endpoint the lobby advertises.
    pub async fn session_address(&self, player: &str) -> Result<Address> {
        let lobby = self.join(player).await?;
        info!("Lobby {} points to {}:{}", lobby.name, lobby.address, lobby.port);
        Ok(Address::new(lobby.address, lobby.port))
    }

    async fn post(&self, path: &str, player: &str) -> Result<MessageResponse> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&PlayerRequest {
                player: player.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("Failed to reach lobby at {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("Lobby rejected {}: {} {}", path, status, detail);
        }
        response
            .json()
            .await
            .context("Failed to parse lobby response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::{router, LobbyManager};

    async fn serve() -> LobbyClient {
        let app = router(LobbyManager::new("10.0.0.7", 9000, 2));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        LobbyClient::new(format!("http://{}", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_returns_advertised_endpoint() {
        let client = serve().await;
        assert!(client.current().await.unwrap().is_none());

        let address = client.session_address("alice").await.unwrap();
        assert_eq!(address, Address::new("10.0.0.7", 9000));
        assert_eq!(client.current().await.unwrap().unwrap().players, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_rejections_surface_as_errors() {
        let client = serve().await;
        client.join("alice").await.unwrap();
        assert!(client.join("alice").await.is_err());
        assert!(client.leave("alice").await.unwrap().is_none());
        assert!(client.leave("alice").await.is_err());
    }
}
