use crate::error::SessionError;
use crate::model::Side;
use crate::transport::PeerHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Peers known to a coordinator and the paddle side each one owns.
/// Every access goes through the lock so broadcasts never see a half-applied change.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerHandle, Option<Side>>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a peer without a side. Already known peers keep theirs.
    pub async fn register(&self, peer: PeerHandle) {
        self.peers.write().await.entry(peer).or_insert(None);
    }

    /// Binds `side` to `peer`, registering the peer if needed.
    ///
    /// Fails if another peer owns the side or this peer already owns a different one.
    pub async fn bind_side(&self, peer: &PeerHandle, side: Side) -> Result<(), SessionError> {
        let mut peers = self.peers.write().await;
        let taken = peers
            .iter()
            .any(|(other, owned)| other != peer && *owned == Some(side));
        if taken {
            return Err(SessionError::SideTaken(side));
        }
        let slot = peers.entry(peer.clone()).or_insert(None);
        match *slot {
            Some(owned) if owned != side => Err(SessionError::SideTaken(owned)),
            _ => {
                *slot = Some(side);
                Ok(())
            }
        }
    }

    pub async fn side_of(&self, peer: &PeerHandle) -> Option<Side> {
        self.peers.read().await.get(peer).copied().flatten()
    }

    /// Forgets the peer. Returns the side it owned, if any.
    pub async fn remove(&self, peer: &PeerHandle) -> Option<Side> {
        self.peers.write().await.remove(peer).flatten()
    }

    pub async fn handles(&self) -> Vec<PeerHandle> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerHandle {
        PeerHandle::Datagram(format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[tokio::test]
    async fn test_bind_and_lookup() {
        let registry = PeerRegistry::new();

        registry.bind_side(&peer(1), Side::Left).await.unwrap();
        registry.register(peer(2)).await;

        assert_eq!(registry.side_of(&peer(1)).await, Some(Side::Left));
        assert_eq!(registry.side_of(&peer(2)).await, None);
        assert_eq!(registry.side_of(&peer(3)).await, None);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_side_cannot_be_taken_twice() {
        let registry = PeerRegistry::new();
        registry.bind_side(&peer(1), Side::Left).await.unwrap();

        assert!(matches!(
            registry.bind_side(&peer(2), Side::Left).await,
            Err(SessionError::SideTaken(Side::Left))
        ));
        // Re-joining with the same side is harmless, switching is not.
        registry.bind_side(&peer(1), Side::Left).await.unwrap();
        assert!(registry.bind_side(&peer(1), Side::Right).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_releases_side() {
        let registry = PeerRegistry::new();
        registry.bind_side(&peer(1), Side::Right).await.unwrap();

        assert_eq!(registry.remove(&peer(1)).await, Some(Side::Right));
        assert_eq!(registry.remove(&peer(1)).await, None);
        assert!(registry.is_empty().await);
        registry.bind_side(&peer(2), Side::Right).await.unwrap();
    }
}
