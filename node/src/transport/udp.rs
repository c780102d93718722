use super::{Address, Incoming, PeerHandle, Server, Session};
use crate::error::TransportError;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Receive buffer size for a single datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Largest payload that fits in one IPv4 UDP datagram.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65507;

fn should_drop(drop_rate: f64) -> bool {
    drop_rate > 0.0 && rand::random::<f64>() < drop_rate
}

async fn send_datagram(
    socket: &UdpSocket,
    target: SocketAddr,
    payload: &[u8],
    drop_rate: f64,
) -> Result<usize, TransportError> {
    if payload.len() > MAX_DATAGRAM_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            limit: MAX_DATAGRAM_PAYLOAD,
        });
    }
    if should_drop(drop_rate) {
        debug!("Dropping {} bytes to {}", payload.len(), target);
        return Ok(payload.len());
    }
    Ok(socket.send_to(payload, target).await?)
}

/// Datagram server. Peers are learned from the source address of inbound datagrams.
pub struct UdpServer {
    socket: UdpSocket,
    local: Address,
    peers: Mutex<HashSet<SocketAddr>>,
    drop_rate: f64,
    shutdown: Shutdown,
}

impl UdpServer {
    pub async fn bind(address: &Address, drop_rate: f64) -> Result<Self, TransportError> {
        let target = address.resolve().await?;
        let socket = UdpSocket::bind(target).await.map_err(|e| TransportError::Bind {
            address: address.clone(),
            reason: e.to_string(),
        })?;
        let local = Address::from(socket.local_addr()?);

        Ok(Self {
            socket,
            local,
            peers: Mutex::new(HashSet::new()),
            drop_rate,
            shutdown: Shutdown::new(),
        })
    }
}

#[async_trait]
impl Server for UdpServer {
    fn local_address(&self) -> Address {
        self.local.clone()
    }

    async fn receive(&self) -> Result<Option<Incoming>, TransportError> {
        if self.shutdown.is_triggered() {
            return Ok(None);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        tokio::select! {
            _ = self.shutdown.wait() => Ok(None),
            received = self.socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                buf.truncate(len);
                self.peers.lock().await.insert(from);
                Ok(Some(Incoming::Message {
                    peer: PeerHandle::Datagram(from),
                    payload: buf,
                }))
            }
        }
    }

    async fn send(&self, peer: &PeerHandle, payload: &[u8]) -> Result<usize, TransportError> {
        let target = match peer {
            PeerHandle::Datagram(addr) => *addr,
            _ => return Err(TransportError::PeerUnknown(peer.clone())),
        };
        if !self.peers.lock().await.contains(&target) {
            return Err(TransportError::PeerUnknown(peer.clone()));
        }
        send_datagram(&self.socket, target, payload, self.drop_rate).await
    }

    async fn forget(&self, peer: &PeerHandle) {
        if let PeerHandle::Datagram(addr) = peer {
            self.peers.lock().await.remove(addr);
        }
    }

    async fn close(&self) {
        self.shutdown.trigger();
    }
}

/// Datagram client bound to one remote address.
pub struct UdpSession {
    socket: UdpSocket,
    remote: Address,
    target: SocketAddr,
    drop_rate: f64,
    shutdown: Shutdown,
}

impl UdpSession {
    pub async fn connect(address: &Address, drop_rate: f64) -> Result<Self, TransportError> {
        let target = address.resolve().await?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;

        Ok(Self {
            socket,
            remote: address.clone(),
            target,
            drop_rate,
            shutdown: Shutdown::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Session for UdpSession {
    fn remote_address(&self) -> &Address {
        &self.remote
    }

    async fn send(&self, payload: &[u8]) -> Result<usize, TransportError> {
        send_datagram(&self.socket, self.target, payload, self.drop_rate).await
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(None);
            }
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            tokio::select! {
                _ = self.shutdown.wait() => return Ok(None),
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    if from != self.target && !self.remote.matches(&from) {
                        let rejected = TransportError::UnexpectedPeer {
                            expected: self.remote.clone(),
                            actual: from.to_string(),
                        };
                        warn!("{}", rejected);
                        continue;
                    }
                    buf.truncate(len);
                    return Ok(Some(buf));
                }
            }
        }
    }

    async fn close(&self) {
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn loopback_server(drop_rate: f64) -> UdpServer {
        UdpServer::bind(&Address::new("127.0.0.1", 0), drop_rate).await.unwrap()
    }

    async fn expect_message(server: &UdpServer) -> (PeerHandle, Vec<u8>) {
        let incoming = tokio::time::timeout(Duration::from_secs(2), server.receive())
            .await
            .expect("receive timed out")
            .unwrap()
            .expect("server closed");
        match incoming {
            Incoming::Message { peer, payload } => (peer, payload),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_reply() {
        let server = loopback_server(0.0).await;
        let session = UdpSession::connect(&server.local_address(), 0.0).await.unwrap();

        session.send(b"ping").await.unwrap();
        let (peer, payload) = expect_message(&server).await;
        assert_eq!(payload, b"ping");

        server.send(&peer, b"pong").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), session.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let server = loopback_server(0.0).await;
        let result = UdpServer::bind(&server.local_address(), 0.0).await;
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let server = loopback_server(0.0).await;
        let stranger = PeerHandle::Datagram("127.0.0.1:1".parse().unwrap());
        let result = server.send(&stranger, b"hi").await;
        assert!(matches!(result, Err(TransportError::PeerUnknown(_))));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let server = loopback_server(0.0).await;
        let session = UdpSession::connect(&server.local_address(), 0.0).await.unwrap();
        // One byte past what IPv4 UDP can carry, still below the receive buffer.
        let payload = vec![0u8; MAX_DATAGRAM_PAYLOAD + 1];
        assert!(matches!(
            session.send(&payload).await,
            Err(TransportError::PayloadTooLarge { size, limit })
                if size == 65508 && limit == MAX_DATAGRAM_PAYLOAD
        ));
    }

    #[tokio::test]
    async fn test_forgotten_peer_is_unknown() {
        let server = loopback_server(0.0).await;
        let session = UdpSession::connect(&server.local_address(), 0.0).await.unwrap();
        session.send(b"hello").await.unwrap();
        let (peer, _) = expect_message(&server).await;
        server.send(&peer, b"welcome").await.unwrap();

        server.forget(&peer).await;
        assert!(matches!(
            server.send(&peer, b"late").await,
            Err(TransportError::PeerUnknown(_))
        ));
    }

    #[tokio::test]
    async fn test_session_ignores_datagrams_from_other_addresses() {
        let server = loopback_server(0.0).await;
        let session = UdpSession::connect(&server.local_address(), 0.0).await.unwrap();
        session.send(b"hello").await.unwrap();
        let (peer, _) = expect_message(&server).await;

        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session_addr = SocketAddr::new("127.0.0.1".parse().unwrap(), session.local_addr().unwrap().port());
        intruder.send_to(b"forged", session_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.send(&peer, b"genuine").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), session.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Some(b"genuine".to_vec()));
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let server = Arc::new(loopback_server(0.0).await);
        let pending = {
            let server = server.clone();
            tokio::spawn(async move { server.receive().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drop_rate_loses_datagrams() {
        let server = loopback_server(0.0).await;
        let session = UdpSession::connect(&server.local_address(), 0.9).await.unwrap();

        for _ in 0..50 {
            assert_eq!(session.send(b"x").await.unwrap(), 1);
        }

        let mut delivered = 0;
        while let Ok(Ok(Some(_))) =
            tokio::time::timeout(Duration::from_millis(200), server.receive()).await
        {
            delivered += 1;
        }
        assert!(delivered < 50);
    }
}
