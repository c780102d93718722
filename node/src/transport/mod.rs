//! One transport interface, three interchangeable backends.
//!
//! A [`Server`] accepts many peers and addresses them through opaque
//! [`PeerHandle`]s; a [`Session`] is one client connection to a server.

mod broker;
mod stream;
mod udp;

pub use broker::{BrokerServer, BrokerSession};
pub use stream::{StreamServer, StreamSession};
pub use udp::{UdpServer, UdpSession, MAX_DATAGRAM_PAYLOAD, MAX_DATAGRAM_SIZE};

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

/// Host/port pair. Two addresses are equivalent when they resolve to the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("localhost", port)
    }

    /// Same address with its port replaced.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// Literal IP for the host, mapping `localhost` to the IPv4 loopback.
    pub fn ip(&self) -> Option<IpAddr> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        self.host.parse().ok()
    }

    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(self.to_string()))
    }

    /// Whether a socket address denotes this endpoint.
    pub fn matches(&self, other: &SocketAddr) -> bool {
        if self.port != other.port() {
            return false;
        }
        match self.ip() {
            Some(ip) if ip.is_unspecified() => true,
            Some(ip) => ip == other.ip() || (ip.is_loopback() && other.ip().is_loopback()),
            None => false,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Opaque identity of a peer connected to a [`Server`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerHandle {
    Datagram(SocketAddr),
    Broker(Vec<u8>),
    Stream(u64),
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerHandle::Datagram(addr) => write!(f, "udp:{}", addr),
            PeerHandle::Broker(identity) => {
                f.write_str("zmq:")?;
                for byte in identity {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            PeerHandle::Stream(id) => write!(f, "ws:{}", id),
        }
    }
}

/// What a server hands back from `receive`.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message { peer: PeerHandle, payload: Vec<u8> },
    /// The backend noticed the peer's connection ended.
    Disconnected { peer: PeerHandle },
}

#[async_trait]
pub trait Server: Send + Sync {
    fn local_address(&self) -> Address;

    /// Waits for the next message or peer-set change.
    /// `Ok(None)` means the server was closed.
    async fn receive(&self) -> Result<Option<Incoming>, TransportError>;

    async fn send(&self, peer: &PeerHandle, payload: &[u8]) -> Result<usize, TransportError>;

    /// Resolves once `count` peers are connected. Connectionless backends return at once.
    async fn wait_for_peers(&self, _count: usize) {}

    /// Drops a departed peer; later sends to it fail with `PeerUnknown` until it
    /// is heard from again. Connection-oriented backends forget on disconnect.
    async fn forget(&self, _peer: &PeerHandle) {}

    async fn close(&self);
}

#[async_trait]
pub trait Session: Send + Sync {
    fn remote_address(&self) -> &Address;

    async fn send(&self, payload: &[u8]) -> Result<usize, TransportError>;

    /// `Ok(None)` means the session was closed locally or by the remote side.
    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&self);
}

/// Sentinel a broker or stream server sends to its peers when it closes.
pub const SHUTDOWN_SENTINEL: &str = "_server_shutdown_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Connectionless datagrams (UDP).
    Datagram,
    /// Router/dealer message queue (ZeroMQ over TCP).
    Broker,
    /// Persistent full-duplex stream (WebSocket).
    Stream,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Datagram => "udp",
            Backend::Broker => "zmq",
            Backend::Stream => "ws",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" | "datagram" => Ok(Backend::Datagram),
            "zmq" | "zeromq" | "broker" => Ok(Backend::Broker),
            "ws" | "websocket" | "websockets" | "stream" => Ok(Backend::Stream),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    /// Probability in `[0, 1)` that a datagram is silently dropped on send.
    pub drop_rate: f64,
    /// Peers a stream server waits for before broadcasting.
    pub expected_peers: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            expected_peers: 1,
        }
    }
}

/// Binds a server for the chosen backend.
pub async fn bind(
    backend: Backend,
    address: &Address,
    options: &TransportOptions,
) -> Result<Arc<dyn Server>, TransportError> {
    let server: Arc<dyn Server> = match backend {
        Backend::Datagram => Arc::new(UdpServer::bind(address, options.drop_rate).await?),
        Backend::Broker => Arc::new(BrokerServer::bind(address).await?),
        Backend::Stream => Arc::new(StreamServer::bind(address).await?),
    };
    tracing::info!("{} server listening on {}", backend, server.local_address());
    Ok(server)
}

/// Opens a client session to a server of the chosen backend.
pub async fn connect(
    backend: Backend,
    address: &Address,
    options: &TransportOptions,
) -> Result<Arc<dyn Session>, TransportError> {
    let session: Arc<dyn Session> = match backend {
        Backend::Datagram => Arc::new(UdpSession::connect(address, options.drop_rate).await?),
        Backend::Broker => Arc::new(BrokerSession::connect(address).await?),
        Backend::Stream => Arc::new(StreamSession::connect(address).await?),
    };
    tracing::info!("{} session connected to {}", backend, address);
    Ok(session)
}
