use crate::coord::LeaseId;
use crate::model::Side;
use crate::transport::{Address, PeerHandle};
use thiserror::Error;

/// Failures raised by the transport backends.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {reason}")]
    Bind { address: Address, reason: String },

    #[error("peer {0} is not registered with this server")]
    PeerUnknown(PeerHandle),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("transport closed")]
    Closed,

    #[error("datagram from {actual} rejected, session is bound to {expected}")]
    UnexpectedPeer { expected: Address, actual: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("broker socket error: {0}")]
    Broker(#[from] zeromq::ZmqError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Failures raised while encoding or decoding events and documents.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("schema validation failed: {0}")]
    Schema(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures raised by a coordination service client.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("lease {0} expired or was never granted")]
    LeaseExpired(LeaseId),

    #[error("coordination request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("watch stream failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("unexpected coordination response: {0}")]
    Protocol(String),

    #[error("coordination request timed out")]
    Timeout,

    #[error("coordination service closed")]
    Closed,
}

/// Failures that end a Coordinator or Terminal session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("side {0} is already taken")]
    SideTaken(Side),

    #[error("session already started")]
    AlreadyStarted,
}

/// Failures raised by the leaderless cluster components.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cluster peer already started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error("inconsistent timing: {0}")]
    Timing(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LobbyError {
    #[error("a lobby already exists")]
    AlreadyExists,

    #[error("no lobby is open")]
    NoLobby,

    #[error("lobby is full")]
    Full,

    #[error("player {0} already joined")]
    AlreadyJoined(String),

    #[error("player {0} is not in the lobby")]
    NotMember(String),
}
