//! Settings for every runnable component, with defaults and environment overrides.

use crate::error::ConfigError;
use crate::model::{ArenaConfig, Side};
use crate::transport::{Address, Backend, TransportOptions};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_GAME_ID: &str = "default-game";
pub const DEFAULT_PLAYERS: usize = 2;

/// Intervals and TTLs shared by the coordinator tick and the cluster protocols.
///
/// Required ordering: `tick <= replication_interval < refresh_interval`,
/// `2 * refresh_interval <= lease_ttl`, `lease_ttl <= event_ttl` and
/// `lease_ttl <= document_ttl`.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub tick: Duration,
    /// How often a leader drains the event log.
    pub replication_interval: Duration,
    pub lease_ttl: Duration,
    pub refresh_interval: Duration,
    pub event_ttl: Duration,
    pub document_ttl: Duration,
    /// Pause before retrying after a coordination failure.
    pub retry_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick: Duration::from_micros(16_667),
            replication_interval: Duration::from_millis(50),
            lease_ttl: Duration::from_secs(5),
            refresh_interval: Duration::from_millis(1500),
            event_ttl: Duration::from_secs(60),
            document_ttl: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl Timing {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::Timing("tick must be positive".into()));
        }
        if self.replication_interval < self.tick {
            return Err(ConfigError::Timing(format!(
                "replication interval {:?} is shorter than the tick {:?}",
                self.replication_interval, self.tick
            )));
        }
        if self.refresh_interval <= self.replication_interval {
            return Err(ConfigError::Timing(format!(
                "refresh interval {:?} must exceed the replication interval {:?}",
                self.refresh_interval, self.replication_interval
            )));
        }
        if self.refresh_interval * 2 > self.lease_ttl {
            return Err(ConfigError::Timing(format!(
                "lease TTL {:?} leaves no room for a retried refresh every {:?}",
                self.lease_ttl, self.refresh_interval
            )));
        }
        if self.lease_ttl > self.event_ttl || self.lease_ttl > self.document_ttl {
            return Err(ConfigError::Timing(format!(
                "event TTL {:?} and document TTL {:?} must not be shorter than the lease TTL {:?}",
                self.event_ttl, self.document_ttl, self.lease_ttl
            )));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Datagram drop probability; must lie in `[0, 1)`.
pub fn parse_drop_rate(raw: &str) -> Result<f64, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: "UDP_DROP_RATE".to_string(),
        value: raw.to_string(),
    };
    let rate: f64 = raw.trim().parse().map_err(|_| invalid())?;
    if !(0.0..1.0).contains(&rate) {
        return Err(invalid());
    }
    Ok(rate)
}

fn drop_rate_from_env() -> Result<f64, ConfigError> {
    match std::env::var("UDP_DROP_RATE") {
        Ok(raw) => parse_drop_rate(&raw),
        Err(_) => Ok(0.0),
    }
}

fn address_from_env(default_host: &str) -> Result<Address, ConfigError> {
    Ok(Address::new(
        env_or("PONG_HOST", default_host.to_string())?,
        env_or("PONG_PORT", DEFAULT_PORT)?,
    ))
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub game_id: String,
    pub backend: Backend,
    /// Listening endpoint.
    pub address: Address,
    /// Paddles required before snapshots are broadcast.
    pub num_players: usize,
    pub drop_rate: f64,
    pub tick: Duration,
    pub arena: ArenaConfig,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            game_id: DEFAULT_GAME_ID.to_string(),
            backend: Backend::Datagram,
            address: Address::new("0.0.0.0", DEFAULT_PORT),
            num_players: DEFAULT_PLAYERS,
            drop_rate: 0.0,
            tick: Timing::default().tick,
            arena: ArenaConfig::default(),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            game_id: env_or("PONG_GAME_ID", defaults.game_id)?,
            backend: env_or("PONG_BACKEND", defaults.backend)?,
            address: address_from_env("0.0.0.0")?,
            num_players: env_or("PONG_PLAYERS", defaults.num_players)?,
            drop_rate: drop_rate_from_env()?,
            ..defaults
        })
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            drop_rate: self.drop_rate,
            expected_peers: self.num_players,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub game_id: String,
    pub player_id: String,
    pub side: Side,
    pub backend: Backend,
    /// Coordinator endpoint.
    pub address: Address,
    pub drop_rate: f64,
    pub arena: ArenaConfig,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            game_id: DEFAULT_GAME_ID.to_string(),
            player_id: Uuid::new_v4().to_string(),
            side: Side::Left,
            backend: Backend::Datagram,
            address: Address::new(DEFAULT_HOST, DEFAULT_PORT),
            drop_rate: 0.0,
            arena: ArenaConfig::default(),
        }
    }
}

impl TerminalSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            game_id: env_or("PONG_GAME_ID", defaults.game_id)?,
            player_id: env_or("PONG_PLAYER_ID", defaults.player_id)?,
            side: env_or("PONG_SIDE", defaults.side)?,
            backend: env_or("PONG_BACKEND", defaults.backend)?,
            address: address_from_env(DEFAULT_HOST)?,
            drop_rate: drop_rate_from_env()?,
            ..defaults
        })
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            drop_rate: self.drop_rate,
            expected_peers: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub game_id: String,
    /// Identity used for leadership and as the player id of this node's events.
    pub node_id: String,
    pub side: Side,
    /// Players the canonical document accepts.
    pub capacity: usize,
    /// Distance a paddle moves per PADDLE_MOVE in the canonical document.
    pub paddle_step: f64,
    pub timing: Timing,
    pub arena: ArenaConfig,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            game_id: DEFAULT_GAME_ID.to_string(),
            node_id: Uuid::new_v4().to_string(),
            side: Side::Left,
            capacity: DEFAULT_PLAYERS,
            paddle_step: 10.0,
            timing: Timing::default(),
            arena: ArenaConfig::default(),
        }
    }
}

impl ClusterSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            game_id: env_or("PONG_GAME_ID", defaults.game_id)?,
            node_id: env_or("PONG_NODE_ID", defaults.node_id)?,
            side: env_or("PONG_SIDE", defaults.side)?,
            capacity: env_or("PONG_PLAYERS", defaults.capacity)?,
            paddle_step: env_or("PONG_PADDLE_STEP", defaults.paddle_step)?,
            ..defaults
        })
    }
}
