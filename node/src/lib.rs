// Library interface shared by the node, lobby and client binaries

pub mod cluster;
pub mod config;
pub mod control;
pub mod coord;
pub mod error;
pub mod event;
pub mod lobby;
pub mod model;
pub mod rendezvous;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types for convenience
pub use cluster::{ClusterPeer, GameDocument, LeaderElection, ReplicationEngine, Role};
pub use config::{ClusterSettings, CoordinatorSettings, TerminalSettings, Timing};
pub use control::{Coordinator, CoordinatorState, InputSource, EventSink, Terminal, TerminalState};
pub use coord::{CoordinationService, HttpCoordinator, MemCoordinator};
pub use event::{DomainEvent, EventFactory, EventKind};
pub use model::{ArenaConfig, Direction, Pong, Side};
pub use transport::{Address, Backend};
