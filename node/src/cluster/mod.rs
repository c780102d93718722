//! Leaderless architecture: symmetric peers share an event log, elect a
//! leader through leases and mirror the canonical document it maintains.

mod document;
mod election;
pub mod log;
mod mirror;
mod peer;
mod replication;

pub use document::{BallDoc, DocumentRules, GameDocument, GameStatus, PlayerEntry};
pub use election::{LeaderDuty, LeaderElection, Role};
pub use log::EventLog;
pub use mirror::DocumentMirror;
pub use peer::ClusterPeer;
pub use replication::{CycleReport, ReplicationEngine};
