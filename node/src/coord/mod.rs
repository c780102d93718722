//! Strongly consistent key/value coordination: leases, conditional puts, watches.

mod memory;
mod remote;
pub mod service;

pub use memory::MemCoordinator;
pub use remote::HttpCoordinator;

use crate::error::CoordError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

pub type LeaseId = i64;

/// Key holding the current leader's node id.
pub const LEADER_KEY: &str = "election/leader";
/// Prefix of the append-only event log; entries live at `pong_events/<uuid>`.
pub const EVENTS_PREFIX: &str = "pong_events";
/// Key holding the canonical game document.
pub const DOCUMENT_KEY: &str = "pong_lobby";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
    /// Store revision of the last write to this key.
    pub mod_revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

/// Stream of changes to one key. Dropping it cancels the watch.
#[derive(Debug)]
pub struct Watcher {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watcher {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the service side of the watch is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait CoordinationService: Send + Sync {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordError>;

    /// Fails with `CoordError::LeaseExpired` if the lease is no longer alive.
    async fn refresh_lease(&self, lease: LeaseId) -> Result<(), CoordError>;

    /// Revokes the lease and deletes every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordError>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordError>;

    /// Every key starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordError>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordError>;

    /// Atomically creates the key if it does not exist. Returns whether it was created.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, CoordError>;

    async fn delete(&self, key: &str) -> Result<bool, CoordError>;

    async fn watch(&self, key: &str) -> Result<Watcher, CoordError>;
}
