use crate::coord::{CoordinationService, EVENTS_PREFIX};
use crate::error::ClusterError;
use crate::event::{codec, DomainEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Append side of the shared event log. Entries expire with their own lease.
#[derive(Clone)]
pub struct EventLog {
    coord: Arc<dyn CoordinationService>,
    ttl: Duration,
}

impl EventLog {
    pub fn new(coord: Arc<dyn CoordinationService>, ttl: Duration) -> Self {
        Self { coord, ttl }
    }

    /// Validates and stores the event under a fresh `pong_events/<uuid>` key.
    /// Events that fail validation never reach the log.
    pub async fn append(&self, event: &DomainEvent) -> Result<String, ClusterError> {
        let text = codec::encode(event)?;
        let lease = self.coord.grant_lease(self.ttl).await?;
        let key = format!("{}/{}", EVENTS_PREFIX, Uuid::new_v4());
        self.coord.put(&key, &text, Some(lease)).await?;
        debug!("Appended {:?} as {}", event.kind(), key);
        Ok(key)
    }
}
