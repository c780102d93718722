use super::document::{DocumentRules, GameDocument};
use super::election::LeaderDuty;
use crate::config::Timing;
use crate::coord::{CoordinationService, LeaseId, DOCUMENT_KEY, EVENTS_PREFIX};
use crate::error::{ClusterError, CoordError};
use crate::event::{codec, BallState, DomainEvent, EventFactory, GameSnapshot};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one drain-and-reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Log entries removed, valid or not.
    pub consumed: usize,
    /// Entries that failed to decode or validate.
    pub rejected: usize,
    /// Whether a new document revision was written.
    pub written: bool,
}

/// Drains the event log into the canonical document. Only the leader runs it.
pub struct ReplicationEngine {
    coord: Arc<dyn CoordinationService>,
    rules: DocumentRules,
    factory: EventFactory,
    timing: Timing,
    document_lease: Option<LeaseId>,
    lease_refreshed: Option<Instant>,
    last_cycle: Option<Instant>,
}

impl ReplicationEngine {
    /// `factory` stamps the leader's own TIME_ELAPSED events; its player id is the node id.
    pub fn new(
        coord: Arc<dyn CoordinationService>,
        rules: DocumentRules,
        factory: EventFactory,
        timing: Timing,
    ) -> Self {
        Self {
            coord,
            rules,
            factory,
            timing,
            document_lease: None,
            lease_refreshed: None,
            last_cycle: None,
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, ClusterError> {
        let prefix = format!("{}/", EVENTS_PREFIX);
        let entries = self.coord.get_prefix(&prefix).await?;
        let mut report = CycleReport::default();

        let mut events: Vec<DomainEvent> = Vec::with_capacity(entries.len());
        for entry in &entries {
            match codec::decode(&entry.value) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!("Discarding log entry {}: {}", entry.key, e);
                    report.rejected += 1;
                }
            }
        }
        // The service returns keys in key order, which says nothing about causality.
        events.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

        let (current, stored_lease) = self.load().await?;
        let mut next = current
            .clone()
            .unwrap_or_else(|| GameDocument::empty(self.factory.game_id(), &self.rules.arena));
        let leader_id = self.factory.player_id().to_string();
        for event in &events {
            self.rules.apply(&mut next, event, &leader_id);
        }
        let tick = self.tick(&next);
        self.rules.apply(&mut next, &tick, &leader_id);
        next.approved = true;

        // The document lives as long as a leader keeps its lease alive, changed or not.
        let lease = self.document_lease().await?;
        match codec::encode_document(&next) {
            Ok(text) if current.as_ref() != Some(&next) || stored_lease != Some(lease) => {
                self.coord.put(DOCUMENT_KEY, &text, Some(lease)).await?;
                report.written = true;
            }
            Ok(_) => {}
            Err(e) => warn!("Discarding batch of {} events: {}", events.len(), e),
        }

        for entry in &entries {
            self.coord.delete(&entry.key).await?;
        }
        report.consumed = entries.len();
        if report.consumed > 0 {
            debug!(
                "Replicated {} events ({} rejected, written: {})",
                report.consumed, report.rejected, report.written
            );
        }
        Ok(report)
    }

    /// Stored document and the lease it is attached to.
    async fn load(&self) -> Result<(Option<GameDocument>, Option<LeaseId>), ClusterError> {
        let Some(kv) = self.coord.get(DOCUMENT_KEY).await? else {
            return Ok((None, None));
        };
        match codec::decode_document(&kv.value) {
            Ok(document) => Ok((Some(document), kv.lease)),
            Err(e) => {
                warn!("Stored document is invalid, starting over: {}", e);
                Ok((None, kv.lease))
            }
        }
    }

    /// Leader TIME_ELAPSED covering the time since the previous cycle.
    fn tick(&mut self, document: &GameDocument) -> DomainEvent {
        let now = Instant::now();
        let dt = self
            .last_cycle
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_cycle = Some(now);
        let snapshot = GameSnapshot {
            ball: BallState {
                x: document.ball.position.x,
                y: document.ball.position.y,
                vx: document.ball.velocity.x,
                vy: document.ball.velocity.y,
            },
            paddles: Vec::new(),
        };
        self.factory.time_elapsed(dt, snapshot)
    }

    /// Lease keeping the document alive, refreshed at most once per `refresh_interval`.
    async fn document_lease(&mut self) -> Result<LeaseId, ClusterError> {
        if let Some(lease) = self.document_lease {
            let fresh = self
                .lease_refreshed
                .map(|at| at.elapsed() < self.timing.refresh_interval)
                .unwrap_or(false);
            if fresh {
                return Ok(lease);
            }
            let sent_at = Instant::now();
            match self.coord.refresh_lease(lease).await {
                Ok(()) => {
                    self.lease_refreshed = Some(sent_at);
                    return Ok(lease);
                }
                Err(CoordError::LeaseExpired(_)) => self.document_lease = None,
                Err(e) => return Err(e.into()),
            }
        }
        let sent_at = Instant::now();
        let lease = self.coord.grant_lease(self.timing.document_ttl).await?;
        self.document_lease = Some(lease);
        self.lease_refreshed = Some(sent_at);
        Ok(lease)
    }
}

#[async_trait]
impl LeaderDuty for ReplicationEngine {
    fn elected(&mut self) {
        info!("Replication engine active for {}", self.factory.game_id());
        self.last_cycle = None;
    }

    async fn perform(&mut self) -> Result<(), ClusterError> {
        self.run_cycle().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::log::EventLog;
    use crate::cluster::GameStatus;
    use crate::coord::MemCoordinator;
    use crate::model::{ArenaConfig, Side};
    use std::time::Duration;

    fn engine(coord: Arc<MemCoordinator>) -> ReplicationEngine {
        ReplicationEngine::new(
            coord,
            DocumentRules::new(ArenaConfig::default(), 2, 10.0),
            EventFactory::new("g", "leader"),
            Timing::default(),
        )
    }

    async fn document(coord: &MemCoordinator) -> GameDocument {
        let kv = coord.get(DOCUMENT_KEY).await.unwrap().unwrap();
        codec::decode_document(&kv.value).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_applies_and_consumes_log() {
        let coord = Arc::new(MemCoordinator::new());
        let log = EventLog::new(coord.clone(), Duration::from_secs(60));
        let mut engine = engine(coord.clone());

        log.append(&EventFactory::new("g", "alice").join(Side::Left, None)).await.unwrap();
        log.append(&EventFactory::new("g", "bob").join(Side::Right, None)).await.unwrap();

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.consumed, 2);
        assert!(report.written);
        assert!(coord.get_prefix("pong_events/").await.unwrap().is_empty());

        let stored = document(&coord).await;
        assert_eq!(stored.players.len(), 2);
        assert_eq!(stored.game_state, GameStatus::Playing);
        assert!(stored.approved);
        assert!(coord.get(DOCUMENT_KEY).await.unwrap().unwrap().lease.is_some());
    }

    #[tokio::test]
    async fn test_events_apply_in_timestamp_order() {
        let coord = Arc::new(MemCoordinator::new());
        let mut engine = engine(coord.clone());
        let alice = EventFactory::new("g", "alice");

        // Key order puts the leave first; timestamps put the join first.
        let mut join = alice.join(Side::Left, None);
        join.timestamp = 1_000;
        let mut leave = alice.leave();
        leave.timestamp = 2_000;
        coord.put("pong_events/a", &codec::encode(&leave).unwrap(), None).await.unwrap();
        coord.put("pong_events/b", &codec::encode(&join).unwrap(), None).await.unwrap();

        engine.run_cycle().await.unwrap();
        assert!(document(&coord).await.players.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_entries_are_still_consumed() {
        let coord = Arc::new(MemCoordinator::new());
        let mut engine = engine(coord.clone());
        coord
            .put("pong_events/junk", r#"{"eventType":"PADDLE_MOVE"}"#, None)
            .await
            .unwrap();

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.consumed, 1);
        assert!(coord.get_prefix("pong_events/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_document_is_not_rewritten() {
        let coord = Arc::new(MemCoordinator::new());
        let mut engine = engine(coord.clone());

        assert!(engine.run_cycle().await.unwrap().written);
        let revision = coord.get(DOCUMENT_KEY).await.unwrap().unwrap().mod_revision;

        assert!(!engine.run_cycle().await.unwrap().written);
        assert_eq!(coord.get(DOCUMENT_KEY).await.unwrap().unwrap().mod_revision, revision);
    }

    fn short_leases() -> Timing {
        Timing {
            tick: Duration::from_millis(5),
            replication_interval: Duration::from_millis(20),
            lease_ttl: Duration::from_millis(300),
            refresh_interval: Duration::from_millis(100),
            event_ttl: Duration::from_millis(300),
            document_ttl: Duration::from_millis(300),
            retry_backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_idle_waiting_document_outlives_its_ttl() {
        let coord = Arc::new(MemCoordinator::new());
        coord.start(Duration::from_millis(10));
        let log = EventLog::new(coord.clone(), Duration::from_secs(5));
        let mut engine = ReplicationEngine::new(
            coord.clone(),
            DocumentRules::new(ArenaConfig::default(), 2, 10.0),
            EventFactory::new("g", "leader"),
            short_leases(),
        );
        log.append(&EventFactory::new("g", "alice").join(Side::Left, None)).await.unwrap();

        // 40 cycles span well over two document TTLs.
        for _ in 0..40 {
            engine.run_cycle().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stored = document(&coord).await;
        assert_eq!(stored.game_state, GameStatus::Waiting);
        assert!(stored.player("alice").is_some());
    }

    #[tokio::test]
    async fn test_new_leader_adopts_document_under_its_own_lease() {
        let coord = Arc::new(MemCoordinator::new());
        let mut previous = engine(coord.clone());
        previous.run_cycle().await.unwrap();
        let old_lease = coord.get(DOCUMENT_KEY).await.unwrap().unwrap().lease;

        let mut successor = engine(coord.clone());
        let report = successor.run_cycle().await.unwrap();

        assert!(report.written);
        let new_lease = coord.get(DOCUMENT_KEY).await.unwrap().unwrap().lease;
        assert!(new_lease.is_some());
        assert_ne!(new_lease, old_lease);
        assert!(!successor.run_cycle().await.unwrap().written);
    }
}
