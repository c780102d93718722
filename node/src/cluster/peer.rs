use super::document::{DocumentRules, GameDocument};
use super::election::{LeaderElection, Role};
use super::log::EventLog;
use super::mirror::DocumentMirror;
use super::replication::ReplicationEngine;
use crate::config::ClusterSettings;
use crate::control::InputSource;
use crate::coord::CoordinationService;
use crate::error::ClusterError;
use crate::event::{DomainEvent, EventFactory, EventKind};
use crate::model::Pong;
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One symmetric node of the leaderless architecture: publishes its player's
/// input to the shared log, campaigns for leadership (replicating while it
/// leads) and mirrors the canonical document.
pub struct ClusterPeer {
    settings: ClusterSettings,
    coord: Arc<dyn CoordinationService>,
    factory: EventFactory,
    log: EventLog,
    election: Arc<LeaderElection>,
    mirror: Arc<DocumentMirror>,
    shutdown: Shutdown,
    started: AtomicBool,
    leaving: AtomicBool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClusterPeer {
    pub fn new(
        coord: Arc<dyn CoordinationService>,
        settings: ClusterSettings,
    ) -> Result<Arc<Self>, ClusterError> {
        let election =
            LeaderElection::new(coord.clone(), settings.node_id.clone(), settings.timing.clone())?;
        let mirror = DocumentMirror::new(
            coord.clone(),
            settings.arena.clone(),
            settings.timing.retry_backoff,
        );

        Ok(Arc::new(Self {
            factory: EventFactory::new(settings.game_id.clone(), settings.node_id.clone()),
            log: EventLog::new(coord.clone(), settings.timing.event_ttl),
            election,
            mirror,
            coord,
            settings,
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
            leaving: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
        }))
    }

    /// Publishes PLAYER_JOIN, then starts the mirror, the election and the input loop.
    pub async fn start(self: &Arc<Self>, input: Box<dyn InputSource>) -> Result<(), ClusterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyStarted);
        }
        self.mirror.start();
        let home = self.settings.arena.paddle_home(self.settings.side);
        self.log
            .append(&self.factory.join(self.settings.side, Some(home)))
            .await?;

        let rules = DocumentRules::new(
            self.settings.arena.clone(),
            self.settings.capacity,
            self.settings.paddle_step,
        );
        let engine = ReplicationEngine::new(
            self.coord.clone(),
            rules,
            self.factory.clone(),
            self.settings.timing.clone(),
        );
        self.election.start(Box::new(engine))?;

        let handle = tokio::spawn(self.clone().input_loop(input));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        info!(
            "Node {} joined {} as {}",
            self.settings.node_id, self.settings.game_id, self.settings.side
        );
        Ok(())
    }

    /// Publishes PLAYER_LEAVE, resigns and stops mirroring. Only the first call has any effect.
    pub async fn leave(&self) {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.log.append(&self.factory.leave()).await {
            warn!("Failed to publish leave: {}", e);
        }
        self.shutdown.trigger();
        self.election.stop().await;
        self.mirror.stop().await;
        info!("Node {} left {}", self.settings.node_id, self.settings.game_id);
    }

    pub async fn stop(&self) {
        self.leave().await;
        self.wait().await;
    }

    /// Waits for the input loop to finish.
    pub async fn wait(&self) {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Input loop panicked: {}", e);
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    pub fn role(&self) -> Role {
        self.election.role()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.election.subscribe()
    }

    pub async fn pong(&self) -> Pong {
        self.mirror.pong().await
    }

    pub fn document(&self) -> Option<GameDocument> {
        self.mirror.document()
    }

    pub fn subscribe_document(&self) -> watch::Receiver<Option<GameDocument>> {
        self.mirror.subscribe()
    }

    /// Publishes a local event to the shared log.
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), ClusterError> {
        self.log.append(event).await.map(|_| ())
    }

    async fn input_loop(self: Arc<Self>, mut input: Box<dyn InputSource>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.wait() => return,
                next = input.next_event(&self.factory) => next,
            };
            let Some(event) = next else {
                self.leave().await;
                return;
            };
            match event.kind() {
                EventKind::PaddleMove => {
                    if let Err(e) = self.publish(&event).await {
                        warn!("Failed to publish move: {}", e);
                    }
                }
                EventKind::PlayerLeave => {
                    self.leave().await;
                    return;
                }
                other => debug!("Ignoring local {:?}", other),
            }
        }
    }
}
