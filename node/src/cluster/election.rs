use crate::config::Timing;
use crate::coord::{CoordinationService, LeaseId, WatchEvent, LEADER_KEY};
use crate::error::{ClusterError, CoordError};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unaffiliated,
    Campaigning,
    Leader,
    Follower,
}

/// Work performed periodically while this node holds leadership.
#[async_trait]
pub trait LeaderDuty: Send {
    /// Called each time leadership is (re)gained.
    fn elected(&mut self) {}

    async fn perform(&mut self) -> Result<(), ClusterError>;
}

/// Lease-guarded leader election over a [`CoordinationService`].
///
/// The node believes it leads only until `last refresh sent + ttl`. The
/// service expires the lease no earlier than that, so two nodes never both
/// report [`LeaderElection::is_leader`] at once.
pub struct LeaderElection {
    coord: Arc<dyn CoordinationService>,
    node_id: String,
    timing: Timing,
    role: watch::Sender<Role>,
    valid_until: std::sync::Mutex<Option<Instant>>,
    shutdown: Shutdown,
    started: AtomicBool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    pub fn new(
        coord: Arc<dyn CoordinationService>,
        node_id: impl Into<String>,
        timing: Timing,
    ) -> Result<Arc<Self>, ClusterError> {
        timing.validate()?;
        let (role, _) = watch::channel(Role::Unaffiliated);
        Ok(Arc::new(Self {
            coord,
            node_id: node_id.into(),
            timing,
            role,
            valid_until: std::sync::Mutex::new(None),
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
        }))
    }

    /// Starts campaigning; `duty` runs every replication interval while leading.
    pub fn start(self: &Arc<Self>, duty: Box<dyn LeaderDuty>) -> Result<(), ClusterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyStarted);
        }
        let handle = tokio::spawn(self.clone().run(duty));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Stops campaigning. A leader resigns before this returns.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Election task panicked: {}", e);
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    /// True only while the lease is known to be alive.
    pub fn is_leader(&self) -> bool {
        if self.role() != Role::Leader {
            return false;
        }
        self.deadline()
            .map(|deadline| Instant::now() < deadline)
            .unwrap_or(false)
    }

    fn deadline(&self) -> Option<Instant> {
        self.valid_until.lock().ok().and_then(|guard| *guard)
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        if let Ok(mut guard) = self.valid_until.lock() {
            *guard = deadline;
        }
    }

    fn set_role(&self, next: Role) {
        let previous = self.role.send_replace(next);
        if previous != next {
            info!("Node {} {:?} -> {:?}", self.node_id, previous, next);
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = tokio::time::sleep(self.timing.retry_backoff) => {}
        }
    }

    async fn run(self: Arc<Self>, mut duty: Box<dyn LeaderDuty>) {
        let mut held: Option<LeaseId> = None;
        while !self.shutdown.is_triggered() {
            self.set_role(Role::Campaigning);
            match self.campaign().await {
                Ok(Some(lease)) => {
                    held = Some(lease);
                    self.set_role(Role::Leader);
                    duty.elected();
                    if self.lead(lease, duty.as_mut()).await {
                        break;
                    }
                    held = None;
                    self.set_deadline(None);
                }
                Ok(None) => {
                    self.set_role(Role::Follower);
                    self.follow().await;
                }
                Err(e) => {
                    warn!("Campaign of {} failed: {}", self.node_id, e);
                    self.pause().await;
                }
            }
        }
        if let Some(lease) = held {
            self.resign(lease).await;
        }
        self.set_role(Role::Unaffiliated);
    }

    /// Returns the lease when this node won.
    async fn campaign(&self) -> Result<Option<LeaseId>, ClusterError> {
        // Taken before the request so the local deadline never outlives the store's.
        let granted_at = Instant::now();
        let lease = self.coord.grant_lease(self.timing.lease_ttl).await?;

        if self.coord.put_if_absent(LEADER_KEY, &self.node_id, Some(lease)).await? {
            self.set_deadline(Some(granted_at + self.timing.lease_ttl));
            return Ok(Some(lease));
        }
        let holder = self.coord.get(LEADER_KEY).await?;
        if holder.as_ref().map(|kv| kv.value.as_str()) == Some(self.node_id.as_str()) {
            // Still recorded as leader from an earlier term; rebind the key to the new lease.
            self.coord.put(LEADER_KEY, &self.node_id, Some(lease)).await?;
            self.set_deadline(Some(granted_at + self.timing.lease_ttl));
            return Ok(Some(lease));
        }

        if let Err(e) = self.coord.revoke_lease(lease).await {
            debug!("Releasing unused lease {} failed: {}", lease, e);
        }
        Ok(None)
    }

    /// Leads until the lease is lost (false) or shutdown (true).
    async fn lead(&self, lease: LeaseId, duty: &mut dyn LeaderDuty) -> bool {
        let mut replicate = tokio::time::interval(self.timing.replication_interval);
        replicate.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval_at(
            Instant::now() + self.timing.refresh_interval,
            self.timing.refresh_interval,
        );
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => return true,
                _ = refresh.tick() => {
                    let sent_at = Instant::now();
                    match self.coord.refresh_lease(lease).await {
                        Ok(()) => self.set_deadline(Some(sent_at + self.timing.lease_ttl)),
                        Err(CoordError::LeaseExpired(_)) => {
                            warn!("Node {} lost its leader lease", self.node_id);
                            return false;
                        }
                        Err(e) => warn!("Lease refresh failed: {}", e),
                    }
                }
                _ = replicate.tick() => {
                    if !self.is_leader() {
                        warn!("Node {} leadership lapsed", self.node_id);
                        return false;
                    }
                    if let Err(e) = duty.perform().await {
                        warn!("Leader duty failed: {}", e);
                    }
                }
            }
        }
    }

    async fn follow(&self) {
        let mut watcher = match self.coord.watch(LEADER_KEY).await {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Watching {} failed: {}", LEADER_KEY, e);
                self.pause().await;
                return;
            }
        };
        // The leader may have gone between the failed campaign and the watch.
        match self.coord.get(LEADER_KEY).await {
            Ok(Some(kv)) => info!("Node {} following {}", self.node_id, kv.value),
            Ok(None) => return,
            Err(e) => {
                warn!("Reading {} failed: {}", LEADER_KEY, e);
                self.pause().await;
                return;
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => return,
                event = watcher.next() => match event {
                    Some(WatchEvent::Delete { .. }) => {
                        info!("Leader key released, node {} campaigning", self.node_id);
                        return;
                    }
                    Some(WatchEvent::Put(kv)) => debug!("Leader is now {}", kv.value),
                    None => {
                        warn!("Leader watch ended");
                        self.pause().await;
                        return;
                    }
                },
            }
        }
    }

    async fn resign(&self, lease: LeaseId) {
        self.set_deadline(None);
        match self.coord.get(LEADER_KEY).await {
            Ok(Some(kv)) if kv.value == self.node_id => {
                if let Err(e) = self.coord.delete(LEADER_KEY).await {
                    warn!("Deleting {} failed: {}", LEADER_KEY, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Reading {} failed: {}", LEADER_KEY, e),
        }
        if let Err(e) = self.coord.revoke_lease(lease).await {
            debug!("Revoking lease {} failed: {}", lease, e);
        }
        info!("Node {} resigned", self.node_id);
    }
}
