use super::{EventSink, InputSource, Origin, PeerRegistry, Reaction, Ticker};
use crate::config::CoordinatorSettings;
use crate::error::{SessionError, TransportError};
use crate::event::{codec, DomainEvent, EventBody, EventFactory};
use crate::model::{Pong, Side};
use crate::shutdown::Shutdown;
use crate::transport::{self, Address, Incoming, PeerHandle, Server};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Player id stamped on events the coordinator originates.
const COORDINATOR_ID: &str = "coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Starting,
    AcceptingPeers,
    Broadcasting,
    Draining,
    Closed,
}

/// Authoritative game rules: owns the simulation and the peer-to-paddle binding.
pub struct CoordinatorRules {
    factory: EventFactory,
    pong: Pong,
    peers: PeerRegistry,
}

impl CoordinatorRules {
    pub fn new(game_id: impl Into<String>, pong: Pong, peers: PeerRegistry) -> Self {
        Self {
            factory: EventFactory::new(game_id, COORDINATOR_ID),
            pong,
            peers,
        }
    }

    pub fn pong(&self) -> &Pong {
        &self.pong
    }

    /// Handles a transport-level disconnect the same way as PLAYER_LEAVE.
    pub async fn peer_lost(&mut self, peer: &PeerHandle) -> Vec<Reaction> {
        self.release(peer, &peer.to_string()).await
    }

    async fn release(&mut self, peer: &PeerHandle, who: &str) -> Vec<Reaction> {
        let Some(side) = self.peers.remove(peer).await else {
            return Vec::new();
        };
        self.pong.remove_paddle(side);
        info!("{} left {} ({} paddles remain)", who, side, self.pong.paddles().len());

        let forget = Reaction::Forget(peer.clone());
        if self.pong.paddles().is_empty() {
            return vec![forget, Reaction::Emit(self.factory.game_over()), Reaction::Stop];
        }
        self.pong.reset_ball();
        vec![forget]
    }

    async fn join(&mut self, peer: PeerHandle, event: &DomainEvent, side: Side) {
        if self.peers.side_of(&peer).await == Some(side) {
            debug!("Duplicate join from {} for {}", peer, side);
            return;
        }
        if let Err(e) = self.peers.bind_side(&peer, side).await {
            warn!("Rejected join of {} from {}: {}", event.player_id, peer, e);
            return;
        }
        self.pong.add_paddle(side);
        self.pong.reset_ball();
        info!("Player {} joined as {} from {}", event.player_id, side, peer);
    }
}

#[async_trait]
impl EventSink for CoordinatorRules {
    async fn consume(&mut self, event: DomainEvent, origin: Origin) -> Vec<Reaction> {
        match origin {
            Origin::Local => match event.body {
                EventBody::TimeElapsed(tick) => {
                    self.pong.update(tick.dt);
                    let snapshot = self.pong.snapshot();
                    vec![Reaction::Emit(self.factory.time_elapsed(tick.dt, snapshot))]
                }
                _ => Vec::new(),
            },
            Origin::Peer(peer) => match &event.body {
                EventBody::PlayerJoin(join) => {
                    let side = join.side;
                    self.join(peer, &event, side).await;
                    Vec::new()
                }
                EventBody::PaddleMove(movement) => {
                    // Only the paddle bound to this peer ever moves.
                    match self.peers.side_of(&peer).await {
                        Some(side) => {
                            self.pong.move_paddle(side, movement.direction);
                        }
                        None => warn!("Ignoring move from {} without a paddle", peer),
                    }
                    Vec::new()
                }
                EventBody::PlayerLeave => self.release(&peer, &event.player_id).await,
                _ => {
                    debug!("Ignoring {:?} from {}", event.kind(), peer);
                    Vec::new()
                }
            },
            Origin::Authority => Vec::new(),
        }
    }
}

/// Authoritative server of the single-coordinator architecture.
///
/// Background tasks only run between [`Coordinator::start`] and
/// [`Coordinator::stop`].
pub struct Coordinator {
    settings: CoordinatorSettings,
    server: Arc<dyn Server>,
    rules: Mutex<CoordinatorRules>,
    peers: PeerRegistry,
    factory: EventFactory,
    state: watch::Sender<CoordinatorState>,
    shutdown: Shutdown,
    started: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<Result<(), SessionError>>>>,
}

impl Coordinator {
    /// Binds the listening endpoint. Nothing runs until `start`.
    pub async fn bind(settings: CoordinatorSettings) -> Result<Arc<Self>, SessionError> {
        let server =
            transport::bind(settings.backend, &settings.address, &settings.transport_options())
                .await?;
        let peers = PeerRegistry::new();
        let rules = CoordinatorRules::new(
            settings.game_id.clone(),
            Pong::new(settings.arena.clone()),
            peers.clone(),
        );
        let (state, _) = watch::channel(CoordinatorState::Starting);

        Ok(Arc::new(Self {
            factory: EventFactory::new(settings.game_id.clone(), COORDINATOR_ID),
            settings,
            server,
            rules: Mutex::new(rules),
            peers,
            state,
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        self.transition(CoordinatorState::AcceptingPeers);

        let receiver = tokio::spawn(self.clone().receive_loop());
        let ticker = tokio::spawn(self.clone().tick_loop());
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(receiver);
            tasks.push(ticker);
        }
        Ok(())
    }

    /// Drains and closes, then waits for the background tasks.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.drain().await;
        self.wait().await
    }

    /// Waits for the background tasks and returns the first fatal error.
    pub async fn wait(&self) -> Result<(), SessionError> {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        let mut outcome = Ok(());
        for handle in handles {
            match handle.await {
                Ok(Err(e)) if outcome.is_ok() => outcome = Err(e),
                Ok(_) => {}
                Err(e) => error!("Coordinator task panicked: {}", e),
            }
        }
        outcome
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn local_address(&self) -> Address {
        self.server.local_address()
    }

    pub async fn paddle_count(&self) -> usize {
        self.rules.lock().await.pong().paddles().len()
    }

    fn transition(&self, next: CoordinatorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Coordinator {:?} -> {:?}", previous, next);
        }
    }

    async fn drain(&self) {
        let draining = self.state.send_if_modified(|state| {
            if matches!(state, CoordinatorState::Draining | CoordinatorState::Closed) {
                return false;
            }
            info!("Coordinator {:?} -> {:?}", *state, CoordinatorState::Draining);
            *state = CoordinatorState::Draining;
            true
        });
        if !draining {
            return;
        }
        // Datagram terminals only learn about the end through GAME_OVER.
        if !self.peers.is_empty().await {
            self.broadcast(&self.factory.game_over()).await;
        }
        self.shutdown.trigger();
        self.server.close().await;
        self.transition(CoordinatorState::Closed);
    }

    async fn fail(&self, err: SessionError) -> Result<(), SessionError> {
        error!("Coordinator failed: {}", err);
        self.drain().await;
        Err(err)
    }

    async fn receive_loop(self: Arc<Self>) -> Result<(), SessionError> {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.wait() => break,
                received = self.server.receive() => received,
            };
            let reactions = match received {
                Ok(Some(Incoming::Message { peer, payload })) => {
                    let event = match codec::decode_bytes(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Dropping invalid message from {}: {}", peer, e);
                            continue;
                        }
                    };
                    debug!("Received {:?} from {}", event.kind(), peer);
                    self.rules.lock().await.consume(event, Origin::Peer(peer)).await
                }
                Ok(Some(Incoming::Disconnected { peer })) => {
                    info!("Peer {} disconnected", peer);
                    self.rules.lock().await.peer_lost(&peer).await
                }
                Ok(None) if self.shutdown.is_triggered() => break,
                Ok(None) => return self.fail(TransportError::Closed.into()).await,
                Err(e) if self.shutdown.is_triggered() => {
                    debug!("Receive ended during shutdown: {}", e);
                    break;
                }
                Err(e) => return self.fail(e.into()).await,
            };
            self.react(reactions).await;
        }
        Ok(())
    }

    async fn tick_loop(self: Arc<Self>) -> Result<(), SessionError> {
        let required = self.settings.num_players;
        let mut poll = tokio::time::interval(self.settings.tick);
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => return Ok(()),
                _ = poll.tick() => {}
            }
            if self.paddle_count().await >= required {
                break;
            }
        }
        tokio::select! {
            _ = self.shutdown.wait() => return Ok(()),
            _ = self.server.wait_for_peers(required) => {}
        }
        self.transition(CoordinatorState::Broadcasting);

        let mut ticker = Ticker::new(self.settings.tick);
        loop {
            let tick = tokio::select! {
                _ = self.shutdown.wait() => break,
                tick = ticker.next_event(&self.factory) => tick,
            };
            let Some(tick) = tick else { break };
            let reactions = self.rules.lock().await.consume(tick, Origin::Local).await;
            self.react(reactions).await;
        }
        Ok(())
    }

    async fn react(&self, reactions: Vec<Reaction>) {
        for reaction in reactions {
            match reaction {
                Reaction::Emit(event) => self.broadcast(&event).await,
                Reaction::Stop => self.drain().await,
                Reaction::Forget(peer) => self.server.forget(&peer).await,
            }
        }
    }

    /// Sends to every known peer; one failed send never stops the others.
    async fn broadcast(&self, event: &DomainEvent) {
        let payload = match codec::encode(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Refusing to broadcast invalid {:?}: {}", event.kind(), e);
                return;
            }
        };
        for peer in self.peers.handles().await {
            if let Err(e) = self.server.send(&peer, payload.as_bytes()).await {
                warn!("Send to {} failed: {}", peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::GameSnapshot;
    use crate::model::{ArenaConfig, Direction};

    fn peer(port: u16) -> PeerHandle {
        PeerHandle::Datagram(format!("127.0.0.1:{}", port).parse().unwrap())
    }

    fn rules() -> CoordinatorRules {
        CoordinatorRules::new("g", Pong::new(ArenaConfig::default()), PeerRegistry::new())
    }

    #[tokio::test]
    async fn test_join_binds_side_once() {
        let mut rules = rules();
        let alice = EventFactory::new("g", "alice");
        let bob = EventFactory::new("g", "bob");

        rules.consume(alice.join(Side::Left, None), Origin::Peer(peer(1))).await;
        rules.consume(bob.join(Side::Left, None), Origin::Peer(peer(2))).await;

        assert_eq!(rules.pong().paddles().len(), 1);
        assert_eq!(rules.peers.side_of(&peer(2)).await, None);
    }

    #[tokio::test]
    async fn test_move_only_affects_own_paddle() {
        let mut rules = rules();
        let alice = EventFactory::new("g", "alice");
        let bob = EventFactory::new("g", "bob");
        rules.consume(alice.join(Side::Left, None), Origin::Peer(peer(1))).await;
        rules.consume(bob.join(Side::Right, None), Origin::Peer(peer(2))).await;

        // Bob claims to move the left paddle; his own right paddle moves instead.
        rules
            .consume(bob.paddle_move(Side::Left, Direction::Up), Origin::Peer(peer(2)))
            .await;

        assert_eq!(rules.pong().paddle(Side::Left).unwrap().direction, Direction::None);
        assert_eq!(rules.pong().paddle(Side::Right).unwrap().direction, Direction::Up);
    }

    #[tokio::test]
    async fn test_last_leave_emits_game_over_and_stops() {
        let mut rules = rules();
        let alice = EventFactory::new("g", "alice");
        rules.consume(alice.join(Side::Left, None), Origin::Peer(peer(1))).await;

        let reactions = rules.consume(alice.leave(), Origin::Peer(peer(1))).await;

        assert_eq!(reactions.len(), 3);
        assert_eq!(reactions[0], Reaction::Forget(peer(1)));
        assert!(matches!(&reactions[1], Reaction::Emit(e) if e.kind() == crate::event::EventKind::GameOver));
        assert_eq!(reactions[2], Reaction::Stop);
        assert!(rules.peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_leave_releases_peer_while_others_play() {
        let mut rules = rules();
        let alice = EventFactory::new("g", "alice");
        let bob = EventFactory::new("g", "bob");
        rules.consume(alice.join(Side::Left, None), Origin::Peer(peer(1))).await;
        rules.consume(bob.join(Side::Right, None), Origin::Peer(peer(2))).await;

        let reactions = rules.consume(alice.leave(), Origin::Peer(peer(1))).await;

        assert_eq!(reactions, vec![Reaction::Forget(peer(1))]);
        assert_eq!(rules.peers.handles().await, vec![peer(2)]);
    }

    #[tokio::test]
    async fn test_only_joined_peers_are_broadcast_targets() {
        let mut rules = rules();
        let stranger = EventFactory::new("g", "mallory");

        rules
            .consume(stranger.paddle_move(Side::Left, Direction::Up), Origin::Peer(peer(9)))
            .await;
        rules.consume(stranger.leave(), Origin::Peer(peer(9))).await;

        assert!(rules.peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_disconnect_of_unbound_peer_is_ignored() {
        let mut rules = rules();
        rules.peers.register(peer(5)).await;
        assert!(rules.peer_lost(&peer(5)).await.is_empty());
    }

    #[tokio::test]
    async fn test_local_tick_emits_full_snapshot() {
        let mut rules = rules();
        let alice = EventFactory::new("g", "alice");
        rules.consume(alice.join(Side::Left, None), Origin::Peer(peer(1))).await;

        let clock = EventFactory::new("g", COORDINATOR_ID);
        let reactions = rules
            .consume(clock.time_elapsed(0.0, GameSnapshot::default()), Origin::Local)
            .await;

        match reactions.as_slice() {
            [Reaction::Emit(event)] => match &event.body {
                EventBody::TimeElapsed(tick) => {
                    assert_eq!(tick.game_state.paddles.len(), 1);
                    assert_eq!(tick.game_state.ball.x, 400.0);
                    assert_eq!(tick.game_state.ball.y, 300.0);
                }
                other => panic!("unexpected body {:?}", other),
            },
            other => panic!("unexpected reactions {:?}", other),
        }
    }
}
