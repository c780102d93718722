use super::{EventSink, InputSource, Origin, Reaction};
use crate::config::TerminalSettings;
use crate::error::{SessionError, TransportError};
use crate::event::{codec, DomainEvent, EventBody, EventFactory, EventKind};
use crate::model::Pong;
use crate::shutdown::Shutdown;
use crate::transport::{self, Session};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Connecting,
    Joined,
    Running,
    Leaving,
    Closed,
}

/// Pure state mirror: snapshots overwrite the local simulation wholesale.
pub struct MirrorSink {
    pong: Pong,
}

impl MirrorSink {
    pub fn new(pong: Pong) -> Self {
        Self { pong }
    }

    pub fn pong(&self) -> &Pong {
        &self.pong
    }
}

#[async_trait]
impl EventSink for MirrorSink {
    async fn consume(&mut self, event: DomainEvent, origin: Origin) -> Vec<Reaction> {
        match origin {
            Origin::Local => match event.kind() {
                EventKind::PaddleMove => vec![Reaction::Emit(event)],
                EventKind::PlayerLeave => vec![Reaction::Emit(event), Reaction::Stop],
                _ => Vec::new(),
            },
            Origin::Authority => match event.body {
                EventBody::TimeElapsed(tick) => {
                    self.pong.apply_snapshot(&tick.game_state);
                    Vec::new()
                }
                EventBody::GameOver => {
                    info!("Game over");
                    vec![Reaction::Stop]
                }
                _ => Vec::new(),
            },
            Origin::Peer(_) => Vec::new(),
        }
    }
}

/// Thin client of the single-coordinator architecture: sends one player's
/// input and mirrors the coordinator's snapshots.
pub struct Terminal {
    settings: TerminalSettings,
    session: Arc<dyn Session>,
    factory: EventFactory,
    sink: Mutex<MirrorSink>,
    events: broadcast::Sender<DomainEvent>,
    state: watch::Sender<TerminalState>,
    shutdown: Shutdown,
    started: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<Result<(), SessionError>>>>,
}

impl Terminal {
    pub async fn connect(settings: TerminalSettings) -> Result<Arc<Self>, SessionError> {
        let session =
            transport::connect(settings.backend, &settings.address, &settings.transport_options())
                .await?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(TerminalState::Connecting);

        Ok(Arc::new(Self {
            factory: EventFactory::new(settings.game_id.clone(), settings.player_id.clone()),
            sink: Mutex::new(MirrorSink::new(Pong::new(settings.arena.clone()))),
            settings,
            session,
            events,
            state,
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    /// Sends PLAYER_JOIN, then runs the receive loop and `input` in the background.
    pub async fn start(self: &Arc<Self>, input: Box<dyn InputSource>) -> Result<(), SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        self.send(&self.factory.join(self.settings.side, None)).await?;
        self.transition(TerminalState::Joined);

        let receiver = tokio::spawn(self.clone().receive_loop());
        let driver = tokio::spawn(self.clone().input_loop(input));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(receiver);
            tasks.push(driver);
        }
        self.transition(TerminalState::Running);
        Ok(())
    }

    /// Leaves the game, then waits for the background tasks.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.leave().await;
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
                Err(e) => error!("Terminal task panicked: {}", e),
            }
        }
        outcome
    }

    /// Sends PLAYER_LEAVE and closes the transport. Only the first call has any effect.
    pub async fn leave(&self) {
        if !self.begin_leaving() {
            return;
        }
        info!("Terminal {} leaving", self.factory.player_id());
        if let Err(e) = self.send(&self.factory.leave()).await {
            warn!("Failed to send leave: {}", e);
        }
        self.close().await;
    }

    /// Closes without telling the coordinator, which already ended the game
    /// or was told through an emitted PLAYER_LEAVE.
    async fn finish(&self) {
        if self.begin_leaving() {
            self.close().await;
        }
    }

    fn begin_leaving(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, TerminalState::Leaving | TerminalState::Closed) {
                return false;
            }
            *state = TerminalState::Leaving;
            true
        })
    }

    /// Every decoded event received from the coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Copy of the mirrored simulation.
    pub async fn pong(&self) -> Pong {
        self.sink.lock().await.pong().clone()
    }

    pub fn state(&self) -> TerminalState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TerminalState> {
        self.state.subscribe()
    }

    pub fn player_id(&self) -> &str {
        self.factory.player_id()
    }

    fn transition(&self, next: TerminalState) {
        self.state.send_if_modified(|state| {
            // Never leave a terminal state behind once shutdown started.
            if *state == next || (*state == TerminalState::Closed) {
                return false;
            }
            if matches!(*state, TerminalState::Leaving) && next != TerminalState::Closed {
                return false;
            }
            info!("Terminal {:?} -> {:?}", *state, next);
            *state = next;
            true
        });
    }

    async fn close(&self) {
        self.shutdown.trigger();
        self.session.close().await;
        self.transition(TerminalState::Closed);
    }

    async fn fail(&self, err: SessionError) -> Result<(), SessionError> {
        error!("Terminal {} lost its session: {}", self.factory.player_id(), err);
        self.close().await;
        Err(err)
    }

    async fn send(&self, event: &DomainEvent) -> Result<(), SessionError> {
        let payload = codec::encode(event)?;
        self.session.send(payload.as_bytes()).await?;
        debug!("Sent {:?}", event.kind());
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>) -> Result<(), SessionError> {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.wait() => break,
                received = self.session.receive() => received,
            };
            let payload = match received {
                Ok(Some(payload)) => payload,
                Ok(None) if self.shutdown.is_triggered() => break,
                Ok(None) => return self.fail(TransportError::Closed.into()).await,
                Err(e) if self.shutdown.is_triggered() => {
                    debug!("Receive ended during shutdown: {}", e);
                    break;
                }
                Err(e) => return self.fail(e.into()).await,
            };
            let event = match codec::decode_bytes(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Dropping invalid message: {}", e);
                    continue;
                }
            };
            let _ = self.events.send(event.clone());
            let reactions = self.sink.lock().await.consume(event, Origin::Authority).await;
            self.react(reactions).await;
        }
        Ok(())
    }

    async fn input_loop(self: Arc<Self>, mut input: Box<dyn InputSource>) -> Result<(), SessionError> {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.wait() => break,
                next = input.next_event(&self.factory) => next,
            };
            let Some(event) = next else {
                self.leave().await;
                break;
            };
            let reactions = self.sink.lock().await.consume(event, Origin::Local).await;
            self.react(reactions).await;
        }
        Ok(())
    }

    async fn react(&self, reactions: Vec<Reaction>) {
        for reaction in reactions {
            match reaction {
                Reaction::Emit(event) => {
                    if let Err(e) = self.send(&event).await {
                        warn!("Failed to send {:?}: {}", event.kind(), e);
                    }
                }
                Reaction::Stop => self.finish().await,
                Reaction::Forget(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ChannelInput;
    use crate::event::{BallState, GameSnapshot, PaddleState};
    use crate::model::{ArenaConfig, Direction, Side, Vec2};
    use crate::transport::Address;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_snapshot_overwrites_local_state() {
        let mut pong = Pong::new(ArenaConfig::default());
        pong.add_paddle(Side::Left);
        pong.add_paddle(Side::Right);
        pong.reset_ball();
        pong.update(0.1);
        let mut sink = MirrorSink::new(pong);

        let snapshot = GameSnapshot {
            ball: BallState {
                x: 123.5,
                y: 77.25,
                vx: -3.0,
                vy: 4.0,
            },
            paddles: vec![PaddleState {
                side: Side::Up,
                x: 200.0,
                y: 20.0,
                direction: Direction::None,
            }],
        };
        let event = EventFactory::new("g", "coordinator").time_elapsed(0.016, snapshot);
        let reactions = sink.consume(event, Origin::Authority).await;

        assert!(reactions.is_empty());
        assert_eq!(sink.pong().ball.position, Vec2::new(123.5, 77.25));
        assert_eq!(sink.pong().ball.velocity, Vec2::new(-3.0, 4.0));
        assert_eq!(sink.pong().paddles().len(), 1);
        assert!(sink.pong().has_paddle(Side::Up));
    }

    #[tokio::test]
    async fn test_local_moves_are_emitted_and_game_over_stops() {
        let mut sink = MirrorSink::new(Pong::new(ArenaConfig::default()));
        let alice = EventFactory::new("g", "alice");

        let movement = alice.paddle_move(Side::Left, Direction::Down);
        assert_eq!(
            sink.consume(movement.clone(), Origin::Local).await,
            vec![Reaction::Emit(movement)]
        );
        let leave = alice.leave();
        assert_eq!(
            sink.consume(leave.clone(), Origin::Local).await,
            vec![Reaction::Emit(leave), Reaction::Stop]
        );

        let over = EventFactory::new("g", "coordinator").game_over();
        assert_eq!(sink.consume(over, Origin::Authority).await, vec![Reaction::Stop]);
    }

    #[tokio::test]
    async fn test_game_over_closes_without_sending_leave() {
        let coordinator = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = coordinator.local_addr().unwrap().port();
        let terminal = Terminal::connect(TerminalSettings {
            game_id: "g".into(),
            player_id: "alice".into(),
            address: Address::new("127.0.0.1", port),
            ..TerminalSettings::default()
        })
        .await
        .unwrap();
        let (_keys, input) = ChannelInput::channel(Side::Left);
        terminal.start(Box::new(input)).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, from) = timeout(Duration::from_secs(2), coordinator.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(codec::decode_bytes(&buf[..len]).unwrap().kind(), EventKind::PlayerJoin);

        let over = codec::encode(&EventFactory::new("g", "coordinator").game_over()).unwrap();
        coordinator.send_to(over.as_bytes(), from).await.unwrap();

        let mut state = terminal.subscribe_state();
        timeout(Duration::from_secs(2), state.wait_for(|s| *s == TerminalState::Closed))
            .await
            .unwrap()
            .unwrap();
        terminal.wait().await.unwrap();
        assert!(timeout(Duration::from_millis(100), coordinator.recv_from(&mut buf))
            .await
            .is_err());
    }
}
