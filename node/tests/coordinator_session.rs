use pong_node::control::ChannelInput;
use pong_node::event::{EventBody, GameSnapshot};
use pong_node::transport::Address;
use pong_node::{
    Backend, Coordinator, CoordinatorSettings, CoordinatorState, DomainEvent, EventKind, Side,
    Terminal, TerminalSettings, TerminalState,
};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

async fn next_snapshot(events: &mut broadcast::Receiver<DomainEvent>) -> GameSnapshot {
    loop {
        let received = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no snapshot arrived");
        match received {
            Ok(event) => {
                if let EventBody::TimeElapsed(tick) = event.body {
                    return tick.game_state;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("terminal closed"),
        }
    }
}

fn terminal_settings(backend: Backend, address: &Address, player: &str, side: Side) -> TerminalSettings {
    TerminalSettings {
        game_id: "session-test".into(),
        player_id: player.into(),
        side,
        backend,
        address: address.clone(),
        ..TerminalSettings::default()
    }
}

async fn two_player_session(backend: Backend) {
    let coordinator = Coordinator::bind(CoordinatorSettings {
        game_id: "session-test".into(),
        backend,
        address: Address::new("127.0.0.1", 0),
        num_players: 2,
        ..CoordinatorSettings::default()
    })
    .await
    .unwrap();
    let address = coordinator.local_address();
    let mut coordinator_state = coordinator.subscribe_state();
    coordinator.start().unwrap();

    let alice = Terminal::connect(terminal_settings(backend, &address, "alice", Side::Left))
        .await
        .unwrap();
    let bob = Terminal::connect(terminal_settings(backend, &address, "bob", Side::Right))
        .await
        .unwrap();
    let mut bob_events = bob.subscribe();

    // Senders stay alive so the inputs never quit on their own.
    let (_alice_keys, alice_input) = ChannelInput::channel(Side::Left);
    let (_bob_keys, bob_input) = ChannelInput::channel(Side::Right);
    alice.start(Box::new(alice_input)).await.unwrap();
    bob.start(Box::new(bob_input)).await.unwrap();

    let first = next_snapshot(&mut bob_events).await;
    assert_eq!(first.paddles.len(), 2);
    assert_eq!((first.ball.x, first.ball.y), (400.0, 300.0));
    assert_eq!(coordinator.state(), CoordinatorState::Broadcasting);

    alice.stop().await.unwrap();
    loop {
        if next_snapshot(&mut bob_events).await.paddles.len() == 1 {
            break;
        }
    }
    assert_eq!(coordinator.paddle_count().await, 1);

    bob.stop().await.unwrap();
    timeout(
        Duration::from_secs(5),
        coordinator_state.wait_for(|s| *s == CoordinatorState::Closed),
    )
    .await
    .expect("coordinator never closed")
    .unwrap();
    coordinator.wait().await.unwrap();
    assert_eq!(coordinator.paddle_count().await, 0);
}

#[tokio::test]
async fn test_datagram_session_lifecycle() {
    two_player_session(Backend::Datagram).await;
}

#[tokio::test]
async fn test_stream_session_lifecycle() {
    two_player_session(Backend::Stream).await;
}

#[tokio::test]
async fn test_broker_session_lifecycle() {
    two_player_session(Backend::Broker).await;
}

#[tokio::test]
async fn test_stopping_coordinator_ends_datagram_terminals() {
    let coordinator = Coordinator::bind(CoordinatorSettings {
        address: Address::new("127.0.0.1", 0),
        num_players: 1,
        ..CoordinatorSettings::default()
    })
    .await
    .unwrap();
    coordinator.start().unwrap();
    let address = coordinator.local_address();

    let alice = Terminal::connect(terminal_settings(Backend::Datagram, &address, "alice", Side::Left))
        .await
        .unwrap();
    let mut events = alice.subscribe();
    let (_keys, input) = ChannelInput::channel(Side::Left);
    alice.start(Box::new(input)).await.unwrap();
    next_snapshot(&mut events).await;

    coordinator.stop().await.unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if event.kind() == EventKind::GameOver => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("terminal closed before GAME_OVER"),
            }
        }
    })
    .await
    .expect("GAME_OVER never arrived");
    let mut state = alice.subscribe_state();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == TerminalState::Closed))
        .await
        .expect("terminal never closed")
        .unwrap();
    alice.wait().await.unwrap();
}

#[tokio::test]
async fn test_quit_input_ends_single_player_game() {
    let coordinator = Coordinator::bind(CoordinatorSettings {
        address: Address::new("127.0.0.1", 0),
        num_players: 1,
        ..CoordinatorSettings::default()
    })
    .await
    .unwrap();
    coordinator.start().unwrap();
    let address = coordinator.local_address();

    let alice = Terminal::connect(terminal_settings(Backend::Datagram, &address, "alice", Side::Left))
        .await
        .unwrap();
    let mut events = alice.subscribe();
    let (keys, input) = ChannelInput::channel(Side::Left);
    alice.start(Box::new(input)).await.unwrap();

    next_snapshot(&mut events).await;
    // Quitting through the input sends PLAYER_LEAVE; the empty game ends.
    keys.send(pong_node::control::Input::Quit).unwrap();
    alice.wait().await.unwrap();
    let mut state = coordinator.subscribe_state();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == CoordinatorState::Closed))
        .await
        .expect("coordinator never closed")
        .unwrap();
    coordinator.stop().await.unwrap();
}
