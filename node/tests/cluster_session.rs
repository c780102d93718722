use pong_node::cluster::{ClusterPeer, GameDocument, GameStatus};
use pong_node::control::{ChannelInput, Input};
use pong_node::{ArenaConfig, ClusterSettings, Direction, MemCoordinator, Side, Timing};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

fn settings(node_id: &str, side: Side) -> ClusterSettings {
    ClusterSettings {
        game_id: "cluster-test".into(),
        node_id: node_id.into(),
        side,
        capacity: 2,
        paddle_step: 10.0,
        timing: Timing {
            tick: Duration::from_millis(5),
            replication_interval: Duration::from_millis(20),
            lease_ttl: Duration::from_millis(500),
            refresh_interval: Duration::from_millis(100),
            event_ttl: Duration::from_secs(5),
            document_ttl: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(20),
        },
        arena: ArenaConfig::default(),
    }
}

async fn wait_for_document(
    documents: &mut watch::Receiver<Option<GameDocument>>,
    what: &str,
    condition: impl Fn(&GameDocument) -> bool,
) -> GameDocument {
    let matched = timeout(
        Duration::from_secs(3),
        documents.wait_for(|doc| doc.as_ref().map(&condition).unwrap_or(false)),
    )
    .await
    .unwrap_or_else(|_| panic!("document never reached: {}", what))
    .unwrap();
    matched.clone().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_peers_converge_on_one_document() {
    let store = MemCoordinator::new();
    store.start(Duration::from_millis(10));

    let a = ClusterPeer::new(Arc::new(store.clone()), settings("a", Side::Left)).unwrap();
    let b = ClusterPeer::new(Arc::new(store.clone()), settings("b", Side::Right)).unwrap();
    let (a_keys, a_input) = ChannelInput::channel(Side::Left);
    let (_b_keys, b_input) = ChannelInput::channel(Side::Right);
    a.start(Box::new(a_input)).await.unwrap();
    b.start(Box::new(b_input)).await.unwrap();

    let mut a_view = a.subscribe_document();
    let mut b_view = b.subscribe_document();
    let playing = |doc: &GameDocument| doc.players.len() == 2 && doc.game_state == GameStatus::Playing;
    let seen_by_a = wait_for_document(&mut a_view, "two players", playing).await;
    wait_for_document(&mut b_view, "two players", playing).await;
    assert!(seen_by_a.approved);
    assert_eq!([a.is_leader(), b.is_leader()].iter().filter(|l| **l).count(), 1);

    let home = ArenaConfig::default().paddle_home(Side::Left);
    a_keys.send(Input::Press(Direction::Down)).unwrap();
    let moved = wait_for_document(&mut b_view, "left paddle moved", |doc| {
        doc.player("a").map(|p| p.y != home.y).unwrap_or(false)
    })
    .await;
    let left = moved.player("a").unwrap();
    assert_eq!((left.y - home.y).abs(), 10.0);
    assert_eq!(left.x, home.x);

    // Whoever leads, the survivor ends up replicating b's departure.
    b.stop().await;
    let remaining = wait_for_document(&mut a_view, "one player", |doc| doc.players.len() == 1).await;
    assert_eq!(remaining.players[0].player_id, "a");
    timeout(Duration::from_secs(3), async {
        while !a.is_leader() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("survivor never took over");

    a.stop().await;
}
