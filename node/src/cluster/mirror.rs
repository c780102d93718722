use super::document::GameDocument;
use crate::coord::{CoordinationService, WatchEvent, DOCUMENT_KEY};
use crate::event::codec;
use crate::model::{ArenaConfig, Pong};
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Keeps a local [`Pong`] in step with the canonical document.
pub struct DocumentMirror {
    coord: Arc<dyn CoordinationService>,
    pong: Mutex<Pong>,
    document: watch::Sender<Option<GameDocument>>,
    retry_backoff: Duration,
    shutdown: Shutdown,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DocumentMirror {
    pub fn new(
        coord: Arc<dyn CoordinationService>,
        arena: ArenaConfig,
        retry_backoff: Duration,
    ) -> Arc<Self> {
        let (document, _) = watch::channel(None);
        Arc::new(Self {
            coord,
            pong: Mutex::new(Pong::new(arena)),
            document,
            retry_backoff,
            shutdown: Shutdown::new(),
            task: std::sync::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_none() {
            *task = Some(tokio::spawn(self.clone().run()));
        }
    }

    pub async fn stop(&self) {
        self.shutdown.trigger();
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn pong(&self) -> Pong {
        self.pong.lock().await.clone()
    }

    /// Last document seen, if any.
    pub fn document(&self) -> Option<GameDocument> {
        self.document.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<GameDocument>> {
        self.document.subscribe()
    }

    async fn apply(&self, text: &str) {
        match codec::decode_document(text) {
            Ok(document) => {
                self.pong.lock().await.apply_document(&document);
                self.document.send_replace(Some(document));
            }
            Err(e) => warn!("Ignoring invalid canonical document: {}", e),
        }
    }

    async fn run(self: Arc<Self>) {
        while !self.shutdown.is_triggered() {
            let mut watcher = match self.coord.watch(DOCUMENT_KEY).await {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!("Watching {} failed: {}", DOCUMENT_KEY, e);
                    self.pause().await;
                    continue;
                }
            };
            match self.coord.get(DOCUMENT_KEY).await {
                Ok(Some(kv)) => self.apply(&kv.value).await,
                Ok(None) => {}
                Err(e) => warn!("Reading {} failed: {}", DOCUMENT_KEY, e),
            }

            loop {
                tokio::select! {
                    _ = self.shutdown.wait() => return,
                    event = watcher.next() => match event {
                        Some(WatchEvent::Put(kv)) => self.apply(&kv.value).await,
                        Some(WatchEvent::Delete { .. }) => debug!("Canonical document expired"),
                        None => {
                            info!("Document watch ended, re-subscribing");
                            self.pause().await;
                            break;
                        }
                    },
                }
            }
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = tokio::time::sleep(self.retry_backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PlayerEntry;
    use crate::coord::MemCoordinator;
    use crate::model::{Direction, Side, Vec2};

    #[tokio::test]
    async fn test_mirror_overwrites_from_document() {
        let coord = MemCoordinator::new();
        let mirror = DocumentMirror::new(
            Arc::new(coord.clone()),
            ArenaConfig::default(),
            Duration::from_millis(20),
        );
        let mut updates = mirror.subscribe();
        mirror.start();

        let mut document = GameDocument::empty("g", &ArenaConfig::default());
        document.ball.position = Vec2::new(12.0, 34.0);
        document.players.push(PlayerEntry {
            player_id: "alice".into(),
            x: 20.0,
            y: 250.0,
            direction: Direction::Left,
        });
        // The watch may register after this put; the initial read covers that case.
        tokio::time::sleep(Duration::from_millis(20)).await;
        coord
            .put(DOCUMENT_KEY, &codec::encode_document(&document).unwrap(), None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), updates.wait_for(|d| d.is_some()))
            .await
            .unwrap()
            .unwrap();
        let pong = mirror.pong().await;
        assert_eq!(pong.ball.position, Vec2::new(12.0, 34.0));
        assert_eq!(pong.paddle(Side::Left).unwrap().position, Vec2::new(20.0, 250.0));
        assert_eq!(mirror.document(), Some(document));
        mirror.stop().await;
    }
}
