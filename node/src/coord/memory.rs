use super::{CoordinationService, KeyValue, LeaseId, WatchEvent, Watcher};
use crate::error::CoordError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
    mod_revision: u64,
}

struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct Store {
    revision: u64,
    next_lease: LeaseId,
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseRecord>,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
}

impl Store {
    fn key_value(key: &str, entry: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            lease: entry.lease,
            mod_revision: entry.mod_revision,
        }
    }

    fn notify(&mut self, key: &str, event: WatchEvent) {
        self.watchers.retain(|(watched, tx)| {
            if watched == key {
                tx.send(event.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    /// Drops every lease whose deadline has passed. Returns how many expired.
    fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.drop_lease(*id);
        }
        expired.len()
    }

    fn drop_lease(&mut self, id: LeaseId) {
        let Some(record) = self.leases.remove(&id) else {
            return;
        };
        for key in record.keys {
            let bound = self.entries.get(&key).map(|e| e.lease == Some(id)).unwrap_or(false);
            if bound {
                self.remove_key(&key);
            }
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(record) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            record.keys.remove(key);
        }
        self.revision += 1;
        self.notify(key, WatchEvent::Delete { key: key.to_string() });
        true
    }

    fn write(&mut self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordError> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(CoordError::LeaseExpired(id));
            }
        }
        let previous = self.entries.get(key).and_then(|e| e.lease);
        if let Some(record) = previous.and_then(|id| self.leases.get_mut(&id)) {
            record.keys.remove(key);
        }
        if let Some(record) = lease.and_then(|id| self.leases.get_mut(&id)) {
            record.keys.insert(key.to_string());
        }

        self.revision += 1;
        let entry = Entry {
            value: value.to_string(),
            lease,
            mod_revision: self.revision,
        };
        let kv = Self::key_value(key, &entry);
        self.entries.insert(key.to_string(), entry);
        self.notify(key, WatchEvent::Put(kv));
        Ok(())
    }
}

struct Inner {
    store: Mutex<Store>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// In-process coordination service.
///
/// Leases expire lazily on every operation and, once [`MemCoordinator::start`]
/// has been called, from a background sweep so watchers see deletions of
/// keys nobody touches.
#[derive(Clone)]
pub struct MemCoordinator {
    inner: Arc<Inner>,
}

impl MemCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store::default()),
                reaper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Starts the expiry sweep. Calling it again while running does nothing.
    pub fn start(&self, sweep: Duration) {
        let Ok(mut slot) = self.inner.reaper.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let expired = inner.store.lock().await.expire(Instant::now());
                if expired > 0 {
                    debug!("Expired {} leases", expired);
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.inner.reaper.lock() {
            if let Some(reaper) = slot.take() {
                reaper.abort();
            }
        }
    }

    async fn store(&self) -> tokio::sync::MutexGuard<'_, Store> {
        let mut store = self.inner.store.lock().await;
        store.expire(Instant::now());
        store
    }
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationService for MemCoordinator {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordError> {
        let mut store = self.store().await;
        store.next_lease += 1;
        let id = store.next_lease;
        store.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<(), CoordError> {
        let mut store = self.store().await;
        let record = store
            .leases
            .get_mut(&lease)
            .ok_or(CoordError::LeaseExpired(lease))?;
        record.deadline = Instant::now() + record.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordError> {
        self.store().await.drop_lease(lease);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordError> {
        let store = self.store().await;
        Ok(store.entries.get(key).map(|entry| Store::key_value(key, entry)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordError> {
        let store = self.store().await;
        Ok(store
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| Store::key_value(key, entry))
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordError> {
        self.store().await.write(key, value, lease)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, CoordError> {
        let mut store = self.store().await;
        if store.entries.contains_key(key) {
            return Ok(false);
        }
        store.write(key, value, lease)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordError> {
        Ok(self.store().await.remove_key(key))
    }

    async fn watch(&self, key: &str) -> Result<Watcher, CoordError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.store().await.watchers.push((key.to_string(), tx));
        Ok(Watcher::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_and_prefix() {
        let coord = MemCoordinator::new();
        coord.put("pong_events/b", "2", None).await.unwrap();
        coord.put("pong_events/a", "1", None).await.unwrap();
        coord.put("pong_lobby", "doc", None).await.unwrap();

        let events = coord.get_prefix("pong_events/").await.unwrap();
        let keys: Vec<&str> = events.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["pong_events/a", "pong_events/b"]);
        assert_eq!(coord.get("pong_lobby").await.unwrap().unwrap().value, "doc");
        assert!(coord.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_if_absent_only_creates_once() {
        let coord = MemCoordinator::new();
        assert!(coord.put_if_absent("election/leader", "a", None).await.unwrap());
        assert!(!coord.put_if_absent("election/leader", "b", None).await.unwrap());
        assert_eq!(coord.get("election/leader").await.unwrap().unwrap().value, "a");
    }

    #[tokio::test]
    async fn test_revisions_increase() {
        let coord = MemCoordinator::new();
        coord.put("k", "1", None).await.unwrap();
        let first = coord.get("k").await.unwrap().unwrap().mod_revision;
        coord.put("k", "2", None).await.unwrap();
        let second = coord.get("k").await.unwrap().unwrap().mod_revision;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_expired_lease_deletes_keys_and_notifies_watchers() {
        let coord = MemCoordinator::new();
        coord.start(Duration::from_millis(10));
        let lease = coord.grant_lease(Duration::from_millis(50)).await.unwrap();
        coord.put("election/leader", "a", Some(lease)).await.unwrap();
        let mut watcher = coord.watch("election/leader").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), watcher.next())
            .await
            .expect("deletion should be observed")
            .unwrap();
        assert_eq!(event, WatchEvent::Delete { key: "election/leader".into() });
        assert!(coord.get("election/leader").await.unwrap().is_none());
        assert!(matches!(
            coord.refresh_lease(lease).await,
            Err(CoordError::LeaseExpired(id)) if id == lease
        ));
        coord.stop();
    }

    #[tokio::test]
    async fn test_refresh_keeps_lease_alive() {
        let coord = MemCoordinator::new();
        let lease = coord.grant_lease(Duration::from_millis(80)).await.unwrap();
        coord.put("k", "v", Some(lease)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            coord.refresh_lease(lease).await.unwrap();
        }
        assert!(coord.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_with_dead_lease_fails() {
        let coord = MemCoordinator::new();
        assert!(matches!(
            coord.put("k", "v", Some(42)).await,
            Err(CoordError::LeaseExpired(42))
        ));
    }

    #[tokio::test]
    async fn test_revoke_deletes_only_keys_still_bound() {
        let coord = MemCoordinator::new();
        let first = coord.grant_lease(Duration::from_secs(10)).await.unwrap();
        let second = coord.grant_lease(Duration::from_secs(10)).await.unwrap();
        coord.put("a", "1", Some(first)).await.unwrap();
        coord.put("b", "1", Some(first)).await.unwrap();
        coord.put("b", "2", Some(second)).await.unwrap();

        coord.revoke_lease(first).await.unwrap();
        assert!(coord.get("a").await.unwrap().is_none());
        assert_eq!(coord.get("b").await.unwrap().unwrap().value, "2");
    }

    #[tokio::test]
    async fn test_watch_sees_puts_for_its_key_only() {
        let coord = MemCoordinator::new();
        let mut watcher = coord.watch("pong_lobby").await.unwrap();
        coord.put("other", "x", None).await.unwrap();
        coord.put("pong_lobby", "doc", None).await.unwrap();

        match watcher.next().await.unwrap() {
            WatchEvent::Put(kv) => assert_eq!(kv.value, "doc"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
