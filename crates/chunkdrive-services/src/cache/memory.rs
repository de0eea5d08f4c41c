use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use super::{CacheError, EphemeralStore};

const EXPIRY_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Process-local cache.
///
/// Expired keys are evicted lazily on access and in bulk by
/// [`purge_expired`](Self::purge_expired); either way they are published to
/// expiry subscribers exactly once.
pub struct InMemoryEphemeralStore {
    entries: RwLock<HashMap<String, Entry>>,
    expired_tx: broadcast::Sender<String>,
}

impl Default for InMemoryEphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEphemeralStore {
    pub fn new() -> Self {
        let (expired_tx, _) = broadcast::channel(EXPIRY_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            expired_tx,
        }
    }

    fn publish_expired(&self, key: String) {
        // No subscribers is fine
        let _ = self.expired_tx.send(key);
    }

    /// Remove every expired key and notify subscribers. Returns the count.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut entries = self.entries.write().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        let count = expired.len();
        for key in expired {
            self.publish_expired(key);
        }
        count
    }

    /// Run [`purge_expired`](Self::purge_expired) every `period`.
    pub fn start_expiry_scanner(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = self.purge_expired().await;
                if purged > 0 {
                    tracing::debug!(purged, "Expired cache keys purged");
                }
            }
        })
    }

    /// Take an expired entry out, if that is what sits under `key`.
    async fn evict_if_expired(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                drop(entries);
                self.publish_expired(key.to_string());
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let replaced_expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(false),
            Some(_) => true,
            None => false,
        };
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        drop(entries);

        if replaced_expired {
            self.publish_expired(key.to_string());
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(Instant::now()) => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => {}
            }
        }
        self.evict_if_expired(key).await;
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        if self.evict_if_expired(key).await {
            return Ok(false);
        }
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn subscribe_expired(&self) -> broadcast::Receiver<String> {
        self.expired_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryEphemeralStore::new();
        store.set("a", "1".into(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = InMemoryEphemeralStore::new();
        assert!(store.set_if_absent("k", "first".into(), Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_if_absent("k", "second".into(), Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_set_if_absent_over_expired_key() {
        let store = InMemoryEphemeralStore::new();
        store.set("k", "old".into(), SHORT).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;

        assert!(store.set_if_absent("k", "new".into(), Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_lazy_expiry_publishes_once() {
        let store = InMemoryEphemeralStore::new();
        let mut expired = store.subscribe_expired();
        store.set("upload:1", "x".into(), SHORT).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;

        assert_eq!(store.get("upload:1").await.unwrap(), None);
        assert_eq!(store.get("upload:1").await.unwrap(), None);
        assert_eq!(expired.recv().await.unwrap(), "upload:1");
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_purge_and_keys() {
        let store = InMemoryEphemeralStore::new();
        let mut expired = store.subscribe_expired();
        store.set("upload:short", "x".into(), SHORT).await.unwrap();
        store.set("upload:long", "y".into(), Duration::from_secs(60)).await.unwrap();
        store.set("other", "z".into(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;

        assert_eq!(store.keys("upload:").await.unwrap(), vec!["upload:long".to_string()]);
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.purge_expired().await, 0);
        assert_eq!(expired.recv().await.unwrap(), "upload:short");
    }

    #[tokio::test]
    async fn test_explicit_delete_is_not_an_expiry() {
        let store = InMemoryEphemeralStore::new();
        let mut expired = store.subscribe_expired();
        store.set("k", "v".into(), Duration::from_secs(60)).await.unwrap();
        store.delete("k").await.unwrap();

        assert!(matches!(
            expired.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_scanner_publishes_without_reads() {
        let store = Arc::new(InMemoryEphemeralStore::new());
        let mut expired = store.subscribe_expired();
        store.set("upload:9", "x".into(), SHORT).await.unwrap();

        let scanner = store.clone().start_expiry_scanner(Duration::from_millis(20));
        let key = tokio::time::timeout(Duration::from_secs(2), expired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "upload:9");
        scanner.abort();
    }
}
