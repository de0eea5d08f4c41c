use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{CacheError, EphemeralStore};

const EXPIRY_CHANNEL_CAPACITY: usize = 1024;
const EXPIRED_EVENTS_PATTERN: &str = "__keyevent@*__:expired";
const SCAN_BATCH: usize = 200;
const RESUBSCRIBE_INITIAL: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// Cache shared by every process through one Redis server.
///
/// Expiry comes from Redis itself; the keyspace `expired` event feed is
/// relayed to [`subscribe_expired`](EphemeralStore::subscribe_expired).
pub struct RedisEphemeralStore {
    client: Client,
    connection: ConnectionManager,
    expired_tx: broadcast::Sender<String>,
}

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

/// Redis rejects `PX 0`; sub-millisecond TTLs round up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `MATCH` pattern selecting keys that start with `prefix` literally.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

impl RedisEphemeralStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(unavailable)?;
        let mut connection = client
            .get_connection_manager()
            .await
            .map_err(unavailable)?;

        // Managed servers may refuse CONFIG; they must be configured out of band.
        let enabled: Result<(), _> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut connection)
            .await;
        if let Err(e) = enabled {
            tracing::warn!(
                error = %e,
                "Could not enable keyspace expiry events; set notify-keyspace-events=Ex on the server"
            );
        }

        let (expired_tx, _) = broadcast::channel(EXPIRY_CHANNEL_CAPACITY);
        tracing::info!("Connected to Redis ephemeral store");
        Ok(Self {
            client,
            connection,
            expired_tx,
        })
    }

    /// Relay expiry events until aborted, re-subscribing when the feed drops.
    pub fn start_expiry_listener(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let expired_tx = self.expired_tx.clone();

        tokio::spawn(async move {
            let mut delay = RESUBSCRIBE_INITIAL;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => match pubsub.psubscribe(EXPIRED_EVENTS_PATTERN).await {
                        Ok(()) => {
                            tracing::debug!("Subscribed to Redis expiry events");
                            delay = RESUBSCRIBE_INITIAL;
                            let mut messages = pubsub.into_on_message();
                            while let Some(message) = messages.next().await {
                                match message.get_payload::<String>() {
                                    Ok(key) => {
                                        // No subscribers is fine
                                        let _ = expired_tx.send(key);
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Malformed expiry event")
                                    }
                                }
                            }
                            tracing::warn!("Redis expiry feed closed");
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to subscribe to expiry events"),
                    },
                    Err(e) => tracing::warn!(error = %e, "Failed to open Redis pub/sub connection"),
                }

                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RESUBSCRIBE_MAX);
            }
        })
    }
}

#[async_trait]
impl EphemeralStore for RedisEphemeralStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut connection = self.connection.clone();
        let stored: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(stored.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut connection = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut connection = self.connection.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut connection = self.connection.clone();
        let pattern = scan_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn subscribe_expired(&self) -> broadcast::Receiver<String> {
        self.expired_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_pattern_escapes_glob_characters() {
        assert_eq!(scan_pattern("upload:"), "upload:*");
        assert_eq!(scan_pattern("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
        assert_eq!(scan_pattern(""), "*");
    }

    #[test]
    fn test_ttl_rounds_up_to_one_millisecond() {
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = RedisEphemeralStore::connect("not a url").await;
        assert!(matches!(result, Err(CacheError::Unavailable(_))));
    }
}
