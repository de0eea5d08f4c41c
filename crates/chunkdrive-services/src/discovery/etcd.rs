use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, Watcher,
};
use futures::stream;
use std::collections::VecDeque;
use std::time::Duration;

use super::coordinator::{Coordinator, CoordinatorError, LeaseId, WatchEvent, WatchStream};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator backed by an etcd v3 cluster.
///
/// The client is a cheap handle over one gRPC channel; every call clones it.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    pub async fn connect(
        endpoints: &[String],
        request_timeout: Duration,
    ) -> Result<Self, CoordinatorError> {
        if endpoints.is_empty() {
            return Err(CoordinatorError::Unavailable(
                "no etcd endpoints configured".to_string(),
            ));
        }
        let options = ConnectOptions::new()
            .with_connect_timeout(DIAL_TIMEOUT)
            .with_timeout(request_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(unavailable)?;

        tracing::info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }
}

fn unavailable(err: etcd_client::Error) -> CoordinatorError {
    CoordinatorError::Unavailable(err.to_string())
}

fn is_lease_not_found(message: &str) -> bool {
    message.contains("requested lease not found")
}

/// Map an etcd error on a lease-bound call, keeping "lease gone" distinct.
fn lease_error(lease: LeaseId, err: etcd_client::Error) -> CoordinatorError {
    if is_lease_not_found(&err.to_string()) {
        CoordinatorError::LeaseNotFound(lease)
    } else {
        unavailable(err)
    }
}

fn to_watch_event(kind: EventType, key: &[u8], value: &[u8]) -> Option<WatchEvent> {
    let key = std::str::from_utf8(key).ok()?.to_string();
    match kind {
        EventType::Put => Some(WatchEvent::Put {
            key,
            value: std::str::from_utf8(value).ok()?.to_string(),
        }),
        EventType::Delete => Some(WatchEvent::Delete { key }),
    }
}

struct WatchState {
    // Dropping the watcher cancels the server-side watch.
    _watcher: Watcher,
    stream: etcd_client::WatchStream,
    pending: VecDeque<WatchEvent>,
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinatorError> {
        let ttl = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let response = self
            .client
            .clone()
            .lease_grant(ttl, None)
            .await
            .map_err(unavailable)?;
        Ok(response.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
        let (mut keeper, mut responses) = self
            .client
            .clone()
            .lease_keep_alive(lease)
            .await
            .map_err(|e| lease_error(lease, e))?;
        keeper.keep_alive().await.map_err(|e| lease_error(lease, e))?;

        match responses.message().await {
            // etcd answers a renewal of an unknown lease with TTL 0.
            Ok(Some(response)) if response.ttl() > 0 => Ok(()),
            Ok(_) => Err(CoordinatorError::LeaseNotFound(lease)),
            Err(e) => Err(lease_error(lease, e)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
        self.client
            .clone()
            .lease_revoke(lease)
            .await
            .map_err(|e| lease_error(lease, e))?;
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordinatorError> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let result = self.client.clone().put(key, value, options).await;
        match (result, lease) {
            (Ok(_), _) => Ok(()),
            (Err(e), Some(id)) => Err(lease_error(id, e)),
            (Err(e), None) => Err(unavailable(e)),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordinatorError> {
        let response = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let mut entries = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match (kv.key_str(), kv.value_str()) {
                (Ok(key), Ok(value)) => entries.push((key.to_string(), value.to_string())),
                _ => tracing::warn!(prefix = %prefix, "Skipping non-UTF-8 etcd entry"),
            }
        }
        Ok(entries)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordinatorError> {
        let (watcher, stream) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let state = WatchState {
            _watcher: watcher,
            stream,
            pending: VecDeque::new(),
        };
        let prefix = prefix.to_string();

        let events = stream::unfold(state, move |mut state| {
            let prefix = prefix.clone();
            async move {
                loop {
                    if let Some(event) = state.pending.pop_front() {
                        return Some((event, state));
                    }
                    match state.stream.message().await {
                        Ok(Some(response)) => {
                            if response.canceled() {
                                tracing::warn!(
                                    prefix = %prefix,
                                    compact_revision = response.compact_revision(),
                                    "etcd watch canceled"
                                );
                                return None;
                            }
                            state.pending.extend(response.events().iter().filter_map(|event| {
                                let kv = event.kv()?;
                                to_watch_event(event.event_type(), kv.key(), kv.value())
                            }));
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            tracing::warn!(prefix = %prefix, error = %e, "etcd watch failed");
                            return None;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_conversion() {
        assert_eq!(
            to_watch_event(EventType::Put, b"/services/n/a", b"{}"),
            Some(WatchEvent::Put {
                key: "/services/n/a".into(),
                value: "{}".into()
            })
        );
        // Delete events carry no value
        assert_eq!(
            to_watch_event(EventType::Delete, b"/services/n/a", b""),
            Some(WatchEvent::Delete {
                key: "/services/n/a".into()
            })
        );
        assert_eq!(to_watch_event(EventType::Put, &[0xff, 0xfe], b"{}"), None);
    }

    #[test]
    fn test_lease_not_found_detection() {
        assert!(is_lease_not_found(
            "grpc request error: status: NotFound, message: \"etcdserver: requested lease not found\""
        ));
        assert!(!is_lease_not_found("transport error"));
    }

    #[tokio::test]
    async fn test_connect_without_endpoints_fails() {
        let result = EtcdCoordinator::connect(&[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CoordinatorError::Unavailable(_))));
    }
}
