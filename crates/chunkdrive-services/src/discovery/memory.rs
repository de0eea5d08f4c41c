use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use super::coordinator::{Coordinator, CoordinatorError, LeaseId, WatchEvent, WatchStream};

fn event_key(event: &WatchEvent) -> Option<&str> {
    match event {
        WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => Some(key),
        WatchEvent::Resync => None,
    }
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Default)]
struct State {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    kv: BTreeMap<String, (String, Option<LeaseId>)>,
}

impl State {
    /// Remove a lease and its keys, returning the deleted keys.
    fn drop_lease(&mut self, lease: LeaseId) -> Option<Vec<String>> {
        let lease = self.leases.remove(&lease)?;
        let mut removed = Vec::new();
        for key in lease.keys {
            if self.kv.remove(&key).is_some() {
                removed.push(key);
            }
        }
        Some(removed)
    }
}

/// Process-local coordinator for tests and single-process setups.
///
/// Leases only lapse when [`expire_leases`](Self::expire_leases) runs.
pub struct InMemoryCoordinator {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State {
                next_lease: 1,
                ..Default::default()
            }),
            events,
        }
    }

    fn emit(&self, event: WatchEvent) {
        let _ = self.events.send(event);
    }

    /// Drop every lease past its deadline. Returns the number of leases dropped.
    pub async fn expire_leases(&self) -> usize {
        let now = Instant::now();
        let mut deleted = Vec::new();
        let mut count = 0;
        {
            let mut state = self.state.lock().await;
            let expired: Vec<LeaseId> = state
                .leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for lease in expired {
                if let Some(keys) = state.drop_lease(lease) {
                    count += 1;
                    deleted.extend(keys);
                }
            }
        }

        for key in deleted {
            tracing::debug!(key = %key, "Lease expired, key removed");
            self.emit(WatchEvent::Delete { key });
        }
        count
    }

    pub fn start_expiry(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.expire_leases().await;
            }
        })
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinatorError> {
        let mut state = self.state.lock().await;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&lease) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                Ok(())
            }
            _ => Err(CoordinatorError::LeaseNotFound(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
        let removed = self
            .state
            .lock()
            .await
            .drop_lease(lease)
            .ok_or(CoordinatorError::LeaseNotFound(lease))?;
        for key in removed {
            self.emit(WatchEvent::Delete { key });
        }
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordinatorError> {
        {
            let mut state = self.state.lock().await;
            if let Some(id) = lease {
                let entry = state
                    .leases
                    .get_mut(&id)
                    .ok_or(CoordinatorError::LeaseNotFound(id))?;
                entry.keys.insert(key.to_string());
            }
            state.kv.insert(key.to_string(), (value.clone(), lease));
        }
        self.emit(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordinatorError> {
        let state = self.state.lock().await;
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordinatorError> {
        let receiver = self.events.subscribe();
        let prefix = prefix.to_string();

        let events = stream::unfold(receiver, move |mut receiver| {
            let prefix = prefix.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            let relevant = match event_key(&event) {
                                Some(key) => key.starts_with(&prefix),
                                None => true,
                            };
                            if relevant {
                                return Some((event, receiver));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Watch lagged behind coordinator events");
                            return Some((WatchEvent::Resync, receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(events))
    }
}
