use chunkdrive_core::constants::SERVICE_KEY_PREFIX;
use chunkdrive_core::{AppError, AppResult, ServiceInfo};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::coordinator::{Coordinator, CoordinatorError, LeaseId};

pub fn service_prefix(name: &str) -> String {
    format!("{}{}/", SERVICE_KEY_PREFIX, name)
}

pub fn service_key(name: &str, instance_id: &str) -> String {
    format!("{}{}", service_prefix(name), instance_id)
}

/// Bound a coordinator call by `limit`.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, CoordinatorError>>,
) -> Result<T, CoordinatorError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| CoordinatorError::Timeout)?
}

struct Registration {
    lease: Arc<Mutex<LeaseId>>,
    renewal: JoinHandle<()>,
}

/// Registers this process in the coordinator and keeps its lease alive.
pub struct ServiceRegistry {
    coordinator: Arc<dyn Coordinator>,
    timeout: Duration,
    registration: Mutex<Option<Registration>>,
}

impl ServiceRegistry {
    pub fn new(coordinator: Arc<dyn Coordinator>, timeout: Duration) -> Self {
        Self {
            coordinator,
            timeout,
            registration: Mutex::new(None),
        }
    }

    async fn put_record(
        coordinator: &dyn Coordinator,
        timeout: Duration,
        info: &ServiceInfo,
        ttl: Duration,
    ) -> Result<LeaseId, AppError> {
        let value = serde_json::to_string(info)?;
        let lease = bounded(timeout, coordinator.grant(ttl)).await?;
        bounded(
            timeout,
            coordinator.put(&service_key(&info.name, &info.id), value, Some(lease)),
        )
        .await?;
        Ok(lease)
    }

    /// Write the record under a fresh lease and start renewing it every `ttl / 3`.
    pub async fn register(&self, info: ServiceInfo, ttl: Duration) -> AppResult<()> {
        let lease = Self::put_record(self.coordinator.as_ref(), self.timeout, &info, ttl).await?;
        tracing::info!(
            service = %info.name,
            instance_id = %info.id,
            address = %info.url(),
            lease,
            "Service registered"
        );

        let lease = Arc::new(Mutex::new(lease));
        let renewal = tokio::spawn(renewal_loop(
            self.coordinator.clone(),
            self.timeout,
            info,
            ttl,
            lease.clone(),
        ));

        if let Some(previous) = self
            .registration
            .lock()
            .await
            .replace(Registration { lease, renewal })
        {
            previous.renewal.abort();
        }
        Ok(())
    }

    /// Stop renewing and revoke the lease, removing the record immediately.
    pub async fn deregister(&self) -> AppResult<()> {
        let Some(registration) = self.registration.lock().await.take() else {
            return Ok(());
        };
        registration.renewal.abort();

        let lease = *registration.lease.lock().await;
        match bounded(self.timeout, self.coordinator.revoke(lease)).await {
            Ok(()) | Err(CoordinatorError::LeaseNotFound(_)) => {
                tracing::info!(lease, "Service deregistered");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn current_lease(&self) -> Option<LeaseId> {
        match self.registration.lock().await.as_ref() {
            Some(registration) => Some(*registration.lease.lock().await),
            None => None,
        }
    }
}

async fn renewal_loop(
    coordinator: Arc<dyn Coordinator>,
    timeout: Duration,
    info: ServiceInfo,
    ttl: Duration,
    lease: Arc<Mutex<LeaseId>>,
) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut lost = false;

    loop {
        ticker.tick().await;

        if !lost {
            let current = *lease.lock().await;
            match bounded(timeout, coordinator.keep_alive(current)).await {
                Ok(()) => continue,
                Err(CoordinatorError::LeaseNotFound(_)) => {
                    tracing::warn!(
                        instance_id = %info.id,
                        lease = current,
                        "Registration lease lost, re-registering"
                    );
                    lost = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, instance_id = %info.id, "Lease renewal failed");
                    continue;
                }
            }
        }

        match ServiceRegistry::put_record(coordinator.as_ref(), timeout, &info, ttl).await {
            Ok(new_lease) => {
                *lease.lock().await = new_lease;
                lost = false;
                tracing::info!(instance_id = %info.id, lease = new_lease, "Service re-registered");
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    instance_id = %info.id,
                    "Re-registration failed, retrying on next tick"
                );
            }
        }
    }
}

/// Read side of the registry.
#[derive(Clone)]
pub struct ServiceDiscovery {
    coordinator: Arc<dyn Coordinator>,
    timeout: Duration,
}

impl ServiceDiscovery {
    pub fn new(coordinator: Arc<dyn Coordinator>, timeout: Duration) -> Self {
        Self {
            coordinator,
            timeout,
        }
    }

    /// Live instances of `name`, ordered by instance id.
    pub async fn list(&self, name: &str) -> AppResult<Vec<ServiceInfo>> {
        let entries = bounded(self.timeout, self.coordinator.get_prefix(&service_prefix(name))).await?;

        let mut instances: Vec<ServiceInfo> = entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_str(&value) {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "Skipping malformed service record");
                    None
                }
            })
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    /// The current instance list, then a fresh list after every change.
    pub async fn watch(&self, name: &str) -> AppResult<BoxStream<'static, Vec<ServiceInfo>>> {
        let events = bounded(self.timeout, self.coordinator.watch_prefix(&service_prefix(name))).await?;
        let initial = self.list(name).await?;

        let discovery = self.clone();
        let name = name.to_string();
        let updates = stream::unfold(events, move |mut events| {
            let discovery = discovery.clone();
            let name = name.clone();
            async move {
                loop {
                    events.next().await?;
                    match discovery.list(&name).await {
                        Ok(instances) => return Some((instances, events)),
                        Err(e) => {
                            tracing::warn!(error = %e, service = %name, "Failed to refresh instances");
                        }
                    }
                }
            }
        });

        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }
}
