use async_trait::async_trait;
use chunkdrive_api_client::ChunkServiceClient;
use chunkdrive_core::constants::{LOCAL_NODE_ID, STATIC_NODE_ID};
use chunkdrive_core::{AppError, AppResult, ServiceInfo, TokenSigner};
use chunkdrive_storage::Storage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use futures::StreamExt;

use super::registry::ServiceDiscovery;

const WATCH_RETRY_INITIAL: Duration = Duration::from_millis(500);
const WATCH_RETRY_MAX: Duration = Duration::from_secs(30);

/// A storage node and the backend that reaches it.
#[derive(Clone)]
pub struct SelectedNode {
    pub node_id: String,
    /// Base URL clients use for direct uploads and downloads.
    pub url: String,
    pub storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for SelectedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedNode")
            .field("node_id", &self.node_id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Picks the storage node for new uploads and resolves nodes holding existing data.
#[async_trait]
pub trait StorageSelector: Send + Sync {
    async fn select(&self) -> AppResult<SelectedNode>;

    async fn get(&self, node_id: &str) -> AppResult<SelectedNode>;

    /// Every node currently known, for sweeps.
    async fn nodes(&self) -> Vec<SelectedNode>;
}

/// One in-process backend.
pub struct StaticSelector {
    node: SelectedNode,
}

impl StaticSelector {
    pub fn new(storage: Arc<dyn Storage>, url: impl Into<String>) -> Self {
        Self {
            node: SelectedNode {
                node_id: LOCAL_NODE_ID.to_string(),
                url: url.into(),
                storage,
            },
        }
    }
}

#[async_trait]
impl StorageSelector for StaticSelector {
    async fn select(&self) -> AppResult<SelectedNode> {
        Ok(self.node.clone())
    }

    async fn get(&self, node_id: &str) -> AppResult<SelectedNode> {
        if node_id == self.node.node_id {
            Ok(self.node.clone())
        } else {
            Err(AppError::Unavailable(format!(
                "Storage node '{}' is not known",
                node_id
            )))
        }
    }

    async fn nodes(&self) -> Vec<SelectedNode> {
        vec![self.node.clone()]
    }
}

/// Settings shared by every node client the pool creates.
#[derive(Clone, Debug)]
pub struct NodeClientSettings {
    pub signer: TokenSigner,
    pub token_ttl_secs: i64,
    pub timeout: Duration,
}

impl NodeClientSettings {
    fn client(&self, node_id: &str, url: &str) -> anyhow::Result<ChunkServiceClient> {
        ChunkServiceClient::new(
            node_id,
            url,
            self.signer.clone(),
            self.token_ttl_secs,
            self.timeout,
        )
    }
}

#[derive(Default)]
struct PoolState {
    /// Live instances in the order of the latest snapshot.
    order: Vec<String>,
    nodes: HashMap<String, SelectedNode>,
}

/// Remote storage nodes found through discovery, plus an optional static fallback.
///
/// Holds one client per live instance id; clients for instances that left the
/// registry are dropped on the next refresh.
pub struct ChunkNodePool {
    discovery: Option<ServiceDiscovery>,
    service_name: String,
    settings: NodeClientSettings,
    fallback: Option<SelectedNode>,
    state: RwLock<PoolState>,
    cursor: AtomicUsize,
    watch_retry: (Duration, Duration),
}

impl ChunkNodePool {
    pub fn new(
        discovery: Option<ServiceDiscovery>,
        service_name: impl Into<String>,
        settings: NodeClientSettings,
        fallback_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        let fallback = match fallback_url {
            Some(url) => Some(SelectedNode {
                node_id: STATIC_NODE_ID.to_string(),
                url: url.trim_end_matches('/').to_string(),
                storage: Arc::new(settings.client(STATIC_NODE_ID, url)?),
            }),
            None => None,
        };

        Ok(Self {
            discovery,
            service_name: service_name.into(),
            settings,
            fallback,
            state: RwLock::new(PoolState::default()),
            cursor: AtomicUsize::new(0),
            watch_retry: (WATCH_RETRY_INITIAL, WATCH_RETRY_MAX),
        })
    }

    /// Delay bounds between watch re-subscriptions.
    pub fn with_watch_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.watch_retry = (initial, max.max(initial));
        self
    }

    /// Replace the instance list, reusing clients for ids still present.
    pub async fn update(&self, instances: Vec<ServiceInfo>) {
        let mut state = self.state.write().await;
        let mut nodes = HashMap::with_capacity(instances.len());
        let mut order = Vec::with_capacity(instances.len());

        for info in instances {
            let url = info.url();
            let node = match state.nodes.remove(&info.id) {
                Some(existing) if existing.url == url => existing,
                _ => match self.settings.client(&info.id, &url) {
                    Ok(client) => SelectedNode {
                        node_id: info.id.clone(),
                        url,
                        storage: Arc::new(client),
                    },
                    Err(e) => {
                        tracing::error!(error = %e, instance_id = %info.id, "Failed to create node client");
                        continue;
                    }
                },
            };
            order.push(info.id.clone());
            nodes.insert(info.id, node);
        }

        let dropped = state.nodes.len();
        state.nodes = nodes;
        state.order = order;
        tracing::debug!(
            live = state.order.len(),
            dropped,
            "Storage node pool refreshed"
        );
    }

    /// Pull a fresh instance list. On failure the previous list is kept.
    pub async fn refresh(&self) -> AppResult<()> {
        let Some(discovery) = &self.discovery else {
            return Ok(());
        };
        let instances = discovery.list(&self.service_name).await?;
        self.update(instances).await;
        Ok(())
    }

    /// Follow registry changes for the life of the process.
    ///
    /// A lost watch is re-established with exponential backoff; the instance
    /// list is re-read before each attempt so changes missed in between land.
    pub fn start_watch(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(discovery) = self.discovery.clone() else {
                return;
            };
            let (initial, max) = self.watch_retry;
            let mut delay = initial;

            loop {
                match discovery.watch(&self.service_name).await {
                    Ok(mut updates) => {
                        let mut received = 0usize;
                        while let Some(instances) = updates.next().await {
                            received += 1;
                            self.update(instances).await;
                        }
                        // More than the opening snapshot means the watch was healthy.
                        if received > 1 {
                            delay = initial;
                        }
                        tracing::warn!(
                            service = %self.service_name,
                            retry_in_ms = delay.as_millis() as u64,
                            "Storage node watch ended, re-subscribing"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            service = %self.service_name,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failed to watch storage nodes"
                        );
                    }
                }

                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max);

                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, service = %self.service_name, "Storage node refresh failed");
                }
            }
        })
    }

    pub async fn live_node_ids(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }
}

#[async_trait]
impl StorageSelector for ChunkNodePool {
    async fn select(&self) -> AppResult<SelectedNode> {
        {
            let state = self.state.read().await;
            if !state.order.is_empty() {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % state.order.len();
                if let Some(node) = state.nodes.get(&state.order[index]) {
                    return Ok(node.clone());
                }
            }
        }

        match &self.fallback {
            Some(node) => {
                tracing::debug!(url = %node.url, "No discovered storage nodes, using static fallback");
                Ok(node.clone())
            }
            None => Err(AppError::Unavailable(
                "No storage node available".to_string(),
            )),
        }
    }

    async fn get(&self, node_id: &str) -> AppResult<SelectedNode> {
        if let Some(node) = self.state.read().await.nodes.get(node_id) {
            return Ok(node.clone());
        }
        match &self.fallback {
            Some(node) if node.node_id == node_id => Ok(node.clone()),
            _ => Err(AppError::Unavailable(format!(
                "Storage node '{}' is not available",
                node_id
            ))),
        }
    }

    async fn nodes(&self) -> Vec<SelectedNode> {
        let state = self.state.read().await;
        let mut nodes: Vec<SelectedNode> = state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect();
        if let Some(fallback) = &self.fallback {
            nodes.push(fallback.clone());
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{
        Coordinator, CoordinatorError, InMemoryCoordinator, LeaseId, ServiceRegistry, WatchStream,
    };
    use futures::stream;

    fn settings() -> NodeClientSettings {
        NodeClientSettings {
            signer: TokenSigner::new("test-secret-that-is-long-enough-123456"),
            token_ttl_secs: 60,
            timeout: Duration::from_secs(1),
        }
    }

    fn node(id: &str, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::new("chunkdrive-node", "127.0.0.1", port);
        info.id = id.to_string();
        info
    }

    #[tokio::test]
    async fn test_round_robin_and_pruning() {
        let pool = ChunkNodePool::new(None, "chunkdrive-node", settings(), None).unwrap();
        pool.update(vec![node("a", 4001), node("b", 4002)]).await;

        let first = pool.select().await.unwrap().node_id;
        let second = pool.select().await.unwrap().node_id;
        let third = pool.select().await.unwrap().node_id;
        assert_ne!(first, second);
        assert_eq!(first, third);

        pool.update(vec![node("b", 4002)]).await;
        assert_eq!(pool.live_node_ids().await, vec!["b"]);
        assert!(matches!(pool.get("a").await, Err(AppError::Unavailable(_))));
        assert_eq!(pool.get("b").await.unwrap().url, "http://127.0.0.1:4002");
    }

    #[tokio::test]
    async fn test_client_reused_while_instance_lives() {
        let pool = ChunkNodePool::new(None, "chunkdrive-node", settings(), None).unwrap();
        pool.update(vec![node("a", 4001)]).await;
        let before = pool.get("a").await.unwrap().storage;

        pool.update(vec![node("a", 4001), node("b", 4002)]).await;
        let after = pool.get("a").await.unwrap().storage;
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_empty_pool_falls_back_to_static_node() {
        let pool = ChunkNodePool::new(
            None,
            "chunkdrive-node",
            settings(),
            Some("http://fallback:4000/"),
        )
        .unwrap();

        let selected = pool.select().await.unwrap();
        assert_eq!(selected.node_id, STATIC_NODE_ID);
        assert_eq!(selected.url, "http://fallback:4000");
        assert_eq!(pool.get(STATIC_NODE_ID).await.unwrap().node_id, STATIC_NODE_ID);
        assert_eq!(pool.nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_without_fallback_is_unavailable() {
        let pool = ChunkNodePool::new(None, "chunkdrive-node", settings(), None).unwrap();
        assert!(matches!(pool.select().await, Err(AppError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_watch_tracks_registry() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let discovery = ServiceDiscovery::new(coordinator.clone(), Duration::from_secs(1));
        let pool = Arc::new(
            ChunkNodePool::new(Some(discovery), "chunkdrive-node", settings(), None).unwrap(),
        );
        let watcher = pool.clone().start_watch();

        let registry = ServiceRegistry::new(coordinator.clone(), Duration::from_secs(1));
        registry
            .register(node("a", 4001), Duration::from_secs(5))
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..50 {
            if pool.live_node_ids().await == vec!["a".to_string()] {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);

        registry.deregister().await.unwrap();
        let mut gone = false;
        for _ in 0..50 {
            if pool.live_node_ids().await.is_empty() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone);
        watcher.abort();
    }

    /// Delegates to an in-memory coordinator but every watch ends at once.
    struct DroppingWatchCoordinator {
        inner: InMemoryCoordinator,
        watches: AtomicUsize,
    }

    #[async_trait]
    impl Coordinator for DroppingWatchCoordinator {
        async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinatorError> {
            self.inner.grant(ttl).await
        }

        async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
            self.inner.keep_alive(lease).await
        }

        async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
            self.inner.revoke(lease).await
        }

        async fn put(
            &self,
            key: &str,
            value: String,
            lease: Option<LeaseId>,
        ) -> Result<(), CoordinatorError> {
            self.inner.put(key, value, lease).await
        }

        async fn get_prefix(
            &self,
            prefix: &str,
        ) -> Result<Vec<(String, String)>, CoordinatorError> {
            self.inner.get_prefix(prefix).await
        }

        async fn watch_prefix(&self, _prefix: &str) -> Result<WatchStream, CoordinatorError> {
            self.watches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(stream::empty()))
        }
    }

    #[tokio::test]
    async fn test_watch_resubscribes_after_stream_ends() {
        let coordinator = Arc::new(DroppingWatchCoordinator {
            inner: InMemoryCoordinator::new(),
            watches: AtomicUsize::new(0),
        });
        let discovery = ServiceDiscovery::new(coordinator.clone(), Duration::from_secs(1));
        let pool = Arc::new(
            ChunkNodePool::new(Some(discovery), "chunkdrive-node", settings(), None)
                .unwrap()
                .with_watch_retry(Duration::from_millis(10), Duration::from_millis(40)),
        );
        let watcher = pool.clone().start_watch();

        // Registered after the first watch already ended
        tokio::time::sleep(Duration::from_millis(5)).await;
        let registry = ServiceRegistry::new(coordinator.clone(), Duration::from_secs(1));
        registry
            .register(node("late", 4003), Duration::from_secs(5))
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..100 {
            if pool.live_node_ids().await == vec!["late".to_string()] {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);
        assert!(coordinator.watches.load(Ordering::SeqCst) >= 2);
        assert!(!watcher.is_finished());

        watcher.abort();
        registry.deregister().await.unwrap();
    }

    #[tokio::test]
    async fn test_static_selector() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(chunkdrive_storage::LocalStorage::new(dir.path()).await.unwrap());
        let selector = StaticSelector::new(storage, "http://localhost:4000");

        assert_eq!(selector.select().await.unwrap().node_id, LOCAL_NODE_ID);
        assert!(selector.get(LOCAL_NODE_ID).await.is_ok());
        assert!(selector.get("elsewhere").await.is_err());
    }
}
