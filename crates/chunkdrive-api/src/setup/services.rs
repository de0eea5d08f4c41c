//! Service wiring and background tasks

use crate::state::AppState;
use anyhow::{Context, Result};
use chunkdrive_core::constants::OPAQUE_TOKEN_TTL_SECS;
use chunkdrive_core::{Config, ServiceInfo, TokenSigner};
use chunkdrive_db::MetadataStore;
use chunkdrive_services::{
    ChunkNodePool, ContentIndex, Coordinator, EphemeralStore, EtcdCoordinator,
    InMemoryEphemeralStore, NodeClientSettings, RedisEphemeralStore, ServiceDiscovery,
    ServiceRegistry, SessionStore, StaticSelector, StorageNode, StorageSelector, TokenService,
    UploadReaper, UploadService, UploadSettings,
};
use chunkdrive_storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Per-request timeout of control-plane calls to a storage node.
const NODE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Background loops started at boot, stopped on shutdown.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
    registry: Option<Arc<ServiceRegistry>>,
}

impl BackgroundTasks {
    /// Leave the registry first so no new traffic is routed here, then stop the loops.
    pub async fn shutdown(self) {
        if let Some(registry) = &self.registry {
            match registry.deregister().await {
                Ok(()) => tracing::info!("Storage node deregistered"),
                Err(e) => tracing::warn!(error = %e, "Failed to deregister storage node"),
            }
        }
        for handle in &self.handles {
            handle.abort();
        }
        tracing::info!(tasks = self.handles.len(), "Background tasks stopped");
    }
}

fn node_info(config: &Config) -> ServiceInfo {
    let mut info = ServiceInfo::new(
        config.discovery_service_name(),
        config.advertise_address(),
        config.server_port(),
    );
    info.metadata
        .insert("public_url".to_string(), config.public_url());
    info.environment = config.environment().to_string();
    info.endpoints = [
        "/upload",
        "/download",
        "/delete",
        "/exists",
        "/multipart/init",
        "/multipart/upload",
        "/multipart/complete",
        "/multipart/parts",
        "/multipart/abort",
        "/multipart/uploads",
    ]
    .iter()
    .map(|e| e.to_string())
    .collect();
    info
}

/// Connect to the etcd cluster when discovery is enabled.
pub async fn setup_coordinator(config: &Config) -> Result<Option<Arc<dyn Coordinator>>> {
    if !config.discovery_enabled() {
        return Ok(None);
    }
    let coordinator = EtcdCoordinator::connect(
        config.etcd_endpoints(),
        Duration::from_secs(config.discovery_timeout_secs()),
    )
    .await
    .context("Failed to connect to etcd")?;
    let coordinator: Arc<dyn Coordinator> = Arc::new(coordinator);
    Ok(Some(coordinator))
}

/// Redis when `REDIS_URL` is set, otherwise a cache private to this process.
async fn setup_cache(
    config: &Config,
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<Arc<dyn EphemeralStore>> {
    match config.redis_url() {
        Some(url) => {
            let store = RedisEphemeralStore::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            handles.push(store.start_expiry_listener());
            let store: Arc<dyn EphemeralStore> = Arc::new(store);
            Ok(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set, upload sessions are local to this process");
            let store = Arc::new(InMemoryEphemeralStore::new());
            handles.push(
                store
                    .clone()
                    .start_expiry_scanner(Duration::from_millis(config.cache_expiry_scan_ms())),
            );
            let store: Arc<dyn EphemeralStore> = store;
            Ok(store)
        }
    }
}

/// Initialize all services and start their background tasks.
///
/// `coordinator` is the shared registry nodes and control planes meet in;
/// `None` disables discovery.
pub async fn initialize_services(
    config: &Config,
    metadata: Arc<dyn MetadataStore>,
    storage: Option<Arc<dyn Storage>>,
    coordinator: Option<Arc<dyn Coordinator>>,
) -> Result<(Arc<AppState>, BackgroundTasks)> {
    let mut handles = Vec::new();
    let mut registry = None;

    let cache = setup_cache(config, &mut handles).await?;

    let signer = TokenSigner::new(config.token_secret());
    let tokens = TokenService::new(
        signer.clone(),
        cache.clone(),
        Duration::from_secs(OPAQUE_TOKEN_TTL_SECS),
    );

    let discovery_timeout = Duration::from_secs(config.discovery_timeout_secs());

    let (node, selector): (Option<StorageNode>, Arc<dyn StorageSelector>) = match storage {
        Some(storage) => {
            let public_url = config.public_url();
            let node = StorageNode::new(storage.clone(), tokens.clone(), public_url.clone());

            if let Some(coordinator) = &coordinator {
                let node_registry = Arc::new(ServiceRegistry::new(
                    coordinator.clone(),
                    discovery_timeout,
                ));
                node_registry
                    .register(
                        node_info(config),
                        Duration::from_secs(config.discovery_lease_ttl_secs()),
                    )
                    .await
                    .context("Failed to register storage node")?;
                registry = Some(node_registry);
            }

            let selector: Arc<dyn StorageSelector> =
                Arc::new(StaticSelector::new(storage, public_url));
            (Some(node), selector)
        }
        None => {
            let settings = NodeClientSettings {
                signer: signer.clone(),
                token_ttl_secs: config.node_token_ttl_secs(),
                timeout: NODE_REQUEST_TIMEOUT,
            };
            let discovery = coordinator
                .as_ref()
                .map(|c| ServiceDiscovery::new(c.clone(), discovery_timeout));
            let watching = discovery.is_some();

            let pool = Arc::new(
                ChunkNodePool::new(
                    discovery,
                    config.discovery_service_name(),
                    settings,
                    config.chunk_node_url(),
                )
                .context("Failed to create storage node pool")?,
            );
            if watching {
                if let Err(e) = pool.refresh().await {
                    tracing::warn!(error = %e, "Initial node discovery failed, relying on the watch");
                }
                handles.push(pool.clone().start_watch());
            }

            let selector: Arc<dyn StorageSelector> = pool;
            (None, selector)
        }
    };

    let index = ContentIndex::new(metadata.clone());
    let sessions = SessionStore::new(
        cache.clone(),
        Duration::from_secs(config.upload_session_ttl_secs()),
    );

    let reaper = Arc::new(UploadReaper::new(
        sessions.clone(),
        cache.clone(),
        selector.clone(),
        Duration::from_secs(config.staging_sweep_interval_secs()),
        Duration::from_secs(config.staging_grace_secs()),
    ));
    handles.push(reaper.clone().start_listener());
    handles.push(reaper.start_sweep());
    tracing::info!(
        sweep_interval_secs = config.staging_sweep_interval_secs(),
        grace_secs = config.staging_grace_secs(),
        "Upload reaper started"
    );

    let uploads = Arc::new(UploadService::new(
        sessions,
        index,
        selector.clone(),
        tokens,
        cache,
        UploadSettings {
            upload_token_ttl_secs: config.upload_token_ttl_secs(),
            download_token_ttl_secs: config.download_token_ttl_secs(),
        },
    ));

    let state = Arc::new(AppState::new(node, uploads, metadata, selector));
    Ok((state, BackgroundTasks { handles, registry }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdrive_core::AppConfig;
    use chunkdrive_db::InMemoryMetadataStore;
    use chunkdrive_services::InMemoryCoordinator;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let lookup = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        };
        Config(Box::new(AppConfig::from_lookup(lookup).unwrap()))
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_node_info_advertises_public_url() {
        let config = config(&[
            ("TOKEN_SECRET", SECRET),
            ("PUBLIC_URL", "https://node-1.example.com"),
            ("ADVERTISE_ADDRESS", "10.0.0.5"),
        ]);
        let info = node_info(&config);
        assert_eq!(info.name, "chunkdrive-node");
        assert_eq!(info.url(), "https://node-1.example.com");
        assert!(info.endpoints.contains(&"/multipart/init".to_string()));
    }

    #[tokio::test]
    async fn test_remote_control_plane_uses_static_fallback() {
        let config = config(&[
            ("TOKEN_SECRET", SECRET),
            ("STORAGE_BACKEND", "remote"),
            ("CHUNK_NODE_URL", "http://127.0.0.1:9"),
        ]);
        let metadata = Arc::new(InMemoryMetadataStore::new(1024));
        let (state, tasks) = initialize_services(&config, metadata, None, None)
            .await
            .unwrap();

        assert!(state.node.is_none());
        let selected = state.selector.select().await.unwrap();
        assert_eq!(selected.node_id, chunkdrive_core::constants::STATIC_NODE_ID);
        assert_eq!(selected.url, "http://127.0.0.1:9");
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_node_registers_when_discovery_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&[
            ("TOKEN_SECRET", SECRET),
            ("DISCOVERY_ENABLED", "true"),
            ("ETCD_ENDPOINTS", "http://etcd:2379"),
            ("PUBLIC_URL", "http://node.local:4000"),
        ]);
        let storage: Arc<dyn Storage> =
            Arc::new(chunkdrive_storage::LocalStorage::new(dir.path()).await.unwrap());
        let metadata = Arc::new(InMemoryMetadataStore::new(1024));
        let coordinator: Arc<dyn Coordinator> = Arc::new(InMemoryCoordinator::new());

        let (state, tasks) =
            initialize_services(&config, metadata, Some(storage), Some(coordinator))
                .await
                .unwrap();
        assert!(state.node.is_some());
        let registry = tasks.registry.clone().unwrap();
        assert!(registry.current_lease().await.is_some());

        tasks.shutdown().await;
        assert!(registry.current_lease().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_control_plane_discovers_node_through_shared_coordinator() {
        let shared: Arc<dyn Coordinator> = Arc::new(InMemoryCoordinator::new());

        let dir = tempfile::tempdir().unwrap();
        let node_config = config(&[
            ("TOKEN_SECRET", SECRET),
            ("DISCOVERY_ENABLED", "true"),
            ("ETCD_ENDPOINTS", "http://etcd:2379"),
            ("PUBLIC_URL", "http://node-1.local:4000"),
        ]);
        let storage: Arc<dyn Storage> =
            Arc::new(chunkdrive_storage::LocalStorage::new(dir.path()).await.unwrap());
        let (_node_state, node_tasks) = initialize_services(
            &node_config,
            Arc::new(InMemoryMetadataStore::new(1024)),
            Some(storage),
            Some(shared.clone()),
        )
        .await
        .unwrap();

        let control_config = config(&[
            ("TOKEN_SECRET", SECRET),
            ("STORAGE_BACKEND", "remote"),
            ("DISCOVERY_ENABLED", "true"),
            ("ETCD_ENDPOINTS", "http://etcd:2379"),
        ]);
        let (control_state, control_tasks) = initialize_services(
            &control_config,
            Arc::new(InMemoryMetadataStore::new(1024)),
            None,
            Some(shared),
        )
        .await
        .unwrap();

        let selected = control_state.selector.select().await.unwrap();
        assert_eq!(selected.url, "http://node-1.local:4000");
        assert_ne!(selected.node_id, chunkdrive_core::constants::STATIC_NODE_ID);

        // Leaving the registry takes the node out of rotation
        node_tasks.shutdown().await;
        let mut gone = false;
        for _ in 0..100 {
            if control_state.selector.select().await.is_err() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone);
        control_tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_coordinator_absent_without_discovery() {
        let config = config(&[("TOKEN_SECRET", SECRET)]);
        assert!(setup_coordinator(&config).await.unwrap().is_none());
    }
}
