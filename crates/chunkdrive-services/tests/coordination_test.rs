//! etcd and Redis integration tests using testcontainers.
//!
//! They require Docker to be running. Set SKIP_CONTAINER_TESTS=1 to skip.

use chunkdrive_core::ServiceInfo;
use chunkdrive_services::{
    Coordinator, CoordinatorError, EphemeralStore, EtcdCoordinator, RedisEphemeralStore,
    ServiceDiscovery, ServiceRegistry,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::{runners::AsyncRunner, ContainerAsync, GenericImage, ImageExt};

const ETCD_IMAGE: &str = "quay.io/coreos/etcd";
const ETCD_TAG: &str = "v3.5.17";
const REDIS_IMAGE: &str = "redis";
const REDIS_TAG: &str = "7-alpine";

fn should_skip() -> bool {
    std::env::var("SKIP_CONTAINER_TESTS").is_ok()
}

async fn start_etcd() -> Option<(ContainerAsync<GenericImage>, String)> {
    if should_skip() {
        return None;
    }
    let container = match GenericImage::new(ETCD_IMAGE, ETCD_TAG)
        .with_exposed_port(2379.tcp())
        .with_wait_for(WaitFor::message_on_stderr("ready to serve client requests"))
        .with_cmd([
            "etcd",
            "--listen-client-urls",
            "http://0.0.0.0:2379",
            "--advertise-client-urls",
            "http://0.0.0.0:2379",
        ])
        .start()
        .await
    {
        Ok(container) => container,
        Err(e) => {
            eprintln!("Skipping etcd test (Docker unavailable): {e}");
            return None;
        }
    };
    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(2379.tcp())
        .await
        .expect("Failed to get port");
    Some((container, format!("http://{host}:{port}")))
}

async fn start_redis() -> Option<(ContainerAsync<GenericImage>, String)> {
    if should_skip() {
        return None;
    }
    let container = match GenericImage::new(REDIS_IMAGE, REDIS_TAG)
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
    {
        Ok(container) => container,
        Err(e) => {
            eprintln!("Skipping Redis test (Docker unavailable): {e}");
            return None;
        }
    };
    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(6379.tcp())
        .await
        .expect("Failed to get port");
    Some((container, format!("redis://{host}:{port}")))
}

fn node(id: &str) -> ServiceInfo {
    let mut info = ServiceInfo::new("chunkdrive-node", "10.0.0.7", 4000);
    info.id = id.to_string();
    info
}

#[tokio::test]
async fn test_etcd_registration_visible_to_another_client() {
    let Some((_container, endpoint)) = start_etcd().await else {
        return;
    };
    let endpoints = vec![endpoint];
    let timeout = Duration::from_secs(5);

    // Two clients stand in for a storage node and a control plane
    let node_side: Arc<dyn Coordinator> =
        Arc::new(EtcdCoordinator::connect(&endpoints, timeout).await.unwrap());
    let control_side: Arc<dyn Coordinator> =
        Arc::new(EtcdCoordinator::connect(&endpoints, timeout).await.unwrap());

    let discovery = ServiceDiscovery::new(control_side.clone(), timeout);
    let mut updates = discovery.watch("chunkdrive-node").await.unwrap();
    assert!(updates.next().await.unwrap().is_empty());

    let registry = ServiceRegistry::new(node_side.clone(), timeout);
    registry
        .register(node("node-a"), Duration::from_secs(10))
        .await
        .unwrap();

    let listed = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "node-a");
    assert_eq!(discovery.list("chunkdrive-node").await.unwrap().len(), 1);

    let lease = registry.current_lease().await.unwrap();
    registry.deregister().await.unwrap();
    let listed = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .unwrap()
        .unwrap();
    assert!(listed.is_empty());

    assert!(matches!(
        node_side.keep_alive(lease).await,
        Err(CoordinatorError::LeaseNotFound(_))
    ));
}

#[tokio::test]
async fn test_etcd_lease_keys_expire() {
    let Some((_container, endpoint)) = start_etcd().await else {
        return;
    };
    let coordinator = EtcdCoordinator::connect(&[endpoint], Duration::from_secs(5))
        .await
        .unwrap();

    let lease = coordinator.grant(Duration::from_secs(1)).await.unwrap();
    coordinator
        .put("/services/test/short", "{}".into(), Some(lease))
        .await
        .unwrap();
    coordinator.keep_alive(lease).await.unwrap();
    assert_eq!(coordinator.get_prefix("/services/test/").await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(coordinator.get_prefix("/services/test/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redis_store_semantics() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let store = RedisEphemeralStore::connect(&url).await.unwrap();
    let ttl = Duration::from_secs(60);

    assert!(store.set_if_absent("upload:1", "first".into(), ttl).await.unwrap());
    assert!(!store.set_if_absent("upload:1", "second".into(), ttl).await.unwrap());
    assert_eq!(store.get("upload:1").await.unwrap().as_deref(), Some("first"));

    store.set("upload:2", "x".into(), ttl).await.unwrap();
    store.set("other:1", "y".into(), ttl).await.unwrap();
    assert_eq!(
        store.keys("upload:").await.unwrap(),
        vec!["upload:1".to_string(), "upload:2".to_string()]
    );

    assert!(store.delete("upload:2").await.unwrap());
    assert!(!store.delete("upload:2").await.unwrap());
    assert_eq!(store.get("upload:2").await.unwrap(), None);
}

#[tokio::test]
async fn test_redis_expiry_is_published() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let store = RedisEphemeralStore::connect(&url).await.unwrap();
    let mut expired = store.subscribe_expired();
    let listener = store.start_expiry_listener();
    tokio::time::sleep(Duration::from_millis(300)).await;

    store
        .set("upload:gone", "x".into(), Duration::from_millis(100))
        .await
        .unwrap();

    let key = tokio::time::timeout(Duration::from_secs(5), expired.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "upload:gone");
    listener.abort();
}
