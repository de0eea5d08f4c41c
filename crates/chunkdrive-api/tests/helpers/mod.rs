//! Test helpers: wire an in-memory application and its router.
//!
//! Run from workspace root: `cargo test -p chunkdrive-api`. Everything runs
//! against local-filesystem storage in a temp dir and the in-memory metadata
//! store, so no external services are needed.

#![allow(dead_code)]

use axum::Router;
use axum_test::TestServer;
use chunkdrive_api::setup::routes::build_router;
use chunkdrive_api::state::AppState;
use chunkdrive_core::constants::OPAQUE_TOKEN_TTL_SECS;
use chunkdrive_core::TokenSigner;
use chunkdrive_db::{InMemoryMetadataStore, MetadataStore};
use chunkdrive_services::{
    ContentIndex, EphemeralStore, InMemoryEphemeralStore, SessionStore, StaticSelector,
    StorageNode, StorageSelector, TokenService, UploadService, UploadSettings,
};
use chunkdrive_storage::{LocalStorage, Storage};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";
pub const NODE_URL: &str = "http://localhost:4000";
pub const BODY_LIMIT: usize = 8 * 1024 * 1024;
pub const OWNER: i64 = 7;
pub const OTHER_OWNER: i64 = 8;

/// Test application: server plus the resources it owns.
pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub storage: Arc<dyn Storage>,
    pub _temp_dir: TempDir,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }
}

/// Wire the full application over a temp dir. `quota_bytes` is the default
/// per-owner limit.
pub async fn build_state(quota_bytes: u64) -> (Arc<AppState>, Arc<dyn Storage>, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let storage: Arc<dyn Storage> = Arc::new(
        LocalStorage::new(temp_dir.path())
            .await
            .expect("Failed to create local storage"),
    );

    let cache: Arc<dyn EphemeralStore> = Arc::new(InMemoryEphemeralStore::new());
    let tokens = TokenService::new(
        TokenSigner::new(TEST_SECRET),
        cache.clone(),
        Duration::from_secs(OPAQUE_TOKEN_TTL_SECS),
    );
    let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new(quota_bytes));
    let selector: Arc<dyn StorageSelector> =
        Arc::new(StaticSelector::new(storage.clone(), NODE_URL));
    let node = StorageNode::new(storage.clone(), tokens.clone(), NODE_URL);

    let uploads = Arc::new(UploadService::new(
        SessionStore::new(cache.clone(), Duration::from_secs(3600)),
        ContentIndex::new(metadata.clone()),
        selector.clone(),
        tokens,
        cache,
        UploadSettings::default(),
    ));

    let state = Arc::new(AppState::new(Some(node), uploads, metadata, selector));
    (state, storage, temp_dir)
}

pub fn router(state: Arc<AppState>) -> Router {
    build_router(state, BODY_LIMIT)
}

pub async fn setup_test_app() -> TestApp {
    setup_test_app_with_quota(1024 * 1024).await
}

pub async fn setup_test_app_with_quota(quota_bytes: u64) -> TestApp {
    let (state, storage, temp_dir) = build_state(quota_bytes).await;
    let server = TestServer::new(router(state.clone()).into_make_service())
        .expect("Failed to create test server");

    TestApp {
        server,
        state,
        storage,
        _temp_dir: temp_dir,
    }
}

/// Path and query of a URL handed out for this node.
pub fn node_path(url: &str) -> &str {
    url.strip_prefix(NODE_URL).expect("URL should point at the test node")
}

/// Deterministic content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
