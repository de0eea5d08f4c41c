//! Storage backend setup

use anyhow::{Context, Result};
use chunkdrive_core::{Config, StorageBackend};
use chunkdrive_storage::{create_storage, Storage};
use std::sync::Arc;

/// In-process backend for `local` and `s3`. `remote` has none: this process
/// is then a pure control plane talking to storage nodes over HTTP.
pub async fn setup_storage(config: &Config) -> Result<Option<Arc<dyn Storage>>> {
    if config.storage_backend() == StorageBackend::Remote {
        tracing::info!(
            chunk_node_url = ?config.chunk_node_url(),
            discovery_enabled = config.discovery_enabled(),
            "Using remote storage nodes"
        );
        return Ok(None);
    }

    let storage = create_storage(config)
        .await
        .context("Failed to initialize storage backend")?;
    tracing::info!(
        backend = %storage.backend_type(),
        public_url = %config.public_url(),
        "Storage backend initialized"
    );
    Ok(Some(storage))
}
