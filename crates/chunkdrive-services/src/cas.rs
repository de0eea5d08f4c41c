//! Content-addressable index: one blob per distinct hash, many file references.
//!
//! Quota is charged per reference at its full size, even when the bytes are shared.

use chunkdrive_core::{AppError, AppResult, BlobMeta, FileRecord, OwnerId, QuotaUsage};
use chunkdrive_db::MetadataStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct ContentIndex {
    metadata: Arc<dyn MetadataStore>,
}

impl ContentIndex {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    pub async fn lookup(&self, hash: &str) -> AppResult<BlobMeta> {
        self.metadata
            .find_blob(hash)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Unknown content hash {}", hash)))
    }

    /// Whether the hash is known. Same as `lookup` without the error.
    pub async fn contains(&self, hash: &str) -> AppResult<Option<BlobMeta>> {
        self.metadata.find_blob(hash).await
    }

    /// Record a durably stored blob. Recording a known hash is a no-op.
    pub async fn record(&self, hash: &str, size: u64) -> AppResult<()> {
        if self.metadata.insert_blob_if_absent(hash, size).await? {
            tracing::info!(hash = %hash, size_bytes = size, "Blob recorded");
        } else {
            tracing::debug!(hash = %hash, "Blob already recorded");
        }
        Ok(())
    }

    /// Create a file reference to the blob, charging the owner's quota.
    pub async fn attach(
        &self,
        owner_id: OwnerId,
        hash: &str,
        size: u64,
        name: &str,
    ) -> AppResult<FileRecord> {
        let record = self.metadata.commit_file(owner_id, hash, size, name).await?;
        tracing::info!(
            owner_id,
            hash = %hash,
            file_id = %record.id,
            size_bytes = size,
            "File reference created"
        );
        Ok(record)
    }

    pub async fn quota(&self, owner_id: OwnerId) -> AppResult<QuotaUsage> {
        self.metadata.quota(owner_id).await
    }

    /// Fail with `QuotaExceeded` unless `size` more bytes fit.
    pub async fn ensure_headroom(&self, owner_id: OwnerId, size: u64) -> AppResult<()> {
        let quota = self.quota(owner_id).await?;
        if quota.allows(size) {
            Ok(())
        } else {
            Err(AppError::QuotaExceeded {
                used: quota.used_bytes,
                requested: size,
                limit: quota.limit_bytes,
            })
        }
    }

    pub async fn owner_has_blob(&self, owner_id: OwnerId, hash: &str) -> AppResult<bool> {
        self.metadata.owner_has_blob(owner_id, hash).await
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.metadata.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdrive_db::InMemoryMetadataStore;

    #[tokio::test]
    async fn test_identical_content_two_owners() {
        let store = Arc::new(InMemoryMetadataStore::new(100_000));
        let index = ContentIndex::new(store.clone());

        index.record("abc123", 30000).await.unwrap();
        index.record("abc123", 30000).await.unwrap();
        index.attach(7, "abc123", 30000, "a.bin").await.unwrap();
        index.attach(8, "abc123", 30000, "b.bin").await.unwrap();

        assert_eq!(store.blob_count().await, 1);
        assert_eq!(index.quota(7).await.unwrap().used_bytes, 30000);
        assert_eq!(index.quota(8).await.unwrap().used_bytes, 30000);
        assert_eq!(index.lookup("abc123").await.unwrap().size, 30000);
    }

    #[tokio::test]
    async fn test_lookup_unknown_is_not_found() {
        let index = ContentIndex::new(Arc::new(InMemoryMetadataStore::new(10)));
        assert!(matches!(index.lookup("nope").await, Err(AppError::NotFound(_))));
        assert!(index.contains("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_headroom() {
        let index = ContentIndex::new(Arc::new(InMemoryMetadataStore::new(100)));
        index.ensure_headroom(1, 100).await.unwrap();
        index.attach(1, "h", 60, "a").await.unwrap();
        assert!(matches!(
            index.ensure_headroom(1, 41).await,
            Err(AppError::QuotaExceeded { used: 60, requested: 41, limit: 100 })
        ));
    }
}
