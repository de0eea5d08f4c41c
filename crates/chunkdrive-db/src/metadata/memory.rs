use async_trait::async_trait;
use chrono::Utc;
use chunkdrive_core::{AppError, BlobMeta, FileRecord, OwnerId, QuotaUsage};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::MetadataStore;

#[derive(Default)]
struct State {
    blobs: HashMap<String, BlobMeta>,
    files: Vec<FileRecord>,
    quotas: HashMap<OwnerId, QuotaUsage>,
}

/// Process-local metadata store.
pub struct InMemoryMetadataStore {
    default_limit: u64,
    state: Mutex<State>,
}

impl InMemoryMetadataStore {
    pub fn new(default_limit: u64) -> Self {
        Self {
            default_limit,
            state: Mutex::new(State::default()),
        }
    }

    /// Override one owner's quota limit.
    pub async fn set_limit(&self, owner_id: OwnerId, limit_bytes: u64) {
        let mut state = self.state.lock().await;
        let default_limit = self.default_limit;
        state
            .quotas
            .entry(owner_id)
            .or_insert_with(|| QuotaUsage {
                owner_id,
                used_bytes: 0,
                limit_bytes: default_limit,
            })
            .limit_bytes = limit_bytes;
    }

    pub async fn blob_count(&self) -> usize {
        self.state.lock().await.blobs.len()
    }

    fn quota_of(&self, state: &State, owner_id: OwnerId) -> QuotaUsage {
        state.quotas.get(&owner_id).copied().unwrap_or(QuotaUsage {
            owner_id,
            used_bytes: 0,
            limit_bytes: self.default_limit,
        })
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn find_blob(&self, hash: &str) -> Result<Option<BlobMeta>, AppError> {
        Ok(self.state.lock().await.blobs.get(hash).cloned())
    }

    async fn insert_blob_if_absent(&self, hash: &str, size: u64) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        if state.blobs.contains_key(hash) {
            return Ok(false);
        }
        state.blobs.insert(
            hash.to_string(),
            BlobMeta {
                hash: hash.to_string(),
                size,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn quota(&self, owner_id: OwnerId) -> Result<QuotaUsage, AppError> {
        let state = self.state.lock().await;
        Ok(self.quota_of(&state, owner_id))
    }

    async fn owner_has_blob(&self, owner_id: OwnerId, hash: &str) -> Result<bool, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .iter()
            .any(|f| f.owner_id == owner_id && f.hash == hash))
    }

    async fn list_files(&self, owner_id: OwnerId) -> Result<Vec<FileRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .iter()
            .filter(|f| f.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn commit_file(
        &self,
        owner_id: OwnerId,
        hash: &str,
        size: u64,
        name: &str,
    ) -> Result<FileRecord, AppError> {
        let mut state = self.state.lock().await;

        let quota = self.quota_of(&state, owner_id);
        if !quota.allows(size) {
            return Err(AppError::QuotaExceeded {
                used: quota.used_bytes,
                requested: size,
                limit: quota.limit_bytes,
            });
        }

        let now = Utc::now();
        state
            .blobs
            .entry(hash.to_string())
            .or_insert_with(|| BlobMeta {
                hash: hash.to_string(),
                size,
                created_at: now,
            });

        let record = FileRecord {
            id: Uuid::new_v4(),
            owner_id,
            hash: hash.to_string(),
            name: name.to_string(),
            size,
            created_at: now,
        };
        state.files.push(record.clone());
        state.quotas.insert(
            owner_id,
            QuotaUsage {
                used_bytes: quota.used_bytes + size,
                ..quota
            },
        );

        Ok(record)
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_first_inserts_absorbed() {
        let store = Arc::new(InMemoryMetadataStore::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.insert_blob_if_absent("same", 10).await })
            })
            .collect();

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.blob_count().await, 1);
    }

    #[tokio::test]
    async fn test_commit_charges_each_reference() {
        let store = InMemoryMetadataStore::new(1000);
        store.commit_file(1, "h", 300, "a").await.unwrap();
        store.commit_file(2, "h", 300, "b").await.unwrap();
        store.commit_file(1, "h", 300, "a-copy").await.unwrap();

        assert_eq!(store.blob_count().await, 1);
        assert_eq!(store.quota(1).await.unwrap().used_bytes, 600);
        assert_eq!(store.quota(2).await.unwrap().used_bytes, 300);
        assert_eq!(store.list_files(1).await.unwrap().len(), 2);
        assert!(store.owner_has_blob(2, "h").await.unwrap());
        assert!(!store.owner_has_blob(3, "h").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_over_quota_changes_nothing() {
        let store = InMemoryMetadataStore::new(1000);
        store.set_limit(5, 100).await;
        store.commit_file(5, "x", 80, "x").await.unwrap();

        let err = store.commit_file(5, "y", 30, "y").await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded { used: 80, .. }));
        assert!(store.find_blob("y").await.unwrap().is_none());
        assert_eq!(store.quota(5).await.unwrap().used_bytes, 80);
    }
}
