mod memory;
mod postgres;

pub use memory::InMemoryMetadataStore;
pub use postgres::PgMetadataStore;

use async_trait::async_trait;
use chunkdrive_core::{AppError, BlobMeta, FileRecord, OwnerId, QuotaUsage};

/// Data operations on blobs, file references and quota.
///
/// Implementations hold no business rules beyond the quota check in
/// [`MetadataStore::commit_file`].
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn find_blob(&self, hash: &str) -> Result<Option<BlobMeta>, AppError>;

    /// Insert a blob row. Returns false when the hash was already known.
    async fn insert_blob_if_absent(&self, hash: &str, size: u64) -> Result<bool, AppError>;

    async fn quota(&self, owner_id: OwnerId) -> Result<QuotaUsage, AppError>;

    /// Whether the owner holds at least one file referencing the blob.
    async fn owner_has_blob(&self, owner_id: OwnerId, hash: &str) -> Result<bool, AppError>;

    async fn list_files(&self, owner_id: OwnerId) -> Result<Vec<FileRecord>, AppError>;

    /// Atomically: check `used + size <= limit`, insert the blob row if absent,
    /// insert the file reference and charge `size` to the owner.
    async fn commit_file(
        &self,
        owner_id: OwnerId,
        hash: &str,
        size: u64,
        name: &str,
    ) -> Result<FileRecord, AppError>;

    /// Cheap liveness query for readiness probes.
    async fn ping(&self) -> Result<(), AppError>;
}
