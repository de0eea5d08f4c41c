//! Storage abstraction trait
//!
//! This module defines the Storage trait that every backend implements: local
//! filesystem, object store, and the remote storage-node client.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use chunkdrive_core::models::PartInfo;
use chunkdrive_core::AppError;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Part {0} has no staged data")]
    MissingPart(u32),

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    Corrupt { expected: String, actual: String },

    #[error("Storage node unavailable: {0}")]
    Unavailable(String),

    /// Domain error reported by a remote storage node.
    #[error("Storage node rejected request: {0}")]
    Remote(AppError),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Streaming object body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Source of bytes for uploads.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// A durably written object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    /// Hex SHA-256 of the stored bytes.
    pub sha256: String,
}

/// A staging area found on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpload {
    pub handle: String,
    pub created_at: DateTime<Utc>,
}

/// Metadata written next to a staging area at init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartMeta {
    pub content_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Storage abstraction trait
///
/// Objects are keyed by content id. Multipart uploads are staged under an opaque
/// handle returned by [`Storage::init_multipart`], which is unrelated to any
/// session identifier the caller keeps.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a whole object under `key`, replacing any existing object.
    async fn upload(&self, key: &str, reader: ByteReader) -> StorageResult<StoredObject>;

    /// Stream an object. Fails with `NotFound` if it is absent.
    async fn download(&self, key: &str) -> StorageResult<ByteStream>;

    /// Delete an object. Deleting an absent object succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Allocate staging space for a multipart upload of `content_id`.
    async fn init_multipart(&self, content_id: &str, display_name: &str) -> StorageResult<String>;

    /// Persist one part and return its etag.
    ///
    /// Re-uploading a part number replaces the earlier data. The etag content is
    /// backend specific and must not be interpreted by callers.
    async fn upload_part(
        &self,
        handle: &str,
        part_number: u32,
        reader: ByteReader,
    ) -> StorageResult<String>;

    /// Concatenate the listed parts in ascending part-number order and store the
    /// result under the content id given at init.
    ///
    /// With `expected_sha256`, a digest mismatch fails with `Corrupt`, nothing is
    /// written under the content id and staging is kept.
    async fn complete_multipart(
        &self,
        handle: &str,
        parts: &[PartInfo],
        expected_sha256: Option<&str>,
    ) -> StorageResult<StoredObject>;

    /// Part numbers staged so far. Unknown handles yield an empty set.
    async fn list_uploaded_parts(&self, handle: &str) -> StorageResult<BTreeSet<u32>>;

    /// Drop staging data. Unknown handles are a no-op.
    async fn abort_multipart(&self, handle: &str) -> StorageResult<()>;

    /// Every staging area currently present, for orphan sweeps.
    async fn list_multipart_uploads(&self) -> StorageResult<Vec<StagedUpload>>;

    /// Get the backend type
    fn backend_type(&self) -> StorageBackend;

    /// Download an object fully into memory.
    async fn download_bytes(&self, key: &str) -> StorageResult<Vec<u8>> {
        let mut stream = self.download(key).await?;
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::NotFound(format!("Object not found: {}", key)),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            StorageError::MissingPart(n) => {
                AppError::NotFound(format!("Part {} has not been uploaded", n))
            }
            StorageError::Corrupt { expected, actual } => AppError::Corrupt { expected, actual },
            StorageError::Unavailable(msg) => AppError::Unavailable(msg),
            StorageError::Remote(inner) => inner,
            other => AppError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdrive_core::ErrorMetadata;

    #[test]
    fn test_storage_error_maps_to_taxonomy() {
        let err: AppError = StorageError::MissingPart(2).into();
        assert_eq!(err.http_status_code(), 404);

        let err: AppError = StorageError::Corrupt {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(matches!(err, AppError::Corrupt { .. }));

        let err: AppError = StorageError::Unavailable("node down".into()).into();
        assert_eq!(err.http_status_code(), 503);

        let err: AppError = StorageError::Remote(AppError::Forbidden("op".into())).into();
        assert_eq!(err.http_status_code(), 403);
    }

    #[test]
    fn test_backend_failures_are_sensitive() {
        let err: AppError =
            StorageError::UploadFailed("/srv/data/multipart/x/1: disk full".into()).into();
        assert!(err.is_sensitive());
        assert!(!err.client_message().contains("/srv"));
    }
}
