use crate::digest::{copy_counted, copy_hashed, HashingCounter};
use crate::keys::{
    check_part_number, new_handle, ordered_part_numbers, sharded_blob_key, staging_dir,
    validate_content_id, validate_handle, META_FILE, STAGING_PREFIX,
};
use crate::traits::{
    ByteReader, ByteStream, MultipartMeta, StagedUpload, Storage, StorageError, StorageResult,
    StoredObject,
};
use crate::StorageBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chunkdrive_core::models::PartInfo;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Local filesystem storage implementation
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for blobs and staging (e.g., "/var/lib/chunkdrive")
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(base_path.join(STAGING_PREFIX))
            .await
            .map_err(|e| {
                StorageError::ConfigError(format!(
                    "Failed to create storage directory {}: {}",
                    base_path.display(),
                    e
                ))
            })?;

        Ok(LocalStorage { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_content_id(key)?;
        Ok(self.base_path.join(sharded_blob_key(key)))
    }

    fn staging_path(&self, handle: &str) -> StorageResult<PathBuf> {
        validate_handle(handle)?;
        Ok(self.base_path.join(staging_dir(handle)))
    }

    /// Ensure parent directory exists
    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Temporary sibling of `path`, invisible to part listings.
    fn temp_sibling(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.tmp-{}", name, Uuid::new_v4()))
    }

    /// Write the reader to a temp file and rename it over `path`.
    async fn write_atomically(
        &self,
        path: &Path,
        reader: &mut ByteReader,
    ) -> StorageResult<(u64, String)> {
        let temp = Self::temp_sibling(path);

        let result = async {
            let mut file = fs::File::create(&temp).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to create file {}: {}",
                    temp.display(),
                    e
                ))
            })?;

            let written = copy_hashed(reader, &mut file).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to write stream to file {}: {}",
                    temp.display(),
                    e
                ))
            })?;

            file.sync_all().await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to sync file {}: {}", temp.display(), e))
            })?;

            fs::rename(&temp, path).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to move {} into place: {}",
                    path.display(),
                    e
                ))
            })?;

            Ok::<(u64, String), StorageError>(written)
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        result
    }

    async fn read_meta(&self, dir: &Path) -> StorageResult<Option<MultipartMeta>> {
        match fs::read(dir.join(META_FILE)).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                StorageError::BackendError(format!(
                    "Corrupt multipart metadata in {}: {}",
                    dir.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn staged_created_at(&self, dir: &Path) -> DateTime<Utc> {
        if let Ok(Some(meta)) = self.read_meta(dir).await {
            return meta.created_at;
        }
        match fs::metadata(dir).await.and_then(|m| m.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified),
            Err(_) => Utc::now(),
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(&self, key: &str, mut reader: ByteReader) -> StorageResult<StoredObject> {
        let path = self.blob_path(key)?;
        let start = std::time::Instant::now();

        self.ensure_parent_dir(&path).await?;
        let (size, sha256) = self.write_atomically(&path, &mut reader).await?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(StoredObject {
            key: key.to_string(),
            size,
            sha256,
        })
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.blob_path(key)?;
        let start = std::time::Instant::now();

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let file = fs::File::open(&path).await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to open file {}: {}", path.display(), e))
        })?;

        let key = key.to_string();
        let path_display = path.display().to_string();
        let stream = tokio_util::io::ReaderStream::new(file).map(move |result| {
            result.map_err(|e| {
                tracing::error!(
                    path = %path_display,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Local storage stream download error"
                );
                StorageError::DownloadFailed(format!("Failed to read chunk: {}", e))
            })
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.blob_path(key)?;
        let start = std::time::Instant::now();

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        tracing::info!(
            path = %path.display(),
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.blob_path(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn init_multipart(&self, content_id: &str, display_name: &str) -> StorageResult<String> {
        validate_content_id(content_id)?;
        let handle = new_handle();
        let dir = self.staging_path(&handle)?;

        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to create staging directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let meta = MultipartMeta {
            content_id: content_id.to_string(),
            display_name: display_name.to_string(),
            created_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&meta)
            .map_err(|e| StorageError::BackendError(format!("Failed to encode metadata: {}", e)))?;
        fs::write(dir.join(META_FILE), raw).await?;

        tracing::info!(
            handle = %handle,
            content_id = %content_id,
            "Local multipart upload initialized"
        );

        Ok(handle)
    }

    async fn upload_part(
        &self,
        handle: &str,
        part_number: u32,
        mut reader: ByteReader,
    ) -> StorageResult<String> {
        check_part_number(part_number)?;
        let dir = self.staging_path(handle)?;
        let start = std::time::Instant::now();

        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(StorageError::NotFound(format!("multipart upload {}", handle)));
        }

        let path = dir.join(part_number.to_string());
        let (size, etag) = self.write_atomically(&path, &mut reader).await?;

        tracing::debug!(
            handle = %handle,
            part_number = part_number,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local part upload successful"
        );

        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        handle: &str,
        parts: &[PartInfo],
        expected_sha256: Option<&str>,
    ) -> StorageResult<StoredObject> {
        let dir = self.staging_path(handle)?;
        let start = std::time::Instant::now();

        let meta = self
            .read_meta(&dir)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("multipart upload {}", handle)))?;

        let numbers = ordered_part_numbers(parts)?;
        for n in &numbers {
            if !fs::try_exists(dir.join(n.to_string())).await.unwrap_or(false) {
                return Err(StorageError::MissingPart(*n));
            }
        }

        let dest = self.blob_path(&meta.content_id)?;
        self.ensure_parent_dir(&dest).await?;

        let temp = dir.join(format!("merge-{}.tmp", Uuid::new_v4()));
        let mut out = fs::File::create(&temp).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", temp.display(), e))
        })?;

        let mut counter = HashingCounter::default();
        for n in &numbers {
            let part_path = dir.join(n.to_string());
            let mut part = match fs::File::open(&part_path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let _ = fs::remove_file(&temp).await;
                    return Err(StorageError::MissingPart(*n));
                }
                Err(e) => {
                    let _ = fs::remove_file(&temp).await;
                    return Err(e.into());
                }
            };
            if let Err(e) = copy_counted(&mut part, &mut out, &mut counter).await {
                let _ = fs::remove_file(&temp).await;
                return Err(StorageError::UploadFailed(format!(
                    "Failed to merge part {} of {}: {}",
                    n, handle, e
                )));
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        let (size, sha256) = counter.finish();

        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                let _ = fs::remove_file(&temp).await;
                tracing::warn!(
                    handle = %handle,
                    content_id = %meta.content_id,
                    expected = %expected,
                    actual = %sha256,
                    "Merged content does not match declared hash"
                );
                return Err(StorageError::Corrupt {
                    expected: expected.to_lowercase(),
                    actual: sha256,
                });
            }
        }

        fs::rename(&temp, &dest).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to move merged file to {}: {}",
                dest.display(),
                e
            ))
        })?;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    error = %e,
                    handle = %handle,
                    "Failed to remove staging directory after merge"
                );
            }
        }

        tracing::info!(
            handle = %handle,
            key = %meta.content_id,
            parts = numbers.len(),
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local multipart upload completed"
        );

        Ok(StoredObject {
            key: meta.content_id,
            size,
            sha256,
        })
    }

    async fn list_uploaded_parts(&self, handle: &str) -> StorageResult<BTreeSet<u32>> {
        let dir = self.staging_path(handle)?;
        let mut parts = BTreeSet::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(parts),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                if n > 0 {
                    parts.insert(n);
                }
            }
        }

        Ok(parts)
    }

    async fn abort_multipart(&self, handle: &str) -> StorageResult<()> {
        let dir = self.staging_path(handle)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(handle = %handle, "Local multipart staging removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed(format!(
                "Failed to remove staging directory {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    async fn list_multipart_uploads(&self) -> StorageResult<Vec<StagedUpload>> {
        let root = self.base_path.join(STAGING_PREFIX);
        let mut uploads = Vec::new();

        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(uploads),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_handle(&name).is_err() {
                continue;
            }
            let created_at = self.staged_created_at(&entry.path()).await;
            uploads.push(StagedUpload {
                handle: name,
                created_at,
            });
        }

        Ok(uploads)
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;
    use tempfile::tempdir;

    fn reader(data: &[u8]) -> ByteReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    fn part(n: u32) -> PartInfo {
        PartInfo {
            part_number: n,
            etag: String::new(),
        }
    }

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_local_storage_upload_download() {
        let (_dir, storage) = storage().await;
        let data = b"test data".to_vec();

        let stored = storage.upload("abc123", reader(&data)).await.unwrap();
        assert_eq!(stored.key, "abc123");
        assert_eq!(stored.size, data.len() as u64);
        assert_eq!(stored.sha256, sha256_hex(&data));

        let downloaded = storage.download_bytes("abc123").await.unwrap();
        assert_eq!(data, downloaded);
    }

    #[tokio::test]
    async fn test_local_storage_upload_overwrites() {
        let (_dir, storage) = storage().await;
        storage.upload("k1", reader(b"first")).await.unwrap();
        storage.upload("k1", reader(b"second")).await.unwrap();
        assert_eq!(storage.download_bytes("k1").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_blobs_are_sharded() {
        let (dir, storage) = storage().await;
        storage.upload("abc123", reader(b"x")).await.unwrap();
        assert!(dir.path().join("blobs/ab/abc123").exists());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, storage) = storage().await;

        let result = storage.download("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.delete("../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.list_uploaded_parts("../../blobs").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_local_storage_download_missing() {
        let (_dir, storage) = storage().await;
        let result = storage.download("missing").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_storage_delete_nonexistent() {
        let (_dir, storage) = storage().await;
        assert!(storage.delete("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn test_local_storage_exists() {
        let (_dir, storage) = storage().await;
        storage.upload("present", reader(b"test")).await.unwrap();

        assert!(storage.exists("present").await.unwrap());
        assert!(!storage.exists("absent").await.unwrap());
        storage.delete("present").await.unwrap();
        assert!(!storage.exists("present").await.unwrap());
    }

    #[tokio::test]
    async fn test_multipart_out_of_order_matches_in_order() {
        let (_dir, storage) = storage().await;
        let chunks: [&[u8]; 3] = [b"alpha-", b"beta-", b"gamma"];

        let in_order = storage.init_multipart("ordered", "a.txt").await.unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            storage
                .upload_part(&in_order, i as u32 + 1, reader(chunk))
                .await
                .unwrap();
        }
        storage
            .complete_multipart(&in_order, &[part(1), part(2), part(3)], None)
            .await
            .unwrap();

        let shuffled = storage.init_multipart("shuffled", "b.txt").await.unwrap();
        for n in [3u32, 1, 2] {
            storage
                .upload_part(&shuffled, n, reader(chunks[(n - 1) as usize]))
                .await
                .unwrap();
        }
        storage
            .complete_multipart(&shuffled, &[part(2), part(3), part(1)], None)
            .await
            .unwrap();

        let a = storage.download_bytes("ordered").await.unwrap();
        let b = storage.download_bytes("shuffled").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, b"alpha-beta-gamma");
    }

    #[tokio::test]
    async fn test_part_reupload_is_idempotent() {
        let (dir, storage) = storage().await;
        let handle = storage.init_multipart("idem", "x.bin").await.unwrap();

        let first = storage.upload_part(&handle, 1, reader(b"same")).await.unwrap();
        let before = storage.list_uploaded_parts(&handle).await.unwrap();
        let second = storage.upload_part(&handle, 1, reader(b"same")).await.unwrap();
        let after = storage.list_uploaded_parts(&handle).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(before, after);
        assert_eq!(after.into_iter().collect::<Vec<_>>(), vec![1]);

        let stored = storage
            .complete_multipart(&handle, &[part(1)], None)
            .await
            .unwrap();
        assert_eq!(stored.size, 4);
        assert!(!dir.path().join("multipart").join(&handle).exists());
    }

    #[tokio::test]
    async fn test_missing_part_fails_completion() {
        let (_dir, storage) = storage().await;
        let handle = storage.init_multipart("gappy", "x.bin").await.unwrap();
        storage.upload_part(&handle, 1, reader(b"a")).await.unwrap();

        let result = storage
            .complete_multipart(&handle, &[part(1), part(2)], None)
            .await;
        assert!(matches!(result, Err(StorageError::MissingPart(2))));
        assert!(!storage.exists("gappy").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_mismatch_keeps_staging_and_writes_nothing() {
        let (_dir, storage) = storage().await;
        let wrong = sha256_hex(b"something else");
        let handle = storage.init_multipart(&wrong, "x.bin").await.unwrap();
        storage.upload_part(&handle, 1, reader(b"actual")).await.unwrap();

        let result = storage
            .complete_multipart(&handle, &[part(1)], Some(&wrong))
            .await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
        assert!(!storage.exists(&wrong).await.unwrap());
        assert_eq!(
            storage.list_uploaded_parts(&handle).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_hash_match_completes() {
        let (_dir, storage) = storage().await;
        let digest = sha256_hex(b"hello world");
        let handle = storage.init_multipart(&digest, "hw.txt").await.unwrap();
        storage.upload_part(&handle, 2, reader(b"world")).await.unwrap();
        storage.upload_part(&handle, 1, reader(b"hello ")).await.unwrap();

        let stored = storage
            .complete_multipart(&handle, &[part(1), part(2)], Some(&digest.to_uppercase()))
            .await
            .unwrap();
        assert_eq!(stored.key, digest);
        assert_eq!(stored.sha256, digest);
    }

    #[tokio::test]
    async fn test_unknown_handle_lists_no_parts() {
        let (_dir, storage) = storage().await;
        let parts = storage
            .list_uploaded_parts(&Uuid::new_v4().to_string())
            .await
            .unwrap();
        assert!(parts.is_empty());
    }

    #[tokio::test]
    async fn test_part_upload_to_unknown_handle_fails() {
        let (_dir, storage) = storage().await;
        let result = storage
            .upload_part(&Uuid::new_v4().to_string(), 1, reader(b"x"))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_abort_and_listing() {
        let (_dir, storage) = storage().await;
        let h1 = storage.init_multipart("one", "1").await.unwrap();
        let h2 = storage.init_multipart("two", "2").await.unwrap();

        let mut listed: Vec<String> = storage
            .list_multipart_uploads()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.handle)
            .collect();
        listed.sort();
        let mut expected = vec![h1.clone(), h2.clone()];
        expected.sort();
        assert_eq!(listed, expected);

        storage.abort_multipart(&h1).await.unwrap();
        storage.abort_multipart(&h1).await.unwrap();

        let listed = storage.list_multipart_uploads().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].handle, h2);
    }

    #[tokio::test]
    async fn test_local_storage_stream_download() {
        let (_dir, storage) = storage().await;
        let data = vec![42u8; 300_000];
        storage.upload("big", reader(&data)).await.unwrap();

        let mut stream = storage.download("big").await.unwrap();
        let mut collected = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
            chunks += 1;
        }
        assert!(chunks > 1);
        assert_eq!(collected, data);
    }
}
