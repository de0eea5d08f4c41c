use crate::digest::{HashingCounter, CHUNK_SIZE};
use crate::keys::{
    check_part_number, flat_blob_key, new_handle, ordered_part_numbers, staging_dir,
    validate_content_id, validate_handle, META_FILE, STAGING_PREFIX,
};
use crate::traits::{
    ByteReader, ByteStream, MultipartMeta, StagedUpload, Storage, StorageError, StorageResult,
    StoredObject,
};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use chunkdrive_core::models::PartInfo;
use futures::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{
    ObjectMeta, ObjectStore, ObjectStoreExt, PutPayload, Result as ObjectResult, WriteMultipart,
};
use std::collections::{BTreeSet, HashMap};
use tokio::io::AsyncReadExt;

/// Upload parts in flight per object before writes wait.
const MAX_INFLIGHT_PARTS: usize = 8;

/// S3 storage implementation
///
/// Generic over the object store so other `object_store` backends (and the
/// in-memory store in tests) can stand in for S3.
#[derive(Clone)]
pub struct S3Storage<S = AmazonS3> {
    store: S,
    bucket: String,
}

impl S3Storage<AmazonS3> {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint URL for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket.clone());

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage { store, bucket })
    }
}

impl<S: ObjectStore> S3Storage<S> {
    pub fn with_store(store: S, bucket: impl Into<String>) -> Self {
        S3Storage {
            store,
            bucket: bucket.into(),
        }
    }

    fn meta_path(handle: &str) -> Path {
        Path::from(format!("{}/{}", staging_dir(handle), META_FILE))
    }

    fn part_path(handle: &str, part_number: u32) -> Path {
        Path::from(format!("{}/{}", staging_dir(handle), part_number))
    }

    async fn list_prefix(&self, prefix: &Path) -> StorageResult<Vec<ObjectMeta>> {
        let mut stream = ObjectStore::list(&self.store, Some(prefix));
        let mut objects = Vec::new();
        while let Some(item) = stream.next().await {
            objects.push(item.map_err(|e| StorageError::BackendError(e.to_string()))?);
        }
        Ok(objects)
    }

    async fn read_meta(&self, handle: &str) -> StorageResult<Option<MultipartMeta>> {
        let result: ObjectResult<_> = self.store.get(&Self::meta_path(handle)).await;
        let raw = match result {
            Ok(r) => r
                .bytes()
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?,
            Err(ObjectStoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(StorageError::BackendError(e.to_string())),
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            StorageError::BackendError(format!("Corrupt multipart metadata for {}: {}", handle, e))
        })
    }

    async fn open_writer(&self, location: &Path) -> StorageResult<WriteMultipart> {
        let upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        Ok(WriteMultipart::new(upload))
    }

    /// Hand `data` to the writer once an upload slot is free.
    async fn push(
        writer: &mut WriteMultipart,
        counter: &mut HashingCounter,
        data: Bytes,
    ) -> StorageResult<()> {
        writer
            .wait_for_capacity(MAX_INFLIGHT_PARTS)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        counter.update(&data);
        writer.put(data);
        Ok(())
    }

    async fn abort_writer(&self, writer: WriteMultipart, location: &Path) {
        if let Err(e) = writer.abort().await {
            tracing::warn!(
                error = %e,
                bucket = %self.bucket,
                location = %location,
                "Failed to abort multipart write"
            );
        }
    }

    /// Stream `reader` to `location` without holding the whole body,
    /// returning its size and digest.
    async fn write_streaming(
        &self,
        location: &Path,
        reader: &mut ByteReader,
    ) -> StorageResult<(u64, String)> {
        let mut writer = self.open_writer(location).await?;
        let mut counter = HashingCounter::default();
        let mut buf = vec![0u8; CHUNK_SIZE];

        let streamed: StorageResult<()> = async {
            loop {
                let n = reader.read(&mut buf).await.map_err(|e| {
                    StorageError::UploadFailed(format!("Failed to read from stream: {}", e))
                })?;
                if n == 0 {
                    return Ok(());
                }
                Self::push(&mut writer, &mut counter, Bytes::copy_from_slice(&buf[..n])).await?;
            }
        }
        .await;

        if let Err(e) = streamed {
            self.abort_writer(writer, location).await;
            return Err(e);
        }
        writer
            .finish()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        Ok(counter.finish())
    }

    async fn remove_staging(&self, handle: &str) -> StorageResult<usize> {
        let objects = self
            .list_prefix(&Path::from(staging_dir(handle)))
            .await?;
        let count = objects.len();
        for object in objects {
            match self.store.delete(&object.location).await {
                Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
                Err(e) => return Err(StorageError::DeleteFailed(e.to_string())),
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl<S: ObjectStore> Storage for S3Storage<S> {
    async fn upload(&self, key: &str, mut reader: ByteReader) -> StorageResult<StoredObject> {
        validate_content_id(key)?;
        let start = std::time::Instant::now();
        let location = Path::from(flat_blob_key(key));

        let (size, sha256) = self
            .write_streaming(&location, &mut reader)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                e
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(StoredObject {
            key: key.to_string(),
            size,
            sha256,
        })
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        validate_content_id(key)?;
        let start = std::time::Instant::now();
        let location = Path::from(flat_blob_key(key));

        let result: ObjectResult<_> = self.store.get(&location).await;

        let result = result.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
            other => {
                tracing::error!(
                    error = %other,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 download failed"
                );
                StorageError::DownloadFailed(other.to_string())
            }
        })?;

        let bucket = self.bucket.clone();
        let key = key.to_string();

        let stream = result.into_stream().map(move |res| match res {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                tracing::error!(
                    bucket = %bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 stream download error"
                );
                Err(StorageError::DownloadFailed(e.to_string()))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_content_id(key)?;
        let start = std::time::Instant::now();
        let location = Path::from(flat_blob_key(key));

        let result: ObjectResult<_> = self.store.delete(&location).await;

        match result {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                return Err(StorageError::DeleteFailed(e.to_string()));
            }
        }

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_content_id(key)?;
        let location = Path::from(flat_blob_key(key));
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn init_multipart(&self, content_id: &str, display_name: &str) -> StorageResult<String> {
        validate_content_id(content_id)?;
        let handle = new_handle();

        let meta = MultipartMeta {
            content_id: content_id.to_string(),
            display_name: display_name.to_string(),
            created_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&meta)
            .map_err(|e| StorageError::BackendError(format!("Failed to encode metadata: {}", e)))?;

        let result: ObjectResult<_> = self
            .store
            .put(&Self::meta_path(&handle), PutPayload::from(Bytes::from(raw)))
            .await;
        result.map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        tracing::info!(
            bucket = %self.bucket,
            handle = %handle,
            content_id = %content_id,
            "S3 multipart upload initialized"
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
        validate_handle(handle)?;
        let start = std::time::Instant::now();

        match self.store.head(&Self::meta_path(handle)).await {
            Ok(_) => {}
            Err(ObjectStoreError::NotFound { .. }) => {
                return Err(StorageError::NotFound(format!("multipart upload {}", handle)))
            }
            Err(e) => return Err(StorageError::BackendError(e.to_string())),
        }

        let (size, etag) = self
            .write_streaming(&Self::part_path(handle, part_number), &mut reader)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    handle = %handle,
                    part_number = part_number,
                    "S3 part upload failed"
                );
                e
            })?;

        tracing::debug!(
            bucket = %self.bucket,
            handle = %handle,
            part_number = part_number,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 part upload successful"
        );

        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        handle: &str,
        parts: &[PartInfo],
        expected_sha256: Option<&str>,
    ) -> StorageResult<StoredObject> {
        validate_handle(handle)?;
        let start = std::time::Instant::now();

        let meta = self
            .read_meta(handle)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("multipart upload {}", handle)))?;
        let numbers = ordered_part_numbers(parts)?;

        // Parts stream through a multipart write; nothing becomes visible
        // under the blob key until the digest checks out.
        let location = Path::from(flat_blob_key(&meta.content_id));
        let mut writer = self.open_writer(&location).await?;
        let mut counter = HashingCounter::default();

        let merged: StorageResult<()> = async {
            for n in &numbers {
                let result: ObjectResult<_> = self.store.get(&Self::part_path(handle, *n)).await;
                let mut chunks = match result {
                    Ok(r) => r.into_stream(),
                    Err(ObjectStoreError::NotFound { .. }) => {
                        return Err(StorageError::MissingPart(*n))
                    }
                    Err(e) => return Err(StorageError::BackendError(e.to_string())),
                };
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk.map_err(|e| StorageError::DownloadFailed(e.to_string()))?;
                    Self::push(&mut writer, &mut counter, chunk).await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = merged {
            self.abort_writer(writer, &location).await;
            return Err(e);
        }
        let (size, sha256) = counter.finish();

        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                tracing::warn!(
                    bucket = %self.bucket,
                    handle = %handle,
                    content_id = %meta.content_id,
                    expected = %expected,
                    actual = %sha256,
                    "Merged content does not match declared hash"
                );
                self.abort_writer(writer, &location).await;
                return Err(StorageError::Corrupt {
                    expected: expected.to_lowercase(),
                    actual: sha256,
                });
            }
        }

        writer.finish().await.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %meta.content_id,
                size_bytes = size,
                "S3 multipart merge upload failed"
            );
            StorageError::UploadFailed(e.to_string())
        })?;

        if let Err(e) = self.remove_staging(handle).await {
            tracing::warn!(
                error = %e,
                bucket = %self.bucket,
                handle = %handle,
                "Failed to remove staging objects after merge"
            );
        }

        tracing::info!(
            bucket = %self.bucket,
            handle = %handle,
            key = %meta.content_id,
            parts = numbers.len(),
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 multipart upload completed"
        );

        Ok(StoredObject {
            key: meta.content_id,
            size,
            sha256,
        })
    }

    async fn list_uploaded_parts(&self, handle: &str) -> StorageResult<BTreeSet<u32>> {
        validate_handle(handle)?;
        let objects = self
            .list_prefix(&Path::from(staging_dir(handle)))
            .await?;

        Ok(objects
            .iter()
            .filter_map(|o| o.location.filename())
            .filter_map(|name| name.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .collect())
    }

    async fn abort_multipart(&self, handle: &str) -> StorageResult<()> {
        validate_handle(handle)?;
        let removed = self.remove_staging(handle).await?;
        if removed > 0 {
            tracing::info!(
                bucket = %self.bucket,
                handle = %handle,
                objects = removed,
                "S3 multipart staging removed"
            );
        }
        Ok(())
    }

    async fn list_multipart_uploads(&self) -> StorageResult<Vec<StagedUpload>> {
        let objects = self.list_prefix(&Path::from(STAGING_PREFIX)).await?;

        let mut oldest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for object in objects {
            let location = object.location.as_ref();
            let handle = match location.split('/').nth(1) {
                Some(h) if validate_handle(h).is_ok() => h.to_string(),
                _ => continue,
            };
            oldest
                .entry(handle)
                .and_modify(|t| {
                    if object.last_modified < *t {
                        *t = object.last_modified;
                    }
                })
                .or_insert(object.last_modified);
        }

        Ok(oldest
            .into_iter()
            .map(|(handle, created_at)| StagedUpload { handle, created_at })
            .collect())
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}

#[cfg(all(test, feature = "storage-s3"))]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;
    use object_store::memory::InMemory;

    fn storage() -> S3Storage<InMemory> {
        S3Storage::with_store(InMemory::new(), "test-bucket")
    }

    fn reader(data: &[u8]) -> ByteReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    fn part(n: u32) -> PartInfo {
        PartInfo {
            part_number: n,
            etag: String::new(),
        }
    }

    #[tokio::test]
    async fn test_object_store_upload_download_delete() {
        let storage = storage();
        let stored = storage.upload("abc123", reader(b"payload")).await.unwrap();
        assert_eq!(stored.sha256, sha256_hex(b"payload"));
        assert!(storage.exists("abc123").await.unwrap());

        assert_eq!(storage.download_bytes("abc123").await.unwrap(), b"payload");

        storage.delete("abc123").await.unwrap();
        storage.delete("abc123").await.unwrap();
        assert!(matches!(
            storage.download("abc123").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_object_store_multipart_order_independent() {
        let storage = storage();
        let handle = storage.init_multipart("merged", "m.bin").await.unwrap();

        let etag3 = storage.upload_part(&handle, 3, reader(b"C")).await.unwrap();
        storage.upload_part(&handle, 1, reader(b"A")).await.unwrap();
        storage.upload_part(&handle, 2, reader(b"B")).await.unwrap();
        assert_eq!(etag3, sha256_hex(b"C"));

        let parts = storage.list_uploaded_parts(&handle).await.unwrap();
        assert_eq!(parts.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let stored = storage
            .complete_multipart(&handle, &[part(3), part(2), part(1)], None)
            .await
            .unwrap();
        assert_eq!(stored.key, "merged");
        assert_eq!(storage.download_bytes("merged").await.unwrap(), b"ABC");

        assert!(storage.list_uploaded_parts(&handle).await.unwrap().is_empty());
        assert!(storage.list_multipart_uploads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_object_store_missing_part() {
        let storage = storage();
        let handle = storage.init_multipart("gap", "g.bin").await.unwrap();
        storage.upload_part(&handle, 2, reader(b"B")).await.unwrap();

        let result = storage
            .complete_multipart(&handle, &[part(1), part(2)], None)
            .await;
        assert!(matches!(result, Err(StorageError::MissingPart(1))));
    }

    #[tokio::test]
    async fn test_object_store_corrupt_keeps_staging() {
        let storage = storage();
        let declared = sha256_hex(b"expected bytes");
        let handle = storage.init_multipart(&declared, "c.bin").await.unwrap();
        storage.upload_part(&handle, 1, reader(b"other bytes")).await.unwrap();

        let result = storage
            .complete_multipart(&handle, &[part(1)], Some(&declared))
            .await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
        assert!(!storage.exists(&declared).await.unwrap());
        assert_eq!(storage.list_uploaded_parts(&handle).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_object_store_merge_spans_several_write_chunks() {
        let storage = storage();
        let parts: Vec<Vec<u8>> = (0u8..3).map(|i| vec![b'a' + i; 4 * 1024 * 1024]).collect();
        let whole = parts.concat();
        let declared = sha256_hex(&whole);

        let handle = storage.init_multipart(&declared, "big.bin").await.unwrap();
        for (i, data) in parts.iter().enumerate() {
            storage
                .upload_part(&handle, i as u32 + 1, reader(data))
                .await
                .unwrap();
        }

        let stored = storage
            .complete_multipart(&handle, &[part(1), part(2), part(3)], Some(&declared))
            .await
            .unwrap();
        assert_eq!(stored.size, whole.len() as u64);
        assert_eq!(stored.sha256, declared);
        assert_eq!(storage.download_bytes(&declared).await.unwrap(), whole);
    }

    #[tokio::test]
    async fn test_object_store_corrupt_merge_leaves_existing_blob() {
        let storage = storage();
        let declared = sha256_hex(b"good");
        storage.upload(&declared, reader(b"good")).await.unwrap();

        let handle = storage.init_multipart(&declared, "dup.bin").await.unwrap();
        storage.upload_part(&handle, 1, reader(b"evil")).await.unwrap();
        let result = storage
            .complete_multipart(&handle, &[part(1)], Some(&declared))
            .await;

        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
        assert_eq!(storage.download_bytes(&declared).await.unwrap(), b"good");
    }

    #[tokio::test]
    async fn test_object_store_unknown_handle() {
        let storage = storage();
        let unknown = uuid::Uuid::new_v4().to_string();
        assert!(storage.list_uploaded_parts(&unknown).await.unwrap().is_empty());
        assert!(matches!(
            storage.upload_part(&unknown, 1, reader(b"x")).await,
            Err(StorageError::NotFound(_))
        ));
        storage.abort_multipart(&unknown).await.unwrap();
    }

    #[tokio::test]
    async fn test_object_store_staging_listing_and_abort() {
        let storage = storage();
        let h1 = storage.init_multipart("one", "1").await.unwrap();
        let h2 = storage.init_multipart("two", "2").await.unwrap();
        storage.upload_part(&h1, 1, reader(b"x")).await.unwrap();

        let mut handles: Vec<String> = storage
            .list_multipart_uploads()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.handle)
            .collect();
        handles.sort();
        let mut expected = vec![h1.clone(), h2.clone()];
        expected.sort();
        assert_eq!(handles, expected);

        storage.abort_multipart(&h1).await.unwrap();
        let remaining = storage.list_multipart_uploads().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].handle, h2);
    }
}
