//! Storage-node side of the data plane.
//!
//! Every operation first verifies the capability token for its operation and
//! checks that the token names the resource being touched. Nothing here calls
//! back into the control plane.

use chunkdrive_core::models::is_sha256_hex;
use chunkdrive_core::models::wire::{InitResponse, StagedUploadEntry, StoredFile};
use chunkdrive_core::{AppError, AppResult, PartInfo, ResourceClaims, TokenOperation};
use chunkdrive_storage::{ByteReader, ByteStream, Storage, StorageError};
use std::collections::BTreeSet;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, ReadBuf};

use crate::tokens::TokenService;

/// Fails the read once more than `remaining` bytes have come through.
struct SizeLimited<R> {
    inner: R,
    remaining: u64,
    exceeded: Arc<AtomicBool>,
}

impl<R: AsyncRead + Unpin> AsyncRead for SizeLimited<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let read = (buf.filled().len() - before) as u64;
        if read > self.remaining {
            self.exceeded.store(true, Ordering::Relaxed);
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "body exceeds the declared size",
            )));
        }
        self.remaining -= read;
        Poll::Ready(Ok(()))
    }
}

/// Data-plane operations of one storage node over its local backend.
#[derive(Clone)]
pub struct StorageNode {
    storage: Arc<dyn Storage>,
    tokens: TokenService,
    public_url: String,
}

impl StorageNode {
    pub fn new(storage: Arc<dyn Storage>, tokens: TokenService, public_url: impl Into<String>) -> Self {
        Self {
            storage,
            tokens,
            public_url: public_url.into(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn content_claim(claims: &ResourceClaims) -> AppResult<&str> {
        claims
            .content_id
            .as_deref()
            .ok_or_else(|| AppError::Forbidden("Token does not name a file".to_string()))
    }

    fn upload_claim(claims: &ResourceClaims) -> AppResult<&str> {
        claims
            .upload_id
            .as_deref()
            .ok_or_else(|| AppError::Forbidden("Token does not name an upload".to_string()))
    }

    /// Whole-object upload under the token's content id.
    ///
    /// Bytes are staged first and only land under the content id once the size
    /// and, for SHA-256 ids, the digest check out.
    pub async fn upload(&self, token: &str, reader: ByteReader) -> AppResult<StoredFile> {
        let start = Instant::now();
        let claims = self.tokens.verify(token, TokenOperation::Upload).await?;
        let content_id = Self::content_claim(&claims)?.to_string();
        let display_name = claims.filename.clone().unwrap_or_else(|| content_id.clone());

        let exceeded = Arc::new(AtomicBool::new(false));
        let reader: ByteReader = match claims.size {
            Some(limit) => Box::pin(SizeLimited {
                inner: reader,
                remaining: limit,
                exceeded: exceeded.clone(),
            }),
            None => reader,
        };

        let handle = self.storage.init_multipart(&content_id, &display_name).await?;
        if let Err(e) = self.storage.upload_part(&handle, 1, reader).await {
            self.discard(&handle).await;
            if exceeded.load(Ordering::Relaxed) {
                return Err(AppError::PayloadTooLarge(format!(
                    "Upload exceeds the declared size of {} bytes",
                    claims.size.unwrap_or_default()
                )));
            }
            return Err(e.into());
        }

        let expected = is_sha256_hex(&content_id).then(|| content_id.to_ascii_lowercase());
        let part = PartInfo {
            part_number: 1,
            etag: String::new(),
        };
        let stored = match self
            .storage
            .complete_multipart(&handle, &[part], expected.as_deref())
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                self.discard(&handle).await;
                return Err(e.into());
            }
        };

        tracing::info!(
            content_id = %content_id,
            size_bytes = stored.size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Node upload stored"
        );
        Ok(StoredFile {
            file_id: stored.key,
            size: stored.size,
            sha256: stored.sha256,
        })
    }

    async fn discard(&self, handle: &str) {
        if let Err(e) = self.storage.abort_multipart(handle).await {
            tracing::warn!(error = %e, handle = %handle, "Failed to discard staging");
        }
    }

    /// Stream an object. Returns the display name claimed by the token, if any.
    pub async fn download(&self, file_id: &str, token: &str) -> AppResult<(ByteStream, Option<String>)> {
        let claims = self.tokens.verify(token, TokenOperation::Download).await?;
        claims.require_content(file_id)?;
        let stream = self.storage.download(file_id).await?;
        Ok((stream, claims.filename))
    }

    pub async fn delete(&self, file_id: &str, token: &str) -> AppResult<()> {
        let claims = self.tokens.verify(token, TokenOperation::Delete).await?;
        claims.require_content(file_id)?;
        self.storage.delete(file_id).await?;
        Ok(())
    }

    pub async fn exists(&self, file_id: &str, token: &str) -> AppResult<bool> {
        let claims = self.tokens.verify(token, TokenOperation::Inspect).await?;
        claims.require_content(file_id)?;
        match self.storage.exists(file_id).await {
            Ok(found) => Ok(found),
            Err(StorageError::InvalidKey(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn init_multipart(&self, filename: &str, token: &str) -> AppResult<InitResponse> {
        let claims = self.tokens.verify(token, TokenOperation::MultipartInit).await?;
        let content_id = Self::content_claim(&claims)?;
        let display_name = if filename.is_empty() {
            claims.filename.as_deref().unwrap_or(content_id)
        } else {
            filename
        };

        let handle = self.storage.init_multipart(content_id, display_name).await?;
        Ok(InitResponse {
            upload_id: handle,
            server_url: Some(self.public_url.clone()),
        })
    }

    /// Store one part. The token's upload claim names the staging handle; a
    /// handle given alongside must match it.
    pub async fn upload_part(
        &self,
        upload_id: Option<&str>,
        part_number: u32,
        token: &str,
        reader: ByteReader,
    ) -> AppResult<String> {
        let claims = self.tokens.verify(token, TokenOperation::PartUpload).await?;
        let handle = Self::upload_claim(&claims)?;
        if let Some(given) = upload_id.filter(|id| !id.is_empty()) {
            claims.require_upload(given)?;
        }
        Ok(self.storage.upload_part(handle, part_number, reader).await?)
    }

    pub async fn complete_multipart(
        &self,
        upload_id: &str,
        parts: &[PartInfo],
        sha256: Option<&str>,
        token: &str,
    ) -> AppResult<StoredFile> {
        let claims = self.tokens.verify(token, TokenOperation::Complete).await?;
        claims.require_upload(upload_id)?;
        let stored = self
            .storage
            .complete_multipart(upload_id, parts, sha256)
            .await?;
        Ok(StoredFile {
            file_id: stored.key,
            size: stored.size,
            sha256: stored.sha256,
        })
    }

    pub async fn list_parts(&self, upload_id: &str, token: &str) -> AppResult<BTreeSet<u32>> {
        let claims = self.tokens.verify(token, TokenOperation::Inspect).await?;
        claims.require_upload(upload_id)?;
        Ok(self.storage.list_uploaded_parts(upload_id).await?)
    }

    pub async fn abort_multipart(&self, upload_id: &str, token: &str) -> AppResult<()> {
        let claims = self.tokens.verify(token, TokenOperation::Abort).await?;
        claims.require_upload(upload_id)?;
        Ok(self.storage.abort_multipart(upload_id).await?)
    }

    pub async fn list_uploads(&self, token: &str) -> AppResult<Vec<StagedUploadEntry>> {
        self.tokens.verify(token, TokenOperation::Inspect).await?;
        Ok(self
            .storage
            .list_multipart_uploads()
            .await?
            .into_iter()
            .map(|staged| StagedUploadEntry {
                upload_id: staged.handle,
                created_at: staged.created_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEphemeralStore;
    use chunkdrive_core::TokenSigner;
    use chunkdrive_storage::{sha256_hex, LocalStorage};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        tokens: TokenService,
        node: StorageNode,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
        let tokens = TokenService::new(
            TokenSigner::new("test-secret-that-is-long-enough-123456"),
            Arc::new(InMemoryEphemeralStore::new()),
            Duration::from_secs(60),
        );
        let node = StorageNode::new(storage, tokens.clone(), "http://node:4000");
        Fixture {
            _dir: dir,
            tokens,
            node,
        }
    }

    fn reader(data: &[u8]) -> ByteReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_upload_with_sha256_id_is_verified() {
        let f = fixture().await;
        let data = b"verified content";
        let id = sha256_hex(data);

        let token = f
            .tokens
            .issue(TokenOperation::Upload, ResourceClaims::for_content(&id), 60)
            .unwrap();
        let stored = f.node.upload(&token, reader(data)).await.unwrap();
        assert_eq!(stored.file_id, id);
        assert_eq!(stored.size, data.len() as u64);

        let token = f
            .tokens
            .issue(TokenOperation::Upload, ResourceClaims::for_content(sha256_hex(b"x")), 60)
            .unwrap();
        let err = f.node.upload(&token, reader(data)).await.unwrap_err();
        assert!(matches!(err, AppError::Corrupt { .. }));
        assert!(!f.node.storage().exists(&sha256_hex(b"x")).await.unwrap());
        assert!(f.node.storage().list_multipart_uploads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_larger_than_claim_rejected() {
        let f = fixture().await;
        let token = f
            .tokens
            .issue(
                TokenOperation::Upload,
                ResourceClaims::for_content("small").with_size(4),
                60,
            )
            .unwrap();

        let err = f.node.upload(&token, reader(b"too many bytes")).await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));
        assert!(!f.node.storage().exists("small").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_requires_matching_claim() {
        let f = fixture().await;
        let up = f
            .tokens
            .issue(TokenOperation::Upload, ResourceClaims::for_content("abc123"), 60)
            .unwrap();
        f.node.upload(&up, reader(b"hello")).await.unwrap();

        let down = f
            .tokens
            .issue(
                TokenOperation::Download,
                ResourceClaims::for_content("abc123").with_filename("hello.txt"),
                60,
            )
            .unwrap();
        let (_, name) = f.node.download("abc123", &down).await.unwrap();
        assert_eq!(name.as_deref(), Some("hello.txt"));

        assert!(matches!(
            f.node.download("other", &down).await,
            Err(AppError::Forbidden(_))
        ));
        // A download token cannot upload
        assert!(matches!(
            f.node.upload(&down, reader(b"x")).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_multipart_flow_with_handle_in_token() {
        let f = fixture().await;
        let init = f
            .tokens
            .issue(TokenOperation::MultipartInit, ResourceClaims::for_content("abc123"), 60)
            .unwrap();
        let response = f.node.init_multipart("a.bin", &init).await.unwrap();
        assert_eq!(response.server_url.as_deref(), Some("http://node:4000"));
        let handle = response.upload_id;

        let part = f
            .tokens
            .issue(TokenOperation::PartUpload, ResourceClaims::for_upload(&handle), 60)
            .unwrap();
        f.node.upload_part(None, 2, &part, reader(b"world")).await.unwrap();
        f.node
            .upload_part(Some(handle.as_str()), 1, &part, reader(b"hello "))
            .await
            .unwrap();
        assert!(matches!(
            f.node.upload_part(Some("someone-else"), 3, &part, reader(b"!")).await,
            Err(AppError::Forbidden(_))
        ));

        let inspect = f
            .tokens
            .issue(TokenOperation::Inspect, ResourceClaims::for_upload(&handle), 60)
            .unwrap();
        let parts = f.node.list_parts(&handle, &inspect).await.unwrap();
        assert_eq!(parts.into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let complete = f
            .tokens
            .issue(TokenOperation::Complete, ResourceClaims::for_upload(&handle), 60)
            .unwrap();
        let parts = vec![
            PartInfo { part_number: 1, etag: String::new() },
            PartInfo { part_number: 2, etag: String::new() },
        ];
        let stored = f
            .node
            .complete_multipart(&handle, &parts, None, &complete)
            .await
            .unwrap();
        assert_eq!(stored.file_id, "abc123");
        assert_eq!(stored.size, 11);
        assert_eq!(
            f.node.storage().download_bytes("abc123").await.unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_part_upload_without_upload_claim_forbidden() {
        let f = fixture().await;
        let token = f
            .tokens
            .issue(TokenOperation::PartUpload, ResourceClaims::for_content("abc123"), 60)
            .unwrap();
        assert!(matches!(
            f.node.upload_part(None, 1, &token, reader(b"x")).await,
            Err(AppError::Forbidden(_))
        ));
    }
}
