//! Control-plane upload orchestration.
//!
//! Ties together the content index (instant uploads, quota), the session store,
//! node selection and token issuance. Storage and quota are only charged when
//! an upload completes; an abandoned session simply expires.

use chrono::Utc;
use chunkdrive_core::constants::{PENDING_UPLOAD_PREFIX, PENDING_UPLOAD_TTL_SECS};
use chunkdrive_core::models::{
    is_sha256_hex, CompleteMultipartResponse, DirectUploadRequest, DirectUploadResponse,
    DownloadTicket, InitMultipartRequest, InitMultipartResponse, PendingUpload,
    RefreshTokenResponse, StagingRef, UploadStatusResponse,
};
use chunkdrive_core::{
    AppError, AppResult, FileRecord, OwnerId, PartInfo, QuotaUsage, ResourceClaims,
    TokenOperation,
};
use chunkdrive_storage::ByteReader;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use validator::Validate;

use crate::cache::{get_json, put_json, EphemeralStore};
use crate::cas::ContentIndex;
use crate::discovery::StorageSelector;
use crate::session::{NewSession, SessionStore};
use crate::tokens::TokenService;

/// Token lifetimes handed to clients.
#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    pub upload_token_ttl_secs: i64,
    pub download_token_ttl_secs: i64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            upload_token_ttl_secs: 3600,
            download_token_ttl_secs: 900,
        }
    }
}

fn pending_key(file_id: &Uuid) -> String {
    format!("{}{}", PENDING_UPLOAD_PREFIX, file_id)
}

pub struct UploadService {
    sessions: SessionStore,
    index: ContentIndex,
    selector: Arc<dyn StorageSelector>,
    tokens: TokenService,
    cache: Arc<dyn EphemeralStore>,
    settings: UploadSettings,
}

impl UploadService {
    pub fn new(
        sessions: SessionStore,
        index: ContentIndex,
        selector: Arc<dyn StorageSelector>,
        tokens: TokenService,
        cache: Arc<dyn EphemeralStore>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            sessions,
            index,
            selector,
            tokens,
            cache,
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn index(&self) -> &ContentIndex {
        &self.index
    }

    fn part_token(&self, owner_id: OwnerId, handle: &str) -> AppResult<String> {
        self.tokens.issue(
            TokenOperation::PartUpload,
            ResourceClaims::for_upload(handle).with_owner(owner_id),
            self.settings.upload_token_ttl_secs,
        )
    }

    /// Start a multipart upload, or finish at once when the content is known.
    #[tracing::instrument(skip(self, request), fields(hash = %request.hash, size = request.size))]
    pub async fn init_multipart(
        &self,
        owner_id: OwnerId,
        request: &InitMultipartRequest,
    ) -> AppResult<InitMultipartResponse> {
        request.validate()?;

        if let Some(blob) = self.index.contains(&request.hash).await? {
            let file = self
                .index
                .attach(owner_id, &blob.hash, blob.size, &request.filename)
                .await?;
            tracing::info!(owner_id, "Instant upload, content already stored");
            return Ok(InitMultipartResponse {
                instant: true,
                upload_id: None,
                server_url: None,
                upload_token: None,
                file: Some(file),
            });
        }

        self.index.ensure_headroom(owner_id, request.size).await?;

        let node = self.selector.select().await?;
        let handle = node
            .storage
            .init_multipart(&request.hash, &request.filename)
            .await?;

        let created = self
            .sessions
            .create(NewSession {
                owner_id,
                content_hash: request.hash.clone(),
                size: request.size,
                filename: request.filename.clone(),
                total_parts: request.total_parts,
                staging: StagingRef {
                    node_id: node.node_id.clone(),
                    handle: handle.clone(),
                },
            })
            .await;
        let session = match created {
            Ok(session) => session,
            Err(e) => {
                if let Err(abort_err) = node.storage.abort_multipart(&handle).await {
                    tracing::warn!(error = %abort_err, handle = %handle, "Failed to drop staging");
                }
                return Err(e);
            }
        };

        Ok(InitMultipartResponse {
            instant: false,
            upload_id: Some(session.upload_id),
            server_url: Some(node.url),
            upload_token: Some(self.part_token(owner_id, &handle)?),
            file: None,
        })
    }

    /// Store one part sent through the control plane.
    pub async fn upload_part(
        &self,
        owner_id: OwnerId,
        upload_id: &str,
        part_number: u32,
        reader: ByteReader,
    ) -> AppResult<String> {
        let session = self.sessions.require_owner(upload_id, owner_id).await?;
        if self.sessions.is_completing(upload_id).await? {
            return Err(AppError::Conflict(
                "Upload completion already in progress".to_string(),
            ));
        }
        if part_number == 0 || part_number > session.total_parts {
            return Err(AppError::InvalidInput(format!(
                "part_number must be between 1 and {}",
                session.total_parts
            )));
        }

        let node = self.selector.get(&session.node_id).await?;
        let etag = node
            .storage
            .upload_part(&session.backend_handle, part_number, reader)
            .await?;

        tracing::debug!(upload_id = %upload_id, part_number, "Part stored");
        Ok(etag)
    }

    pub async fn status(&self, owner_id: OwnerId, upload_id: &str) -> AppResult<UploadStatusResponse> {
        let session = self.sessions.require_owner(upload_id, owner_id).await?;
        let node = self.selector.get(&session.node_id).await?;
        let parts = node
            .storage
            .list_uploaded_parts(&session.backend_handle)
            .await?;

        Ok(UploadStatusResponse {
            upload_id: session.upload_id,
            total_parts: session.total_parts,
            uploaded_parts: parts.into_iter().collect(),
        })
    }

    /// Merge the parts, verify the digest and commit the file reference.
    ///
    /// Runs behind the completion barrier. A digest mismatch leaves the index
    /// and quota untouched and keeps the session, so the client can re-upload.
    pub async fn complete(
        &self,
        owner_id: OwnerId,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> AppResult<CompleteMultipartResponse> {
        self.sessions.require_owner(upload_id, owner_id).await?;
        self.sessions.begin_completion(upload_id).await?;

        let result = self.complete_locked(owner_id, upload_id, parts).await;

        if let Err(e) = self.sessions.end_completion(upload_id).await {
            tracing::warn!(error = %e, upload_id = %upload_id, "Failed to release completion barrier");
        }
        result
    }

    #[tracing::instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_locked(
        &self,
        owner_id: OwnerId,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> AppResult<CompleteMultipartResponse> {
        let start = Instant::now();
        // Re-read under the barrier; the session may have expired meanwhile
        let session = self.sessions.require_owner(upload_id, owner_id).await?;

        let listed: BTreeSet<u32> = parts.iter().map(|p| p.part_number).collect();
        let expected: BTreeSet<u32> = (1..=session.total_parts).collect();
        if listed != expected {
            return Err(AppError::InvalidInput(format!(
                "Parts must be exactly 1..={}",
                session.total_parts
            )));
        }

        self.index.ensure_headroom(owner_id, session.size).await?;

        let node = self.selector.get(&session.node_id).await?;
        let expected_digest =
            is_sha256_hex(&session.content_hash).then(|| session.content_hash.to_ascii_lowercase());
        let stored = node
            .storage
            .complete_multipart(&session.backend_handle, parts, expected_digest.as_deref())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, upload_id = %upload_id, "Multipart merge failed");
                AppError::from(e)
            })?;

        if stored.size != session.size {
            tracing::warn!(
                upload_id = %upload_id,
                declared = session.size,
                actual = stored.size,
                "Merged size differs from declared size"
            );
        }

        self.index.record(&session.content_hash, stored.size).await?;
        let file = self
            .index
            .attach(owner_id, &session.content_hash, stored.size, &session.filename)
            .await?;
        self.sessions.delete(upload_id).await?;

        tracing::info!(
            upload_id = %upload_id,
            hash = %session.content_hash,
            size_bytes = stored.size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Multipart upload completed"
        );

        Ok(CompleteMultipartResponse {
            hash: session.content_hash,
            file,
        })
    }

    /// New `part_upload` token for an ongoing session.
    pub async fn refresh_token(&self, owner_id: OwnerId, upload_id: &str) -> AppResult<RefreshTokenResponse> {
        let session = self.sessions.require_owner(upload_id, owner_id).await?;
        Ok(RefreshTokenResponse {
            upload_token: self.part_token(owner_id, &session.backend_handle)?,
            expires_in: self.settings.upload_token_ttl_secs,
        })
    }

    /// Authorize a single-request upload straight to a storage node.
    pub async fn issue_upload_token(
        &self,
        owner_id: OwnerId,
        request: &DirectUploadRequest,
    ) -> AppResult<DirectUploadResponse> {
        request.validate()?;

        if let Some(blob) = self.index.contains(&request.hash).await? {
            let file = self
                .index
                .attach(owner_id, &blob.hash, blob.size, &request.filename)
                .await?;
            return Ok(DirectUploadResponse {
                instant: true,
                file_id: None,
                upload_url: None,
                token: None,
                file: Some(file),
            });
        }

        self.index.ensure_headroom(owner_id, request.size).await?;
        let node = self.selector.select().await?;

        let pending = PendingUpload {
            file_id: Uuid::new_v4(),
            owner_id,
            hash: request.hash.clone(),
            size: request.size,
            filename: request.filename.clone(),
            node_id: node.node_id.clone(),
            created_at: Utc::now(),
        };
        put_json(
            self.cache.as_ref(),
            &pending_key(&pending.file_id),
            &pending,
            Duration::from_secs(PENDING_UPLOAD_TTL_SECS),
        )
        .await?;

        let token = self.tokens.issue(
            TokenOperation::Upload,
            ResourceClaims::for_content(&request.hash)
                .with_owner(owner_id)
                .with_filename(&request.filename)
                .with_size(request.size),
            self.settings.upload_token_ttl_secs,
        )?;

        Ok(DirectUploadResponse {
            instant: false,
            file_id: Some(pending.file_id),
            upload_url: Some(format!("{}/upload", node.url)),
            token: Some(token),
            file: None,
        })
    }

    /// Commit a direct upload once the bytes are on the node.
    pub async fn confirm_direct_upload(&self, owner_id: OwnerId, file_id: Uuid) -> AppResult<FileRecord> {
        let key = pending_key(&file_id);
        let pending: PendingUpload = get_json(self.cache.as_ref(), &key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", file_id)))?;
        if pending.owner_id != owner_id {
            return Err(AppError::Forbidden(
                "Upload does not belong to the caller".to_string(),
            ));
        }

        let node = self.selector.get(&pending.node_id).await?;
        if !node.storage.exists(&pending.hash).await? {
            return Err(AppError::NotFound(
                "Uploaded content not found on storage node".to_string(),
            ));
        }

        // Claim the intent so a concurrent confirm cannot commit twice
        if !self.cache.delete(&key).await? {
            return Err(AppError::NotFound(format!("Upload {} not found", file_id)));
        }

        let committed = async {
            self.index.record(&pending.hash, pending.size).await?;
            self.index
                .attach(owner_id, &pending.hash, pending.size, &pending.filename)
                .await
        }
        .await;

        if committed.is_err() {
            if let Err(e) = put_json(
                self.cache.as_ref(),
                &key,
                &pending,
                Duration::from_secs(PENDING_UPLOAD_TTL_SECS),
            )
            .await
            {
                tracing::warn!(error = %e, file_id = %file_id, "Failed to restore pending upload");
            }
        }
        committed
    }

    /// Download URL and token for content the owner references.
    pub async fn issue_download_token(
        &self,
        owner_id: OwnerId,
        hash: &str,
        filename: Option<&str>,
    ) -> AppResult<DownloadTicket> {
        self.index.lookup(hash).await?;
        if !self.index.owner_has_blob(owner_id, hash).await? {
            return Err(AppError::Forbidden(
                "File does not belong to the caller".to_string(),
            ));
        }

        let node = self.selector.select().await?;
        let mut claims = ResourceClaims::for_content(hash).with_owner(owner_id);
        if let Some(name) = filename {
            claims = claims.with_filename(name);
        }
        let token = self.tokens.issue(
            TokenOperation::Download,
            claims,
            self.settings.download_token_ttl_secs,
        )?;

        Ok(DownloadTicket {
            download_url: format!("{}/download?file_id={}&token={}", node.url, hash, token),
            token,
            expires_in: self.settings.download_token_ttl_secs,
        })
    }

    pub async fn quota(&self, owner_id: OwnerId) -> AppResult<QuotaUsage> {
        self.index.quota(owner_id).await
    }
}
