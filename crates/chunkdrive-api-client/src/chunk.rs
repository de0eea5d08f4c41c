use async_trait::async_trait;
use chunkdrive_core::models::wire::{
    AbortRequest, CompleteRequest, DeleteRequest, Empty, ExistsResponse, InitRequest,
    InitResponse, PartUploadResponse, PartsResponse, StoredFile, UploadsResponse,
};
use chunkdrive_core::{
    AppError, PartInfo, ResourceClaims, StorageBackend, TokenOperation, TokenSigner,
};
use chunkdrive_storage::{
    ByteReader, ByteStream, StagedUpload, Storage, StorageError, StorageResult, StoredObject,
};
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;

use crate::NodeClient;

/// `Storage` backed by a remote storage node.
///
/// Every call carries a freshly signed token scoped to that call's operation and
/// resource, so the node never needs to call back into the control plane.
#[derive(Clone, Debug)]
pub struct ChunkServiceClient {
    node: NodeClient,
    signer: TokenSigner,
    token_ttl_secs: i64,
    node_id: String,
}

impl ChunkServiceClient {
    pub fn new(
        node_id: impl Into<String>,
        base_url: impl Into<String>,
        signer: TokenSigner,
        token_ttl_secs: i64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            node: NodeClient::new(base_url, timeout)?,
            signer,
            token_ttl_secs,
            node_id: node_id.into(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Base URL clients use to reach this node directly.
    pub fn server_url(&self) -> &str {
        self.node.base_url()
    }

    fn sign(&self, op: TokenOperation, claims: ResourceClaims) -> StorageResult<String> {
        self.signer
            .issue(op, claims, self.token_ttl_secs)
            .map_err(signing_failed)
    }
}

/// Signing runs in this process; the node never saw the request.
fn signing_failed(err: AppError) -> StorageError {
    StorageError::BackendError(format!("Failed to sign node token: {}", err))
}

fn stream_part(reader: ByteReader, file_name: &str) -> Part {
    Part::stream(Body::wrap_stream(ReaderStream::new(reader))).file_name(file_name.to_string())
}

#[async_trait]
impl Storage for ChunkServiceClient {
    async fn upload(&self, key: &str, reader: ByteReader) -> StorageResult<StoredObject> {
        let start = Instant::now();
        let token = self.sign(TokenOperation::Upload, ResourceClaims::for_content(key))?;
        let form = Form::new()
            .text("token", token)
            .part("file", stream_part(reader, key));

        let stored: StoredFile = self.node.post_multipart("/upload", form).await?;

        tracing::info!(
            node_id = %self.node_id,
            key = %stored.file_id,
            size_bytes = stored.size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Remote storage upload successful"
        );

        Ok(StoredObject {
            key: stored.file_id,
            size: stored.size,
            sha256: stored.sha256,
        })
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        let token = self.sign(TokenOperation::Download, ResourceClaims::for_content(key))?;
        self.node
            .get_stream("/download", &[("file_id", key.to_string()), ("token", token)])
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let token = self.sign(TokenOperation::Delete, ResourceClaims::for_content(key))?;
        let _: Empty = self
            .node
            .post_json(
                "/delete",
                &DeleteRequest {
                    file_id: key.to_string(),
                    token,
                },
            )
            .await?;

        tracing::debug!(node_id = %self.node_id, key = %key, "Remote object deleted");
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let token = self.sign(TokenOperation::Inspect, ResourceClaims::for_content(key))?;
        let response: ExistsResponse = self
            .node
            .get_json("/exists", &[("file_id", key.to_string()), ("token", token)])
            .await?;
        Ok(response.exists)
    }

    async fn init_multipart(&self, content_id: &str, display_name: &str) -> StorageResult<String> {
        let token = self.sign(
            TokenOperation::MultipartInit,
            ResourceClaims::for_content(content_id).with_filename(display_name),
        )?;
        let response: InitResponse = self
            .node
            .post_json(
                "/multipart/init",
                &InitRequest {
                    filename: display_name.to_string(),
                    token,
                },
            )
            .await?;

        tracing::info!(
            node_id = %self.node_id,
            content_id = %content_id,
            handle = %response.upload_id,
            "Remote multipart upload initialized"
        );
        Ok(response.upload_id)
    }

    async fn upload_part(
        &self,
        handle: &str,
        part_number: u32,
        reader: ByteReader,
    ) -> StorageResult<String> {
        let token = self.sign(TokenOperation::PartUpload, ResourceClaims::for_upload(handle))?;
        let form = Form::new()
            .text("upload_id", handle.to_string())
            .text("part_number", part_number.to_string())
            .text("token", token)
            .part("part", stream_part(reader, &part_number.to_string()));

        let response: PartUploadResponse = self.node.post_multipart("/multipart/upload", form).await?;
        Ok(response.etag)
    }

    async fn complete_multipart(
        &self,
        handle: &str,
        parts: &[PartInfo],
        expected_sha256: Option<&str>,
    ) -> StorageResult<StoredObject> {
        let start = Instant::now();
        let token = self.sign(TokenOperation::Complete, ResourceClaims::for_upload(handle))?;
        let stored: StoredFile = self
            .node
            .post_json(
                "/multipart/complete",
                &CompleteRequest {
                    upload_id: handle.to_string(),
                    parts: parts.to_vec(),
                    sha256: expected_sha256.map(str::to_string),
                    token,
                },
            )
            .await?;

        tracing::info!(
            node_id = %self.node_id,
            handle = %handle,
            key = %stored.file_id,
            size_bytes = stored.size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Remote multipart upload completed"
        );

        Ok(StoredObject {
            key: stored.file_id,
            size: stored.size,
            sha256: stored.sha256,
        })
    }

    async fn list_uploaded_parts(&self, handle: &str) -> StorageResult<BTreeSet<u32>> {
        let token = self.sign(TokenOperation::Inspect, ResourceClaims::for_upload(handle))?;
        let response: PartsResponse = self
            .node
            .get_json(
                "/multipart/parts",
                &[("upload_id", handle.to_string()), ("token", token)],
            )
            .await?;
        Ok(response.parts.into_iter().collect())
    }

    async fn abort_multipart(&self, handle: &str) -> StorageResult<()> {
        let token = self.sign(TokenOperation::Abort, ResourceClaims::for_upload(handle))?;
        let _: Empty = self
            .node
            .post_json(
                "/multipart/abort",
                &AbortRequest {
                    upload_id: handle.to_string(),
                    token,
                },
            )
            .await?;
        Ok(())
    }

    async fn list_multipart_uploads(&self) -> StorageResult<Vec<StagedUpload>> {
        let token = self.sign(TokenOperation::Inspect, ResourceClaims::default())?;
        let response: UploadsResponse = self
            .node
            .get_json("/multipart/uploads", &[("token", token)])
            .await?;
        Ok(response
            .uploads
            .into_iter()
            .map(|entry| StagedUpload {
                handle: entry.upload_id,
                created_at: entry.created_at,
            })
            .collect())
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Remote
    }
}
