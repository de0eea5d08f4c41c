//! Storage-node routes.
//!
//! Called directly by clients holding a capability token and by the control
//! plane's chunk service client. Every response except a successful download
//! is a `{code, message, data}` envelope.

use axum::{
    body::Body,
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
};
use chunkdrive_core::models::wire::{
    AbortRequest, CompleteRequest, DeleteRequest, DownloadQuery, Empty, ExistsResponse,
    InitRequest, InitResponse, PartUploadResponse, PartsResponse, StoredFile, TokenQuery,
    UploadIdQuery, UploadsResponse,
};
use chunkdrive_services::StorageNode;

use super::form::UploadForm;
use crate::error::{NodeError, NodeJson, NodeQuery, NodeReply};

/// Quote-safe filename for `Content-Disposition`.
fn disposition(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    format!("attachment; filename=\"{}\"", cleaned)
}

#[tracing::instrument(skip(node, multipart))]
pub async fn upload(
    State(node): State<StorageNode>,
    multipart: Multipart,
) -> Result<NodeReply<StoredFile>, NodeError> {
    let mut form = UploadForm::read(multipart, "file").await?;
    let reader = form.take_body()?;
    let token = form.require("token")?;
    Ok(NodeReply(node.upload(token, reader).await?))
}

#[tracing::instrument(skip(node, query), fields(file_id = %query.file_id))]
pub async fn download(
    State(node): State<StorageNode>,
    NodeQuery(query): NodeQuery<DownloadQuery>,
) -> Result<Response, NodeError> {
    let (stream, filename) = node.download(&query.file_id, &query.token).await?;
    let filename = filename.unwrap_or_else(|| query.file_id.clone());

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition(&filename)),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

#[tracing::instrument(skip(node, request), fields(file_id = %request.file_id))]
pub async fn delete(
    State(node): State<StorageNode>,
    NodeJson(request): NodeJson<DeleteRequest>,
) -> Result<NodeReply<Empty>, NodeError> {
    node.delete(&request.file_id, &request.token).await?;
    Ok(NodeReply(Empty {}))
}

pub async fn exists(
    State(node): State<StorageNode>,
    NodeQuery(query): NodeQuery<DownloadQuery>,
) -> Result<NodeReply<ExistsResponse>, NodeError> {
    let exists = node.exists(&query.file_id, &query.token).await?;
    Ok(NodeReply(ExistsResponse { exists }))
}

#[tracing::instrument(skip(node, request))]
pub async fn init_multipart(
    State(node): State<StorageNode>,
    NodeJson(request): NodeJson<InitRequest>,
) -> Result<NodeReply<InitResponse>, NodeError> {
    Ok(NodeReply(
        node.init_multipart(&request.filename, &request.token).await?,
    ))
}

#[tracing::instrument(skip(node, multipart))]
pub async fn upload_part(
    State(node): State<StorageNode>,
    multipart: Multipart,
) -> Result<NodeReply<PartUploadResponse>, NodeError> {
    let mut form = UploadForm::read(multipart, "part").await?;
    let reader = form.take_body()?;
    let part_number = form.part_number()?;
    let token = form.require("token")?;

    let etag = node
        .upload_part(form.text("upload_id"), part_number, token, reader)
        .await?;
    Ok(NodeReply(PartUploadResponse { etag }))
}

#[tracing::instrument(skip(node, request), fields(upload_id = %request.upload_id, parts = request.parts.len()))]
pub async fn complete_multipart(
    State(node): State<StorageNode>,
    NodeJson(request): NodeJson<CompleteRequest>,
) -> Result<NodeReply<StoredFile>, NodeError> {
    let stored = node
        .complete_multipart(
            &request.upload_id,
            &request.parts,
            request.sha256.as_deref(),
            &request.token,
        )
        .await?;
    Ok(NodeReply(stored))
}

pub async fn list_parts(
    State(node): State<StorageNode>,
    NodeQuery(query): NodeQuery<UploadIdQuery>,
) -> Result<NodeReply<PartsResponse>, NodeError> {
    let parts = node.list_parts(&query.upload_id, &query.token).await?;
    Ok(NodeReply(PartsResponse {
        parts: parts.into_iter().collect(),
    }))
}

#[tracing::instrument(skip(node, request), fields(upload_id = %request.upload_id))]
pub async fn abort_multipart(
    State(node): State<StorageNode>,
    NodeJson(request): NodeJson<AbortRequest>,
) -> Result<NodeReply<Empty>, NodeError> {
    node.abort_multipart(&request.upload_id, &request.token).await?;
    Ok(NodeReply(Empty {}))
}

pub async fn list_uploads(
    State(node): State<StorageNode>,
    NodeQuery(query): NodeQuery<TokenQuery>,
) -> Result<NodeReply<UploadsResponse>, NodeError> {
    let uploads = node.list_uploads(&query.token).await?;
    Ok(NodeReply(UploadsResponse { uploads }))
}
