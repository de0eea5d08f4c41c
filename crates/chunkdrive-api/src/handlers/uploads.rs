//! Control-plane upload routes.
//!
//! Multipart sessions, direct single-request uploads, download tickets and
//! quota. The caller is identified by [`CallerContext`].

use axum::{
    extract::{Multipart, Path, Query, State},
    Json,
};
use chunkdrive_core::models::{
    CompleteMultipartRequest, CompleteMultipartResponse, ConfirmUploadRequest,
    DirectUploadRequest, DirectUploadResponse, DownloadTicket, InitMultipartRequest,
    InitMultipartResponse, RefreshTokenRequest, RefreshTokenResponse, UploadStatusResponse,
};
use chunkdrive_core::{AppError, FileRecord, QuotaUsage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use super::form::UploadForm;
use crate::auth::CallerContext;
use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;

/// Stored part, as acknowledged to the client.
#[derive(Debug, Serialize, ToSchema)]
pub struct PartUploadResult {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatusQuery {
    pub upload_id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DownloadUrlQuery {
    /// Name offered to the browser when saving the file
    pub filename: Option<String>,
}

/// Start a multipart upload
#[utoipa::path(
    post,
    path = "/api/files/multipart/init",
    tag = "uploads",
    request_body = InitMultipartRequest,
    params(("X-User-Id" = i64, Header, description = "Caller account id")),
    responses(
        (status = 200, description = "Upload started, or finished instantly for known content", body = InitMultipartResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 403, description = "Quota exceeded", body = ErrorResponse),
        (status = 503, description = "No storage node available", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, request), fields(owner_id = caller.owner_id))]
pub async fn init_multipart(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<InitMultipartRequest>,
) -> Result<Json<InitMultipartResponse>, HttpAppError> {
    let response = state
        .uploads
        .init_multipart(caller.owner_id, &request)
        .await?;
    Ok(Json(response))
}

/// Upload one part through the control plane
#[utoipa::path(
    post,
    path = "/api/files/multipart/upload",
    tag = "uploads",
    request_body(content = inline(Object), content_type = "multipart/form-data", description = "Fields: upload_id, part_number, file"),
    params(("X-User-Id" = i64, Header, description = "Caller account id")),
    responses(
        (status = 200, description = "Part stored", body = PartUploadResult),
        (status = 400, description = "Invalid part number", body = ErrorResponse),
        (status = 403, description = "Upload belongs to another account", body = ErrorResponse),
        (status = 404, description = "Unknown or expired upload", body = ErrorResponse),
        (status = 409, description = "Completion in progress", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, multipart), fields(owner_id = caller.owner_id))]
pub async fn upload_part(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<PartUploadResult>, HttpAppError> {
    let mut form = UploadForm::read(multipart, "file").await?;
    let reader = form.take_body()?;
    let part_number = form.part_number()?;
    let upload_id = form.require("upload_id")?;

    let etag = state
        .uploads
        .upload_part(caller.owner_id, upload_id, part_number, reader)
        .await?;
    Ok(Json(PartUploadResult { part_number, etag }))
}

/// Uploaded parts of a session
#[utoipa::path(
    get,
    path = "/api/files/multipart/status",
    tag = "uploads",
    params(
        StatusQuery,
        ("X-User-Id" = i64, Header, description = "Caller account id")
    ),
    responses(
        (status = 200, description = "Session progress", body = UploadStatusResponse),
        (status = 403, description = "Upload belongs to another account", body = ErrorResponse),
        (status = 404, description = "Unknown or expired upload", body = ErrorResponse)
    )
)]
pub async fn upload_status(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<UploadStatusResponse>, HttpAppError> {
    let status = state
        .uploads
        .status(caller.owner_id, &query.upload_id)
        .await?;
    Ok(Json(status))
}

/// Merge the parts and commit the file
#[utoipa::path(
    post,
    path = "/api/files/multipart/complete",
    tag = "uploads",
    request_body = CompleteMultipartRequest,
    params(("X-User-Id" = i64, Header, description = "Caller account id")),
    responses(
        (status = 200, description = "File committed", body = CompleteMultipartResponse),
        (status = 400, description = "Part list incomplete or content hash mismatch", body = ErrorResponse),
        (status = 403, description = "Forbidden or quota exceeded", body = ErrorResponse),
        (status = 404, description = "Unknown or expired upload", body = ErrorResponse),
        (status = 409, description = "Completion already in progress", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, request), fields(owner_id = caller.owner_id, upload_id = %request.upload_id))]
pub async fn complete_multipart(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<CompleteMultipartRequest>,
) -> Result<Json<CompleteMultipartResponse>, HttpAppError> {
    request.validate().map_err(AppError::from)?;
    let response = state
        .uploads
        .complete(caller.owner_id, &request.upload_id, &request.parts)
        .await?;
    Ok(Json(response))
}

/// New part-upload token for an ongoing session
#[utoipa::path(
    post,
    path = "/api/files/multipart/refresh-token",
    tag = "uploads",
    request_body = RefreshTokenRequest,
    params(("X-User-Id" = i64, Header, description = "Caller account id")),
    responses(
        (status = 200, description = "Token issued", body = RefreshTokenResponse),
        (status = 403, description = "Upload belongs to another account", body = ErrorResponse),
        (status = 404, description = "Unknown or expired upload", body = ErrorResponse)
    )
)]
pub async fn refresh_token(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<RefreshTokenRequest>,
) -> Result<Json<RefreshTokenResponse>, HttpAppError> {
    request.validate().map_err(AppError::from)?;
    let response = state
        .uploads
        .refresh_token(caller.owner_id, &request.upload_id)
        .await?;
    Ok(Json(response))
}

/// Authorize a single-request upload straight to a storage node
#[utoipa::path(
    post,
    path = "/api/files/upload-url",
    tag = "uploads",
    request_body = DirectUploadRequest,
    params(("X-User-Id" = i64, Header, description = "Caller account id")),
    responses(
        (status = 200, description = "Upload URL and token, or instant upload", body = DirectUploadResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 403, description = "Quota exceeded", body = ErrorResponse),
        (status = 503, description = "No storage node available", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, request), fields(owner_id = caller.owner_id, hash = %request.hash))]
pub async fn upload_url(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<DirectUploadRequest>,
) -> Result<Json<DirectUploadResponse>, HttpAppError> {
    let response = state
        .uploads
        .issue_upload_token(caller.owner_id, &request)
        .await?;
    Ok(Json(response))
}

/// Confirm a direct upload and commit the file
#[utoipa::path(
    post,
    path = "/api/files/upload-complete",
    tag = "uploads",
    request_body = ConfirmUploadRequest,
    params(("X-User-Id" = i64, Header, description = "Caller account id")),
    responses(
        (status = 200, description = "File committed", body = FileRecord),
        (status = 403, description = "Forbidden or quota exceeded", body = ErrorResponse),
        (status = 404, description = "Unknown intent or bytes not on the node", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, request), fields(owner_id = caller.owner_id, file_id = %request.file_id))]
pub async fn upload_complete(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<ConfirmUploadRequest>,
) -> Result<Json<FileRecord>, HttpAppError> {
    let file = state
        .uploads
        .confirm_direct_upload(caller.owner_id, request.file_id)
        .await?;
    Ok(Json(file))
}

/// Download URL and token for content the caller owns
#[utoipa::path(
    get,
    path = "/api/files/download-url/{hash}",
    tag = "downloads",
    params(
        ("hash" = String, Path, description = "Content hash"),
        DownloadUrlQuery,
        ("X-User-Id" = i64, Header, description = "Caller account id")
    ),
    responses(
        (status = 200, description = "Download ticket", body = DownloadTicket),
        (status = 403, description = "Caller does not reference this content", body = ErrorResponse),
        (status = 404, description = "Unknown content", body = ErrorResponse)
    )
)]
pub async fn download_url(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<DownloadUrlQuery>,
) -> Result<Json<DownloadTicket>, HttpAppError> {
    let ticket = state
        .uploads
        .issue_download_token(caller.owner_id, &hash, query.filename.as_deref())
        .await?;
    Ok(Json(ticket))
}

/// Storage usage of the caller
#[utoipa::path(
    get,
    path = "/api/quota",
    tag = "quota",
    params(("X-User-Id" = i64, Header, description = "Caller account id")),
    responses(
        (status = 200, description = "Quota usage", body = QuotaUsage)
    )
)]
pub async fn quota(
    caller: CallerContext,
    State(state): State<Arc<AppState>>,
) -> Result<Json<QuotaUsage>, HttpAppError> {
    Ok(Json(state.uploads.quota(caller.owner_id).await?))
}
