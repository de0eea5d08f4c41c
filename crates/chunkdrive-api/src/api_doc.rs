//! OpenAPI documentation of the control-plane routes.
//!
//! The storage-node surface is token-driven and documented by its wire types
//! in `chunkdrive_core::models::wire`.

use utoipa::OpenApi;

use crate::error;
use crate::handlers;
use chunkdrive_core::models;

pub fn get_openapi_spec() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Chunkdrive API",
        version = "0.1.0",
        description = "Chunked, resumable uploads into content-addressable storage. Identical content is stored once; every file reference is charged to its owner's quota."
    ),
    paths(
        handlers::uploads::init_multipart,
        handlers::uploads::upload_part,
        handlers::uploads::upload_status,
        handlers::uploads::complete_multipart,
        handlers::uploads::refresh_token,
        handlers::uploads::upload_url,
        handlers::uploads::upload_complete,
        handlers::uploads::download_url,
        handlers::uploads::quota,
    ),
    components(
        schemas(
            error::ErrorResponse,
            handlers::uploads::PartUploadResult,
            models::PartInfo,
            models::FileRecord,
            models::QuotaUsage,
            models::InitMultipartRequest,
            models::InitMultipartResponse,
            models::UploadStatusResponse,
            models::CompleteMultipartRequest,
            models::CompleteMultipartResponse,
            models::RefreshTokenRequest,
            models::RefreshTokenResponse,
            models::DirectUploadRequest,
            models::DirectUploadResponse,
            models::ConfirmUploadRequest,
            models::DownloadTicket,
        )
    ),
    tags(
        (name = "uploads", description = "Multipart and direct uploads"),
        (name = "downloads", description = "Download tickets"),
        (name = "quota", description = "Per-owner storage usage")
    )
)]
pub struct ApiDoc;
