use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::blob::{FileRecord, OwnerId};

/// Content ids are hashes: `[A-Za-z0-9._-]`, 1..=128 chars, never `.` or `..`.
pub fn is_valid_content_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Whether the id is a hex SHA-256 digest, and so can be verified against the bytes.
pub fn is_sha256_hex(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn validate_content_id(id: &str) -> Result<(), ValidationError> {
    if is_valid_content_id(id) {
        Ok(())
    } else {
        Err(ValidationError::new("content_id")
            .with_message("hash must be 1-128 characters of [A-Za-z0-9._-]".into()))
    }
}

/// In-progress multipart upload, stored in the ephemeral cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub owner_id: OwnerId,
    /// Expected content hash, checked after the merge.
    pub content_hash: String,
    pub size: u64,
    pub filename: String,
    pub total_parts: u32,
    /// Storage node holding the staging data.
    pub node_id: String,
    /// Backend staging handle; never shown to clients.
    pub backend_handle: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Where a session's staging data lives. Outlives the session record so
/// expiry cleanup can still find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRef {
    pub node_id: String,
    pub handle: String,
}

/// A direct upload that was authorized but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub file_id: Uuid,
    pub owner_id: OwnerId,
    pub hash: String,
    pub size: u64,
    pub filename: String,
    pub node_id: String,
    pub created_at: DateTime<Utc>,
}

/// One uploaded part as reported back by the client on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PartInfo {
    pub part_number: u32,
    #[serde(default)]
    pub etag: String,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct InitMultipartRequest {
    /// Expected content hash (hex SHA-256 is verified after the merge)
    #[validate(custom(function = "validate_content_id"))]
    pub hash: String,
    /// Declared total size in bytes
    pub size: u64,
    #[validate(length(
        min = 1,
        max = 255,
        message = "Filename must be between 1 and 255 characters"
    ))]
    pub filename: String,
    #[validate(range(min = 1, max = 10000, message = "total_parts must be between 1 and 10000"))]
    pub total_parts: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InitMultipartResponse {
    /// True when the content already exists and no bytes need to be sent
    pub instant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// `part_upload` token for sending parts straight to the storage node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub total_parts: u32,
    pub uploaded_parts: Vec<u32>,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CompleteMultipartRequest {
    #[validate(length(min = 1, max = 64))]
    pub upload_id: String,
    #[validate(length(min = 1, message = "At least one part is required"))]
    pub parts: Vec<PartInfo>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CompleteMultipartResponse {
    pub hash: String,
    pub file: FileRecord,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct RefreshTokenRequest {
    #[validate(length(min = 1, max = 64))]
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RefreshTokenResponse {
    pub upload_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct DirectUploadRequest {
    #[validate(custom(function = "validate_content_id"))]
    pub hash: String,
    pub size: u64,
    #[validate(length(
        min = 1,
        max = 255,
        message = "Filename must be between 1 and 255 characters"
    ))]
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DirectUploadResponse {
    pub instant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmUploadRequest {
    pub file_id: Uuid,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DownloadTicket {
    pub download_url: String,
    pub token: String,
    pub expires_in: i64,
}
