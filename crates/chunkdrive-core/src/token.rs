//! Capability tokens
//!
//! A capability token authorizes one operation against one resource for a short
//! time. Tokens are HS256 JWTs so any process holding the shared secret can
//! verify them without a database or cache round trip.

use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::OwnerId;

/// Operation a token is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOperation {
    Upload,
    Download,
    Delete,
    MultipartInit,
    PartUpload,
    Complete,
    Abort,
    /// Read-only staging queries (part listing, sweep enumeration).
    Inspect,
}

impl TokenOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenOperation::Upload => "upload",
            TokenOperation::Download => "download",
            TokenOperation::Delete => "delete",
            TokenOperation::MultipartInit => "multipart_init",
            TokenOperation::PartUpload => "part_upload",
            TokenOperation::Complete => "complete",
            TokenOperation::Abort => "abort",
            TokenOperation::Inspect => "inspect",
        }
    }
}

impl fmt::Display for TokenOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resource a token is bound to. Absent fields are not constrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ResourceClaims {
    pub fn for_content(content_id: impl Into<String>) -> Self {
        Self {
            content_id: Some(content_id.into()),
            ..Default::default()
        }
    }

    pub fn for_upload(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: Some(upload_id.into()),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Require the claim to name exactly this content id.
    pub fn require_content(&self, content_id: &str) -> Result<(), AppError> {
        match self.content_id.as_deref() {
            Some(claimed) if claimed == content_id => Ok(()),
            _ => Err(AppError::Forbidden(
                "Token does not grant access to this file".to_string(),
            )),
        }
    }

    /// Require the claim to name exactly this upload id.
    pub fn require_upload(&self, upload_id: &str) -> Result<(), AppError> {
        match self.upload_id.as_deref() {
            Some(claimed) if claimed == upload_id => Ok(()),
            _ => Err(AppError::Forbidden(
                "Token does not grant access to this upload".to_string(),
            )),
        }
    }
}

/// Signed claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub op: TokenOperation,
    pub res: ResourceClaims,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Issues and verifies HS256 capability tokens.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(
        &self,
        op: TokenOperation,
        res: ResourceClaims,
        ttl_secs: i64,
    ) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            op,
            res,
            iat: now,
            exp: now + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("Failed to sign capability token: {}", e)))
    }

    /// Decode and check signature and expiry, without checking the operation.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<TokenClaims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AppError::Expired("Token has expired".to_string()),
                _ => AppError::Unauthorized("Invalid capability token".to_string()),
            }
        })?;

        // jsonwebtoken accepts exp == now; expiry must be strictly in the future
        if data.claims.exp <= Utc::now().timestamp() {
            return Err(AppError::Expired("Token has expired".to_string()));
        }

        Ok(data.claims)
    }

    pub fn verify(
        &self,
        token: &str,
        expected: TokenOperation,
    ) -> Result<TokenClaims, AppError> {
        let claims = self.decode(token)?;
        if claims.op != expected {
            return Err(AppError::Forbidden(format!(
                "Token is not valid for operation '{}'",
                expected
            )));
        }
        Ok(claims)
    }
}
