//! Error types module
//!
//! All failures of the upload subsystem are unified under `AppError`. Backend and
//! network errors are wrapped with context and surfaced as one of the taxonomy
//! kinds below, never as raw transport errors.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like an unreachable node
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "NOT_FOUND")
    fn error_code(&self) -> &'static str;

    /// Numeric application code carried in the `{code, message, data}` envelope.
    /// Zero is reserved for success.
    fn app_code(&self) -> i32;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden from clients
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Storage quota exceeded: {used} + {requested} bytes exceeds limit {limit}")]
    QuotaExceeded { used: u64, requested: u64, limit: u64 },

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    Corrupt { expected: String, actual: String },

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(format!("Validation error: {}", err))
    }
}

/// Envelope codes. Zero means success.
pub mod codes {
    pub const OK: i32 = 0;
    pub const INVALID_INPUT: i32 = 40000;
    pub const CORRUPT: i32 = 40001;
    pub const UNAUTHORIZED: i32 = 40100;
    pub const FORBIDDEN: i32 = 40300;
    pub const QUOTA_EXCEEDED: i32 = 40301;
    pub const NOT_FOUND: i32 = 40400;
    pub const CONFLICT: i32 = 40900;
    pub const EXPIRED: i32 = 41000;
    pub const PAYLOAD_TOO_LARGE: i32 = 41300;
    pub const INTERNAL: i32 = 50000;
    pub const DATABASE: i32 = 50001;
    pub const STORAGE: i32 = 50003;
    pub const UNAVAILABLE: i32 = 50300;
}

/// Static metadata for each variant:
/// (http_status, error_code, app_code, recoverable, suggested_action, sensitive, log_level).
fn app_error_static_metadata(
    err: &AppError,
) -> (
    u16,
    &'static str,
    i32,
    bool,
    Option<&'static str>,
    bool,
    LogLevel,
) {
    match err {
        AppError::Database(_) => (
            500,
            "DATABASE_ERROR",
            codes::DATABASE,
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::Storage(_) => (
            500,
            "STORAGE_ERROR",
            codes::STORAGE,
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::InvalidInput(_) => (
            400,
            "INVALID_INPUT",
            codes::INVALID_INPUT,
            false,
            Some("Check request parameters and try again"),
            false,
            LogLevel::Debug,
        ),
        AppError::NotFound(_) => (
            404,
            "NOT_FOUND",
            codes::NOT_FOUND,
            false,
            Some("Verify the resource ID exists"),
            false,
            LogLevel::Debug,
        ),
        AppError::Forbidden(_) => (
            403,
            "FORBIDDEN",
            codes::FORBIDDEN,
            false,
            None,
            false,
            LogLevel::Debug,
        ),
        AppError::QuotaExceeded { .. } => (
            403,
            "QUOTA_EXCEEDED",
            codes::QUOTA_EXCEEDED,
            false,
            Some("Free up storage space before uploading"),
            false,
            LogLevel::Debug,
        ),
        AppError::Expired(_) => (
            410,
            "EXPIRED",
            codes::EXPIRED,
            false,
            Some("Request a new token or restart the upload"),
            false,
            LogLevel::Debug,
        ),
        AppError::Unavailable(_) => (
            503,
            "UNAVAILABLE",
            codes::UNAVAILABLE,
            true,
            Some("Retry after a short delay"),
            false,
            LogLevel::Warn,
        ),
        AppError::Conflict(_) => (
            409,
            "CONFLICT",
            codes::CONFLICT,
            true,
            Some("Wait for the pending operation to finish"),
            false,
            LogLevel::Debug,
        ),
        AppError::Corrupt { .. } => (
            400,
            "CONTENT_HASH_MISMATCH",
            codes::CORRUPT,
            false,
            Some("Re-upload the parts and verify the declared hash"),
            false,
            LogLevel::Warn,
        ),
        AppError::PayloadTooLarge(_) => (
            413,
            "PAYLOAD_TOO_LARGE",
            codes::PAYLOAD_TOO_LARGE,
            false,
            Some("Reduce the body size or use a multipart upload"),
            false,
            LogLevel::Debug,
        ),
        AppError::Unauthorized(_) => (
            401,
            "UNAUTHORIZED",
            codes::UNAUTHORIZED,
            false,
            Some("Check the capability token"),
            false,
            LogLevel::Debug,
        ),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => (
            500,
            "INTERNAL_ERROR",
            codes::INTERNAL,
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
    }
}

impl AppError {
    /// Get the error type name for detailed error responses
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::Storage(_) => "Storage",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::NotFound(_) => "NotFound",
            AppError::Forbidden(_) => "Forbidden",
            AppError::QuotaExceeded { .. } => "QuotaExceeded",
            AppError::Expired(_) => "Expired",
            AppError::Unavailable(_) => "Unavailable",
            AppError::Conflict(_) => "Conflict",
            AppError::Corrupt { .. } => "Corrupt",
            AppError::PayloadTooLarge(_) => "PayloadTooLarge",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Rebuild an error from an envelope code returned by a remote node.
    ///
    /// Unknown codes become `Storage` so they stay sensitive.
    pub fn from_app_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::INVALID_INPUT => AppError::InvalidInput(message),
            codes::CORRUPT => AppError::Corrupt {
                expected: String::new(),
                actual: message,
            },
            codes::UNAUTHORIZED => AppError::Unauthorized(message),
            codes::FORBIDDEN => AppError::Forbidden(message),
            codes::NOT_FOUND => AppError::NotFound(message),
            codes::CONFLICT => AppError::Conflict(message),
            codes::EXPIRED => AppError::Expired(message),
            codes::PAYLOAD_TOO_LARGE => AppError::PayloadTooLarge(message),
            codes::UNAVAILABLE => AppError::Unavailable(message),
            _ => AppError::Storage(format!("remote code {}: {}", code, message)),
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn app_code(&self) -> i32 {
        app_error_static_metadata(self).2
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).3
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).4
    }

    fn is_sensitive(&self) -> bool {
        app_error_static_metadata(self).5
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).6
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::Storage(_) => "Failed to access storage".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::Forbidden(ref msg) => msg.clone(),
            AppError::QuotaExceeded {
                used,
                requested,
                limit,
            } => format!(
                "Storage quota exceeded: {} bytes used, {} requested, limit {}",
                used, requested, limit
            ),
            AppError::Expired(ref msg) => msg.clone(),
            AppError::Unavailable(_) => "No storage node is currently available".to_string(),
            AppError::Conflict(ref msg) => msg.clone(),
            AppError::Corrupt { .. } => {
                "Uploaded content does not match the declared hash".to_string()
            }
            AppError::PayloadTooLarge(ref msg) => msg.clone(),
            AppError::Unauthorized(ref msg) => msg.clone(),
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::InternalWithSource { .. } => "Internal server error".to_string(),
        }
    }
}
