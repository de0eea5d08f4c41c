//! Chunkdrive Core Library
//!
//! This crate provides the domain models, error taxonomy, configuration and
//! capability tokens shared by every chunkdrive component.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod storage_types;
pub mod token;

// Re-export commonly used types
pub use config::{AppConfig, BaseConfig, Config};
pub use error::{AppError, AppResult, ErrorMetadata, LogLevel};
pub use models::{
    ApiEnvelope, BlobMeta, FileRecord, OwnerId, PartInfo, QuotaUsage, ServiceInfo, UploadSession,
};
pub use storage_types::StorageBackend;
pub use token::{ResourceClaims, TokenClaims, TokenOperation, TokenSigner};
