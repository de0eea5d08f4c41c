//! Chunkdrive Storage Library
//!
//! This crate provides the `Storage` trait (whole-object and multipart operations
//! over one physical medium) and its filesystem and object-store implementations.
//!
//! # Key layout
//!
//! Objects are addressed by content id (a hash). Backends lay them out as:
//!
//! - **Local**: `blobs/{id[0..2]}/{id}`, staging under `multipart/{handle}/`
//! - **Object store**: `blobs/{id}`, staging under `multipart/{handle}/{n}` plus `multipart/{handle}/meta`
//!
//! Content ids are limited to `[A-Za-z0-9._-]` and staging handles are UUIDs, so
//! no key can escape its prefix. Validation lives in the `keys` module.

pub(crate) mod digest;
pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use chunkdrive_core::StorageBackend;
pub use digest::sha256_hex;
pub use factory::create_storage;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{
    ByteReader, ByteStream, MultipartMeta, StagedUpload, Storage, StorageError, StorageResult,
    StoredObject,
};
