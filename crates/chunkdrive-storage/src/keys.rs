//! Shared key validation and layout for storage backends.

use std::collections::BTreeSet;

use chunkdrive_core::models::{is_valid_content_id, PartInfo};
use uuid::Uuid;

use crate::traits::{StorageError, StorageResult};

pub const BLOB_PREFIX: &str = "blobs";
pub const STAGING_PREFIX: &str = "multipart";
pub const META_FILE: &str = "meta";

/// Reject anything that is not a plain content id.
pub fn validate_content_id(key: &str) -> StorageResult<()> {
    if key.contains("..") || key.starts_with('/') || !is_valid_content_id(key) {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Staging handles are UUIDs issued by `init_multipart`.
pub fn validate_handle(handle: &str) -> StorageResult<()> {
    Uuid::parse_str(handle)
        .map(|_| ())
        .map_err(|_| StorageError::InvalidKey("Malformed multipart handle".to_string()))
}

pub fn new_handle() -> String {
    Uuid::new_v4().to_string()
}

/// Sharded relative path used by the filesystem backend.
pub fn sharded_blob_key(content_id: &str) -> String {
    let shard: String = content_id.chars().take(2).collect();
    format!("{}/{}/{}", BLOB_PREFIX, shard, content_id)
}

/// Flat key used by the object-store backend.
pub fn flat_blob_key(content_id: &str) -> String {
    format!("{}/{}", BLOB_PREFIX, content_id)
}

pub fn staging_dir(handle: &str) -> String {
    format!("{}/{}", STAGING_PREFIX, handle)
}

/// Sorted, deduplicated part numbers. Part numbers start at 1.
pub fn ordered_part_numbers(parts: &[PartInfo]) -> StorageResult<Vec<u32>> {
    let numbers: BTreeSet<u32> = parts.iter().map(|p| p.part_number).collect();
    if numbers.contains(&0) {
        return Err(StorageError::InvalidKey(
            "Part numbers start at 1".to_string(),
        ));
    }
    if numbers.is_empty() {
        return Err(StorageError::InvalidKey(
            "At least one part is required".to_string(),
        ));
    }
    Ok(numbers.into_iter().collect())
}

pub fn check_part_number(part_number: u32) -> StorageResult<()> {
    if part_number == 0 {
        return Err(StorageError::InvalidKey(
            "Part numbers start at 1".to_string(),
        ));
    }
    Ok(())
}
