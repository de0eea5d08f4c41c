use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Identifier of the account that owns files and pays quota.
pub type OwnerId = i64;

/// One distinct piece of content, shared by every file that references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BlobMeta {
    pub hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// A file reference to a blob, owned by one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Storage usage of one owner. Every file reference is charged its full size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QuotaUsage {
    pub owner_id: OwnerId,
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl QuotaUsage {
    pub fn remaining(&self) -> u64 {
        self.limit_bytes.saturating_sub(self.used_bytes)
    }

    pub fn allows(&self, size: u64) -> bool {
        self.used_bytes
            .checked_add(size)
            .map(|total| total <= self.limit_bytes)
            .unwrap_or(false)
    }
}
