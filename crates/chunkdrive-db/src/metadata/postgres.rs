use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chunkdrive_core::{AppError, BlobMeta, FileRecord, OwnerId, QuotaUsage};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::MetadataStore;

/// Repository for the blob index, file references and quotas
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
    default_limit: u64,
}

fn to_db(value: u64) -> Result<i64, AppError> {
    i64::try_from(value).map_err(|_| AppError::InvalidInput(format!("Size {} is too large", value)))
}

fn from_db(value: i64) -> u64 {
    value.max(0) as u64
}

impl PgMetadataStore {
    pub fn new(pool: PgPool, default_limit: u64) -> Self {
        Self {
            pool,
            default_limit,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn find_blob(&self, hash: &str) -> Result<Option<BlobMeta>, AppError> {
        // Use dynamic SQLx queries to avoid requiring DATABASE_URL/sqlx prepare
        let row = sqlx::query(
            r#"
            SELECT hash, size, created_at
            FROM blobs
            WHERE hash = $1
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| BlobMeta {
            hash: r.get("hash"),
            size: from_db(r.get("size")),
            created_at: r.get("created_at"),
        }))
    }

    async fn insert_blob_if_absent(&self, hash: &str, size: u64) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO blobs (hash, size)
            VALUES ($1, $2)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(hash)
        .bind(to_db(size)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn quota(&self, owner_id: OwnerId) -> Result<QuotaUsage, AppError> {
        let row = sqlx::query(
            r#"
            SELECT used_bytes, limit_bytes
            FROM quotas
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => QuotaUsage {
                owner_id,
                used_bytes: from_db(r.get("used_bytes")),
                limit_bytes: from_db(r.get("limit_bytes")),
            },
            None => QuotaUsage {
                owner_id,
                used_bytes: 0,
                limit_bytes: self.default_limit,
            },
        })
    }

    async fn owner_has_blob(&self, owner_id: OwnerId, hash: &str) -> Result<bool, AppError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM files WHERE owner_id = $1 AND hash = $2
            ) AS present
            "#,
        )
        .bind(owner_id)
        .bind(hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("present"))
    }

    async fn list_files(&self, owner_id: OwnerId) -> Result<Vec<FileRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, hash, name, size, created_at
            FROM files
            WHERE owner_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| FileRecord {
                id: r.get("id"),
                owner_id: r.get("owner_id"),
                hash: r.get("hash"),
                name: r.get("name"),
                size: from_db(r.get("size")),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn commit_file(
        &self,
        owner_id: OwnerId,
        hash: &str,
        size: u64,
        name: &str,
    ) -> Result<FileRecord, AppError> {
        let size_db = to_db(size)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO quotas (owner_id, used_bytes, limit_bytes)
            VALUES ($1, 0, $2)
            ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(to_db(self.default_limit)?)
        .execute(&mut *tx)
        .await?;

        // Row lock serializes concurrent commits for the same owner
        let quota = sqlx::query(
            r#"
            SELECT used_bytes, limit_bytes
            FROM quotas
            WHERE owner_id = $1
            FOR UPDATE
            "#,
        )
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;

        let usage = QuotaUsage {
            owner_id,
            used_bytes: from_db(quota.get("used_bytes")),
            limit_bytes: from_db(quota.get("limit_bytes")),
        };
        if !usage.allows(size) {
            tx.rollback().await?;
            return Err(AppError::QuotaExceeded {
                used: usage.used_bytes,
                requested: size,
                limit: usage.limit_bytes,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO blobs (hash, size)
            VALUES ($1, $2)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(hash)
        .bind(size_db)
        .execute(&mut *tx)
        .await?;

        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO files (id, owner_id, hash, name, size)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(hash)
        .bind(name)
        .bind(size_db)
        .fetch_one(&mut *tx)
        .await?;
        let created_at: DateTime<Utc> = row.get("created_at");

        sqlx::query(
            r#"
            UPDATE quotas
            SET used_bytes = used_bytes + $2
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .bind(size_db)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            owner_id = owner_id,
            hash = %hash,
            size_bytes = size,
            file_id = %id,
            "File reference committed"
        );

        Ok(FileRecord {
            id,
            owner_id,
            hash: hash.to_string(),
            name: name.to_string(),
            size,
            created_at,
        })
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
