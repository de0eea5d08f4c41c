//! Ephemeral key/value cache with per-key TTL and expiry notifications.
//!
//! Sessions, staging references, completion barriers and opaque tokens live
//! here. Values are JSON strings; [`put_json`] and [`get_json`] do the encoding.
//! [`RedisEphemeralStore`] is shared across processes; [`InMemoryEphemeralStore`]
//! serves a single process.

mod memory;
mod redis;

pub use memory::InMemoryEphemeralStore;
pub use self::redis::RedisEphemeralStore;

use async_trait::async_trait;
use chunkdrive_core::AppError;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache value encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Unavailable(msg) => AppError::Unavailable(msg),
            CacheError::Serialization(e) => {
                AppError::Internal(format!("Corrupt cache value: {}", e))
            }
        }
    }
}

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Store only when the key is absent (or expired). Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration)
        -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Keys removed because their TTL elapsed. Explicit deletes are not published.
    fn subscribe_expired(&self) -> broadcast::Receiver<String>;
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn EphemeralStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    store.set(key, serde_json::to_string(value)?, ttl).await
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn EphemeralStore,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}
