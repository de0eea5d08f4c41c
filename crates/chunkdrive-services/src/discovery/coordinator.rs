use async_trait::async_trait;
use chunkdrive_core::AppError;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

pub type LeaseId = i64;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The lease expired or was revoked; renewals will never succeed again.
    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("Coordinator request timed out")]
    Timeout,

    #[error("Coordinator unavailable: {0}")]
    Unavailable(String),
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        AppError::Unavailable(err.to_string())
    }
}

/// Change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
    /// Events were dropped; the watcher must re-read the prefix.
    Resync,
}

/// Ends when the underlying watch is lost; callers re-read and re-subscribe.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Lease-based key/value coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinatorError>;

    /// Push the lease deadline out by its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinatorError>;

    /// Drop the lease and every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError>;

    async fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordinatorError>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordinatorError>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordinatorError>;
}
