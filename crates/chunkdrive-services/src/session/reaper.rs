use chrono::Utc;
use chunkdrive_core::constants::UPLOAD_SESSION_PREFIX;
use chunkdrive_core::AppResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::store::SessionStore;
use crate::cache::EphemeralStore;
use crate::discovery::StorageSelector;

/// Removes backend staging for sessions that expired without completing.
///
/// Two paths run side by side: a listener on cache expiry notifications and a
/// periodic sweep that compares staging on every node with live sessions. The
/// sweep catches whatever the listener missed.
pub struct UploadReaper {
    sessions: SessionStore,
    cache: Arc<dyn EphemeralStore>,
    selector: Arc<dyn StorageSelector>,
    sweep_interval: Duration,
    grace: Duration,
}

impl UploadReaper {
    pub fn new(
        sessions: SessionStore,
        cache: Arc<dyn EphemeralStore>,
        selector: Arc<dyn StorageSelector>,
        sweep_interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            sessions,
            cache,
            selector,
            sweep_interval,
            grace,
        }
    }

    pub fn start_listener(self: Arc<Self>) -> JoinHandle<()> {
        let mut expired = self.cache.subscribe_expired();
        tokio::spawn(async move {
            loop {
                match expired.recv().await {
                    Ok(key) => {
                        let Some(upload_id) = key.strip_prefix(UPLOAD_SESSION_PREFIX) else {
                            continue;
                        };
                        if let Err(e) = self.reap_expired(upload_id).await {
                            tracing::warn!(
                                error = %e,
                                upload_id = %upload_id,
                                "Failed to clean up expired upload, leaving it to the sweep"
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Expiry notifications dropped, relying on sweep");
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Expiry notification channel closed");
                        break;
                    }
                }
            }
        })
    }

    /// Abort staging for one expired session. Safe when staging is already gone.
    #[tracing::instrument(skip(self))]
    pub async fn reap_expired(&self, upload_id: &str) -> AppResult<()> {
        let Some(staging) = self.sessions.staging_ref(upload_id).await? else {
            tracing::debug!("No staging reference for expired upload");
            return Ok(());
        };

        let node = self.selector.get(&staging.node_id).await?;
        node.storage.abort_multipart(&staging.handle).await?;
        self.sessions.forget_staging(upload_id).await?;

        tracing::info!(
            node_id = %staging.node_id,
            handle = %staging.handle,
            "Staging removed for expired upload"
        );
        Ok(())
    }

    pub fn start_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.sweep_interval);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                tracing::info!("Starting scheduled staging sweep");
                match self.sweep_orphans().await {
                    Ok(removed) => tracing::info!(removed, "Staging sweep completed"),
                    Err(e) => tracing::error!(error = %e, "Staging sweep failed"),
                }
            }
        })
    }

    /// Abort staging areas older than the grace period that no live session references.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "staging_sweep"))]
    pub async fn sweep_orphans(&self) -> AppResult<usize> {
        let live = self.sessions.live_handles().await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = 0;

        for node in self.selector.nodes().await {
            let staged = match node.storage.list_multipart_uploads().await {
                Ok(staged) => staged,
                Err(e) => {
                    tracing::error!(error = %e, node_id = %node.node_id, "Failed to list staging");
                    continue;
                }
            };

            for upload in staged {
                if upload.created_at > cutoff
                    || live.contains(&(node.node_id.clone(), upload.handle.clone()))
                {
                    continue;
                }

                match node.storage.abort_multipart(&upload.handle).await {
                    Ok(()) => {
                        removed += 1;
                        tracing::info!(
                            node_id = %node.node_id,
                            handle = %upload.handle,
                            created_at = %upload.created_at,
                            "Orphaned staging removed"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            node_id = %node.node_id,
                            handle = %upload.handle,
                            "Failed to remove orphaned staging"
                        );
                    }
                }
            }
        }

        Ok(removed)
    }
}
