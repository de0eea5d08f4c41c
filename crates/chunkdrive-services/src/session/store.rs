use chrono::Utc;
use chunkdrive_core::constants::{
    COMPLETION_BARRIER_PREFIX, COMPLETION_BARRIER_TTL_SECS, STAGING_REF_GRACE_SECS,
    STAGING_REF_PREFIX, UPLOAD_SESSION_PREFIX,
};
use chunkdrive_core::models::StagingRef;
use chunkdrive_core::{AppError, AppResult, OwnerId, UploadSession};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{get_json, put_json, EphemeralStore};

pub fn session_key(upload_id: &str) -> String {
    format!("{}{}", UPLOAD_SESSION_PREFIX, upload_id)
}

fn staging_key(upload_id: &str) -> String {
    format!("{}{}", STAGING_REF_PREFIX, upload_id)
}

fn barrier_key(upload_id: &str) -> String {
    format!("{}{}", COMPLETION_BARRIER_PREFIX, upload_id)
}

/// Fields of a session supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner_id: OwnerId,
    pub content_hash: String,
    pub size: u64,
    pub filename: String,
    pub total_parts: u32,
    pub staging: StagingRef,
}

/// TTL-bound upload sessions in the ephemeral cache.
///
/// Sessions are not renewed by activity. Next to each session a staging
/// reference is kept for an hour longer, so cleanup can still locate the
/// backend staging after the session itself has expired.
#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn create(&self, new: NewSession) -> AppResult<UploadSession> {
        let upload_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.ttl)
                .map_err(|e| AppError::Internal(format!("Invalid session TTL: {}", e)))?;

        let session = UploadSession {
            upload_id: upload_id.clone(),
            owner_id: new.owner_id,
            content_hash: new.content_hash,
            size: new.size,
            filename: new.filename,
            total_parts: new.total_parts,
            node_id: new.staging.node_id.clone(),
            backend_handle: new.staging.handle.clone(),
            created_at: now,
            expires_at,
        };

        put_json(
            self.cache.as_ref(),
            &staging_key(&upload_id),
            &new.staging,
            self.ttl + Duration::from_secs(STAGING_REF_GRACE_SECS),
        )
        .await?;
        put_json(self.cache.as_ref(), &session_key(&upload_id), &session, self.ttl).await?;

        tracing::info!(
            upload_id = %upload_id,
            owner_id = session.owner_id,
            node_id = %session.node_id,
            total_parts = session.total_parts,
            "Upload session created"
        );
        Ok(session)
    }

    pub async fn get(&self, upload_id: &str) -> AppResult<UploadSession> {
        get_json(self.cache.as_ref(), &session_key(upload_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))
    }

    /// False for unknown sessions as well as for other owners.
    pub async fn belongs_to(&self, upload_id: &str, owner_id: OwnerId) -> AppResult<bool> {
        let session: Option<UploadSession> =
            get_json(self.cache.as_ref(), &session_key(upload_id)).await?;
        Ok(session.is_some_and(|s| s.owner_id == owner_id))
    }

    /// Load the session for a mutation. Another owner's session is `Forbidden`.
    pub async fn require_owner(&self, upload_id: &str, owner_id: OwnerId) -> AppResult<UploadSession> {
        let session = self.get(upload_id).await?;
        if session.owner_id != owner_id {
            tracing::warn!(upload_id = %upload_id, owner_id, "Upload session accessed by non-owner");
            return Err(AppError::Forbidden(
                "Upload does not belong to the caller".to_string(),
            ));
        }
        Ok(session)
    }

    /// Remove the session and its staging reference.
    pub async fn delete(&self, upload_id: &str) -> AppResult<()> {
        self.cache.delete(&session_key(upload_id)).await?;
        self.cache.delete(&staging_key(upload_id)).await?;
        Ok(())
    }

    pub async fn staging_ref(&self, upload_id: &str) -> AppResult<Option<StagingRef>> {
        Ok(get_json(self.cache.as_ref(), &staging_key(upload_id)).await?)
    }

    pub async fn forget_staging(&self, upload_id: &str) -> AppResult<()> {
        self.cache.delete(&staging_key(upload_id)).await?;
        Ok(())
    }

    /// Take the completion barrier. Fails with `Conflict` while another completion runs.
    pub async fn begin_completion(&self, upload_id: &str) -> AppResult<()> {
        let acquired = self
            .cache
            .set_if_absent(
                &barrier_key(upload_id),
                Utc::now().to_rfc3339(),
                Duration::from_secs(COMPLETION_BARRIER_TTL_SECS),
            )
            .await?;
        if acquired {
            Ok(())
        } else {
            Err(AppError::Conflict(
                "Upload completion already in progress".to_string(),
            ))
        }
    }

    pub async fn end_completion(&self, upload_id: &str) -> AppResult<()> {
        self.cache.delete(&barrier_key(upload_id)).await?;
        Ok(())
    }

    pub async fn is_completing(&self, upload_id: &str) -> AppResult<bool> {
        Ok(self.cache.get(&barrier_key(upload_id)).await?.is_some())
    }

    /// `(node_id, handle)` of every live session.
    pub async fn live_handles(&self) -> AppResult<HashSet<(String, String)>> {
        let mut live = HashSet::new();
        for key in self.cache.keys(UPLOAD_SESSION_PREFIX).await? {
            if let Some(session) = get_json::<UploadSession>(self.cache.as_ref(), &key).await? {
                live.insert((session.node_id, session.backend_handle));
            }
        }
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEphemeralStore;

    fn new_session(owner_id: OwnerId) -> NewSession {
        NewSession {
            owner_id,
            content_hash: "abc123".into(),
            size: 30000,
            filename: "report.pdf".into(),
            total_parts: 2,
            staging: StagingRef {
                node_id: "local".into(),
                handle: "h-1".into(),
            },
        }
    }

    fn store(ttl: Duration) -> SessionStore {
        SessionStore::new(Arc::new(InMemoryEphemeralStore::new()), ttl)
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let sessions = store(Duration::from_secs(60));
        let session = sessions.create(new_session(7)).await.unwrap();

        let loaded = sessions.get(&session.upload_id).await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.backend_handle, "h-1");
        assert!(loaded.expires_at > loaded.created_at);

        sessions.delete(&session.upload_id).await.unwrap();
        assert!(matches!(
            sessions.get(&session.upload_id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(sessions.staging_ref(&session.upload_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let sessions = store(Duration::from_secs(60));
        let a = sessions.create(new_session(7)).await.unwrap();
        let b = sessions.create(new_session(7)).await.unwrap();
        assert_ne!(a.upload_id, b.upload_id);
    }

    #[tokio::test]
    async fn test_ownership() {
        let sessions = store(Duration::from_secs(60));
        let session = sessions.create(new_session(7)).await.unwrap();

        assert!(sessions.belongs_to(&session.upload_id, 7).await.unwrap());
        assert!(!sessions.belongs_to(&session.upload_id, 8).await.unwrap());
        assert!(!sessions.belongs_to("missing", 7).await.unwrap());
        assert!(matches!(
            sessions.require_owner(&session.upload_id, 8).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            sessions.require_owner("missing", 7).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_session_gone_but_staging_ref_kept() {
        let sessions = store(Duration::from_millis(40));
        let session = sessions.create(new_session(7)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(sessions.get(&session.upload_id).await.is_err());
        let staging = sessions.staging_ref(&session.upload_id).await.unwrap().unwrap();
        assert_eq!(staging.handle, "h-1");
    }

    #[tokio::test]
    async fn test_completion_barrier() {
        let sessions = store(Duration::from_secs(60));
        sessions.begin_completion("u1").await.unwrap();
        assert!(sessions.is_completing("u1").await.unwrap());
        assert!(matches!(
            sessions.begin_completion("u1").await,
            Err(AppError::Conflict(_))
        ));

        sessions.end_completion("u1").await.unwrap();
        sessions.begin_completion("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_live_handles() {
        let sessions = store(Duration::from_secs(60));
        sessions.create(new_session(7)).await.unwrap();

        let live = sessions.live_handles().await.unwrap();
        assert!(live.contains(&("local".to_string(), "h-1".to_string())));
        assert_eq!(live.len(), 1);
    }
}
