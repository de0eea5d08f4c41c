//! Capability token issuance and verification with cache-backed extras.
//!
//! Signed tokens are verified statelessly. Opaque tokens are random strings
//! whose grant lives in the ephemeral cache, for short server-to-server calls.
//! Either kind can be revoked before it expires.

use chrono::Utc;
use chunkdrive_core::constants::{OPAQUE_TOKEN_PREFIX, REVOKED_TOKEN_PREFIX};
use chunkdrive_core::{AppError, AppResult, ResourceClaims, TokenOperation, TokenSigner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{get_json, put_json, EphemeralStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpaqueGrant {
    op: TokenOperation,
    res: ResourceClaims,
}

fn opaque_key(token: &str) -> String {
    format!("{}{}", OPAQUE_TOKEN_PREFIX, token)
}

fn revoked_key(jti: &str) -> String {
    format!("{}{}", REVOKED_TOKEN_PREFIX, jti)
}

/// Signed JWTs always contain two dots; opaque tokens are plain hex.
fn is_opaque(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Clone)]
pub struct TokenService {
    signer: TokenSigner,
    cache: Arc<dyn EphemeralStore>,
    opaque_ttl: Duration,
}

impl TokenService {
    pub fn new(signer: TokenSigner, cache: Arc<dyn EphemeralStore>, opaque_ttl: Duration) -> Self {
        Self {
            signer,
            cache,
            opaque_ttl,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn issue(
        &self,
        op: TokenOperation,
        claims: ResourceClaims,
        ttl_secs: i64,
    ) -> AppResult<String> {
        self.signer.issue(op, claims, ttl_secs)
    }

    /// Issue a random 32-byte token whose grant is held in the cache.
    pub async fn issue_opaque(
        &self,
        op: TokenOperation,
        claims: ResourceClaims,
    ) -> AppResult<String> {
        let token = hex::encode(rand::random::<[u8; 32]>());
        let grant = OpaqueGrant { op, res: claims };
        put_json(self.cache.as_ref(), &opaque_key(&token), &grant, self.opaque_ttl).await?;
        Ok(token)
    }

    /// Verify either kind of token and return the resource it grants.
    pub async fn verify(
        &self,
        token: &str,
        expected: TokenOperation,
    ) -> AppResult<ResourceClaims> {
        if is_opaque(token) {
            let grant: OpaqueGrant = get_json(self.cache.as_ref(), &opaque_key(token))
                .await?
                .ok_or_else(|| AppError::Unauthorized("Invalid capability token".to_string()))?;
            if grant.op != expected {
                return Err(AppError::Forbidden(format!(
                    "Token is not valid for operation '{}'",
                    expected
                )));
            }
            return Ok(grant.res);
        }

        let claims = self.signer.verify(token, expected)?;

        match self.cache.get(&revoked_key(&claims.jti)).await {
            Ok(Some(_)) => {
                return Err(AppError::Unauthorized(
                    "Token has been revoked".to_string(),
                ))
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Revocation check skipped, cache unavailable");
            }
        }

        Ok(claims.res)
    }

    /// Invalidate a token before its expiry. Expired tokens need no action.
    pub async fn revoke(&self, token: &str) -> AppResult<()> {
        if is_opaque(token) {
            self.cache.delete(&opaque_key(token)).await?;
            return Ok(());
        }

        let claims = match self.signer.decode(token) {
            Ok(claims) => claims,
            Err(AppError::Expired(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let remaining = (claims.exp - Utc::now().timestamp()).max(1) as u64;
        self.cache
            .set(
                &revoked_key(&claims.jti),
                claims.op.as_str().to_string(),
                Duration::from_secs(remaining),
            )
            .await?;

        tracing::info!(jti = %claims.jti, op = %claims.op, "Capability token revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEphemeralStore;

    fn service() -> TokenService {
        TokenService::new(
            TokenSigner::new("test-secret-that-is-long-enough-123456"),
            Arc::new(InMemoryEphemeralStore::new()),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_signed_token_round_trip_and_revoke() {
        let tokens = service();
        let token = tokens
            .issue(TokenOperation::Download, ResourceClaims::for_content("abc123"), 60)
            .unwrap();

        let claims = tokens.verify(&token, TokenOperation::Download).await.unwrap();
        assert_eq!(claims.content_id.as_deref(), Some("abc123"));

        tokens.revoke(&token).await.unwrap();
        assert!(matches!(
            tokens.verify(&token, TokenOperation::Download).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_opaque_token_scoping_and_revoke() {
        let tokens = service();
        let token = tokens
            .issue_opaque(TokenOperation::Abort, ResourceClaims::for_upload("h-1"))
            .await
            .unwrap();
        assert_eq!(token.len(), 64);

        let claims = tokens.verify(&token, TokenOperation::Abort).await.unwrap();
        assert_eq!(claims.upload_id.as_deref(), Some("h-1"));
        assert!(matches!(
            tokens.verify(&token, TokenOperation::Upload).await,
            Err(AppError::Forbidden(_))
        ));

        tokens.revoke(&token).await.unwrap();
        assert!(matches!(
            tokens.verify(&token, TokenOperation::Abort).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_opaque_token_rejected() {
        let tokens = service();
        let err = tokens
            .verify(&"ab".repeat(32), TokenOperation::Upload)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_revoking_expired_token_is_noop() {
        let tokens = service();
        let token = tokens
            .issue(TokenOperation::Upload, ResourceClaims::for_content("h"), -10)
            .unwrap();
        tokens.revoke(&token).await.unwrap();
    }
}
