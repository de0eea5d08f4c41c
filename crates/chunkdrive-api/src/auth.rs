//! Caller identity for control-plane routes.
//!
//! Authentication happens upstream; the gateway forwards the authenticated
//! account id in `X-User-Id`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chunkdrive_core::{AppError, OwnerId};

use crate::error::HttpAppError;

pub const USER_ID_HEADER: &str = "X-User-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerContext {
    pub owner_id: OwnerId,
}

impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = HttpAppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("Missing caller identity".to_string()))?;

        let owner_id = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<OwnerId>().ok())
            .filter(|id| *id > 0)
            .ok_or_else(|| AppError::Unauthorized("Invalid caller identity".to_string()))?;

        Ok(CallerContext { owner_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<CallerContext, HttpAppError> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CallerContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_caller_from_header() {
        assert_eq!(extract(Some("7")).await.unwrap().owner_id, 7);
    }

    #[tokio::test]
    async fn test_missing_or_bad_header_is_unauthorized() {
        for header in [None, Some("abc"), Some("0"), Some("-3")] {
            let HttpAppError(err) = extract(header).await.unwrap_err();
            assert!(matches!(err, AppError::Unauthorized(_)));
        }
    }
}
