//! Health check handlers.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Run an async check with timeout; returns status string "healthy", "timeout", or "{prefix}: {error}".
async fn run_check<F, E>(timeout: Duration, f: F, error_prefix: &str) -> String
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match tokio::time::timeout(timeout, f).await {
        Ok(Ok(())) => "healthy".to_string(),
        Ok(Err(e)) => format!("{}: {}", error_prefix, e),
        Err(_) => "timeout".to_string(),
    }
}

#[derive(serde::Serialize)]
pub(super) struct ReadinessResponse {
    pub status: String,
    pub metadata: String,
    pub storage: String,
}

/// Liveness probe - process is running.
pub async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "alive" })),
    )
}

/// Readiness probe - metadata store reachable and a storage backend usable.
///
/// A storage node probes its own backend; a pure control plane needs at least
/// one selectable node.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metadata = state.metadata.clone();
    let metadata_status = run_check(TIMEOUT, async move { metadata.ping().await }, "not_ready").await;

    let storage_status = match &state.node {
        Some(node) => {
            let storage = node.storage().clone();
            run_check(
                TIMEOUT,
                async move { storage.exists("health-check-probe").await.map(drop) },
                "not_ready",
            )
            .await
        }
        None => {
            let selector = state.selector.clone();
            run_check(TIMEOUT, async move { selector.select().await.map(drop) }, "not_ready").await
        }
    };

    let ready = metadata_status == "healthy" && storage_status == "healthy";
    if !ready {
        tracing::warn!(
            metadata = %metadata_status,
            storage = %storage_status,
            "Readiness check failed"
        );
    }

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            metadata: metadata_status,
            storage: storage_status,
        }),
    )
}
