//! Route configuration and setup.
//!
//! Storage-node routes are mounted at the root when this process serves a
//! backend; control-plane routes live under `/api`. Health checks are in
//! [health](health).

mod health;

use crate::handlers;
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use chunkdrive_core::Config;
use chunkdrive_infra::request_id_middleware;
use chunkdrive_services::StorageNode;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Setup all application routes
pub async fn setup_routes(
    config: &Config,
    state: Arc<AppState>,
) -> Result<Router<()>, anyhow::Error> {
    tracing::info!(
        body_limit_bytes = config.upload_max_size_bytes(),
        node_routes = state.node.is_some(),
        "Configuring routes"
    );
    Ok(build_router(state, config.upload_max_size_bytes()))
}

/// Assemble the router over an already wired state.
pub fn build_router(state: Arc<AppState>, body_limit: usize) -> Router<()> {
    let mut app = control_plane_routes().merge(public_routes());
    if let Some(node) = state.node.clone() {
        app = app.merge(node_routes(node));
    }

    app.layer(RequestBodyLimitLayer::new(body_limit))
        .layer(DefaultBodyLimit::disable())
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health/live", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
        .route(
            "/api/openapi.json",
            get(|| async { Json(crate::api_doc::get_openapi_spec()) }),
        )
}

fn control_plane_routes() -> Router<Arc<AppState>> {
    use handlers::uploads;

    Router::new()
        .route("/api/files/multipart/init", post(uploads::init_multipart))
        .route("/api/files/multipart/upload", post(uploads::upload_part))
        .route("/api/files/multipart/status", get(uploads::upload_status))
        .route(
            "/api/files/multipart/complete",
            post(uploads::complete_multipart),
        )
        .route(
            "/api/files/multipart/refresh-token",
            post(uploads::refresh_token),
        )
        .route("/api/files/upload-url", post(uploads::upload_url))
        .route("/api/files/upload-complete", post(uploads::upload_complete))
        .route(
            "/api/files/download-url/{hash}",
            get(uploads::download_url),
        )
        .route("/api/quota", get(uploads::quota))
}

/// Storage-node surface, driven by capability tokens only.
fn node_routes(node: StorageNode) -> Router<Arc<AppState>> {
    use handlers::node as h;

    Router::new()
        .route("/upload", post(h::upload))
        .route("/download", get(h::download))
        .route("/delete", post(h::delete))
        .route("/exists", get(h::exists))
        .route("/multipart/init", post(h::init_multipart))
        .route("/multipart/upload", post(h::upload_part))
        .route("/multipart/complete", post(h::complete_multipart))
        .route("/multipart/parts", get(h::list_parts))
        .route("/multipart/abort", post(h::abort_multipart))
        .route("/multipart/uploads", get(h::list_uploads))
        .with_state(node)
}
