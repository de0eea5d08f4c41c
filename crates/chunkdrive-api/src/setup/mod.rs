//! Application setup and initialization
//!
//! Everything between reading the configuration and serving requests:
//! metadata store, storage backend, services and background tasks, routes.

pub mod database;
pub mod routes;
pub mod server;
pub mod services;
pub mod storage;

use crate::state::AppState;
use anyhow::{Context, Result};
use chunkdrive_core::Config;
use std::sync::Arc;

pub use services::BackgroundTasks;

/// Initialize the entire application
pub async fn initialize_app(
    config: Config,
) -> Result<(Arc<AppState>, axum::Router, BackgroundTasks)> {
    // Validate configuration first - fail fast on misconfiguration
    config.validate().context("Configuration validation failed")?;

    chunkdrive_infra::init_telemetry(config.log_format())
        .context("Failed to initialize telemetry")?;

    tracing::info!(
        environment = %config.environment(),
        storage_backend = %config.storage_backend(),
        discovery_enabled = config.discovery_enabled(),
        "Configuration loaded and validated successfully"
    );

    let metadata = database::setup_metadata(&config).await?;
    let storage = storage::setup_storage(&config).await?;
    let coordinator = services::setup_coordinator(&config).await?;
    let (state, tasks) =
        services::initialize_services(&config, metadata, storage, coordinator).await?;
    let router = routes::setup_routes(&config, state.clone()).await?;

    Ok((state, router, tasks))
}
