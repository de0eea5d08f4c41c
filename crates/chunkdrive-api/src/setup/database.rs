//! Metadata store setup

use anyhow::{Context, Result};
use chunkdrive_core::Config;
use chunkdrive_db::{InMemoryMetadataStore, MetadataStore, PgMetadataStore};
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Connect to Postgres and run migrations, or fall back to the in-memory store
/// when no `DATABASE_URL` is configured.
pub async fn setup_metadata(config: &Config) -> Result<Arc<dyn MetadataStore>> {
    let Some(database_url) = config.database_url() else {
        tracing::warn!("DATABASE_URL not set, using in-memory metadata store (data is lost on restart)");
        return Ok(Arc::new(InMemoryMetadataStore::new(
            config.default_quota_bytes(),
        )));
    };

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections())
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections(),
        "Database connected successfully"
    );

    // Run pending migrations on startup (path: workspace migrations/ from crate root)
    let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .context("Failed to load migrations")?;
    migrator
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    Ok(Arc::new(PgMetadataStore::new(
        pool,
        config.default_quota_bytes(),
    )))
}
