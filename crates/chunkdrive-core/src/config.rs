//! Configuration module
//!
//! Settings for the storage node and the upload control plane, read from the
//! environment (after loading an optional `.env` file).

use std::env;

use crate::constants::{
    DEFAULT_LEASE_TTL_SECS, DEFAULT_QUOTA_BYTES, DEFAULT_SERVICE_NAME, DEFAULT_SESSION_TTL_SECS,
};
use crate::storage_types::StorageBackend;

// Common constants
const SERVER_PORT: u16 = 4000;
const MAX_CONNECTIONS: u32 = 10;
const UPLOAD_TOKEN_TTL_SECS: i64 = 3600;
const DOWNLOAD_TOKEN_TTL_SECS: i64 = 900;
const NODE_TOKEN_TTL_SECS: i64 = 300;
const STAGING_SWEEP_INTERVAL_SECS: u64 = 6 * 60 * 60;
const STAGING_GRACE_SECS: u64 = 900;
const CACHE_EXPIRY_SCAN_MS: u64 = 1000;
const DISCOVERY_TIMEOUT_SECS: u64 = 5;
const UPLOAD_MAX_SIZE_MB: usize = 100;
const MIN_TOKEN_SECRET_LEN: usize = 32;
const MIN_LEASE_TTL_SECS: u64 = 3;

/// Settings shared by every process.
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub environment: String,
    pub log_format: Option<String>,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub base: BaseConfig,
    // Storage
    pub storage_backend: StorageBackend,
    pub local_storage_path: String,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>, // MinIO and other S3-compatible providers
    /// Static fallback node used when discovery yields nothing.
    pub chunk_node_url: Option<String>,
    /// URL this process advertises as a storage node.
    pub public_url: Option<String>,
    // Tokens
    pub token_secret: String,
    pub upload_token_ttl_secs: i64,
    pub download_token_ttl_secs: i64,
    pub node_token_ttl_secs: i64,
    // Sessions and cleanup
    pub upload_session_ttl_secs: u64,
    pub staging_sweep_interval_secs: u64,
    pub staging_grace_secs: u64,
    pub cache_expiry_scan_ms: u64,
    // Discovery
    pub discovery_enabled: bool,
    pub discovery_service_name: String,
    pub discovery_lease_ttl_secs: u64,
    pub discovery_timeout_secs: u64,
    pub advertise_address: String,
    /// etcd cluster shared by every process taking part in discovery.
    pub etcd_endpoints: Vec<String>,
    /// Shared ephemeral store; single-process in-memory store when unset.
    pub redis_url: Option<String>,
    // Limits
    pub upload_max_size_mb: usize,
    pub default_quota_bytes: u64,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<AppConfig>);

impl Config {
    fn as_app(&self) -> &AppConfig {
        &self.0
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.as_app().base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        let config = AppConfig::from_lookup(|key| env::var(key).ok())?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.as_app().validate()
    }

    pub fn server_port(&self) -> u16 {
        self.as_app().base.server_port
    }

    pub fn environment(&self) -> &str {
        &self.as_app().base.environment
    }

    pub fn log_format(&self) -> Option<&str> {
        self.as_app().base.log_format.as_deref()
    }

    pub fn database_url(&self) -> Option<&str> {
        self.as_app().base.database_url.as_deref()
    }

    pub fn db_max_connections(&self) -> u32 {
        self.as_app().base.db_max_connections
    }

    pub fn storage_backend(&self) -> StorageBackend {
        self.as_app().storage_backend
    }

    pub fn local_storage_path(&self) -> &str {
        &self.as_app().local_storage_path
    }

    pub fn s3_bucket(&self) -> Option<&str> {
        self.as_app().s3_bucket.as_deref()
    }

    pub fn s3_region(&self) -> Option<&str> {
        self.as_app().s3_region.as_deref()
    }

    pub fn s3_endpoint(&self) -> Option<&str> {
        self.as_app().s3_endpoint.as_deref()
    }

    pub fn chunk_node_url(&self) -> Option<&str> {
        self.as_app().chunk_node_url.as_deref()
    }

    /// URL clients should use to reach this process, defaulting to the bound port.
    pub fn public_url(&self) -> String {
        self.as_app()
            .public_url
            .clone()
            .unwrap_or_else(|| {
                format!(
                    "http://{}:{}",
                    self.as_app().advertise_address,
                    self.server_port()
                )
            })
    }

    pub fn token_secret(&self) -> &str {
        &self.as_app().token_secret
    }

    pub fn upload_token_ttl_secs(&self) -> i64 {
        self.as_app().upload_token_ttl_secs
    }

    pub fn download_token_ttl_secs(&self) -> i64 {
        self.as_app().download_token_ttl_secs
    }

    pub fn node_token_ttl_secs(&self) -> i64 {
        self.as_app().node_token_ttl_secs
    }

    pub fn upload_session_ttl_secs(&self) -> u64 {
        self.as_app().upload_session_ttl_secs
    }

    pub fn staging_sweep_interval_secs(&self) -> u64 {
        self.as_app().staging_sweep_interval_secs
    }

    pub fn staging_grace_secs(&self) -> u64 {
        self.as_app().staging_grace_secs
    }

    pub fn cache_expiry_scan_ms(&self) -> u64 {
        self.as_app().cache_expiry_scan_ms
    }

    pub fn discovery_enabled(&self) -> bool {
        self.as_app().discovery_enabled
    }

    pub fn discovery_service_name(&self) -> &str {
        &self.as_app().discovery_service_name
    }

    pub fn discovery_lease_ttl_secs(&self) -> u64 {
        self.as_app().discovery_lease_ttl_secs
    }

    pub fn discovery_timeout_secs(&self) -> u64 {
        self.as_app().discovery_timeout_secs
    }

    pub fn advertise_address(&self) -> &str {
        &self.as_app().advertise_address
    }

    pub fn etcd_endpoints(&self) -> &[String] {
        &self.as_app().etcd_endpoints
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.as_app().redis_url.as_deref()
    }

    pub fn upload_max_size_bytes(&self) -> usize {
        self.as_app().upload_max_size_mb * 1024 * 1024
    }

    pub fn default_quota_bytes(&self) -> u64 {
        self.as_app().default_quota_bytes
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        _ => default,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl AppConfig {
    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT")
            .or_else(|| lookup("APP_ENV"))
            .unwrap_or_else(|| "development".to_string());

        let server_port = match lookup("PORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?,
            None => SERVER_PORT,
        };

        let base = BaseConfig {
            server_port,
            environment,
            log_format: non_empty(lookup("LOG_FORMAT")),
            database_url: non_empty(lookup("DATABASE_URL")),
            db_max_connections: parse_or(lookup("DB_MAX_CONNECTIONS"), MAX_CONNECTIONS),
        };

        let storage_backend = match non_empty(lookup("STORAGE_BACKEND")) {
            Some(raw) => raw.parse()?,
            None => StorageBackend::Local,
        };

        let advertise_address = non_empty(lookup("ADVERTISE_ADDRESS")).unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        });

        Ok(AppConfig {
            base,
            storage_backend,
            local_storage_path: non_empty(lookup("LOCAL_STORAGE_PATH"))
                .unwrap_or_else(|| "./data".to_string()),
            s3_bucket: non_empty(lookup("S3_BUCKET")),
            s3_region: non_empty(lookup("S3_REGION")).or_else(|| non_empty(lookup("AWS_REGION"))),
            s3_endpoint: non_empty(lookup("S3_ENDPOINT")),
            chunk_node_url: non_empty(lookup("CHUNK_NODE_URL")),
            public_url: non_empty(lookup("PUBLIC_URL")),
            token_secret: lookup("TOKEN_SECRET").unwrap_or_default(),
            upload_token_ttl_secs: parse_or(lookup("UPLOAD_TOKEN_TTL_SECS"), UPLOAD_TOKEN_TTL_SECS),
            download_token_ttl_secs: parse_or(
                lookup("DOWNLOAD_TOKEN_TTL_SECS"),
                DOWNLOAD_TOKEN_TTL_SECS,
            ),
            node_token_ttl_secs: parse_or(lookup("NODE_TOKEN_TTL_SECS"), NODE_TOKEN_TTL_SECS),
            upload_session_ttl_secs: parse_or(
                lookup("UPLOAD_SESSION_TTL_SECS"),
                DEFAULT_SESSION_TTL_SECS,
            ),
            staging_sweep_interval_secs: parse_or(
                lookup("STAGING_SWEEP_INTERVAL_SECS"),
                STAGING_SWEEP_INTERVAL_SECS,
            ),
            staging_grace_secs: parse_or(lookup("STAGING_GRACE_SECS"), STAGING_GRACE_SECS),
            cache_expiry_scan_ms: parse_or(lookup("CACHE_EXPIRY_SCAN_MS"), CACHE_EXPIRY_SCAN_MS),
            discovery_enabled: parse_bool(lookup("DISCOVERY_ENABLED"), false),
            discovery_service_name: non_empty(lookup("DISCOVERY_SERVICE_NAME"))
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            discovery_lease_ttl_secs: parse_or(
                lookup("DISCOVERY_LEASE_TTL_SECS"),
                DEFAULT_LEASE_TTL_SECS,
            ),
            discovery_timeout_secs: parse_or(
                lookup("DISCOVERY_TIMEOUT_SECS"),
                DISCOVERY_TIMEOUT_SECS,
            ),
            advertise_address,
            etcd_endpoints: parse_list(lookup("ETCD_ENDPOINTS")),
            redis_url: non_empty(lookup("REDIS_URL")),
            upload_max_size_mb: parse_or(lookup("UPLOAD_MAX_SIZE_MB"), UPLOAD_MAX_SIZE_MB),
            default_quota_bytes: parse_or(lookup("DEFAULT_QUOTA_BYTES"), DEFAULT_QUOTA_BYTES),
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.token_secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(anyhow::anyhow!(
                "TOKEN_SECRET must be at least {} characters long",
                MIN_TOKEN_SECRET_LEN
            ));
        }

        match self.storage_backend {
            StorageBackend::S3 => {
                if self.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_storage_path.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
            }
            StorageBackend::Remote => {
                if self.chunk_node_url.is_none() && !self.discovery_enabled {
                    return Err(anyhow::anyhow!(
                        "STORAGE_BACKEND=remote requires CHUNK_NODE_URL or DISCOVERY_ENABLED=true"
                    ));
                }
            }
        }

        // Nodes and control planes only meet through a shared coordinator.
        if self.discovery_enabled && self.etcd_endpoints.is_empty() {
            return Err(anyhow::anyhow!(
                "DISCOVERY_ENABLED=true requires ETCD_ENDPOINTS"
            ));
        }

        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(anyhow::anyhow!(
                    "REDIS_URL must be a redis:// or rediss:// connection string"
                ));
            }
        }

        if self.discovery_lease_ttl_secs < MIN_LEASE_TTL_SECS {
            return Err(anyhow::anyhow!(
                "DISCOVERY_LEASE_TTL_SECS must be at least {}",
                MIN_LEASE_TTL_SECS
            ));
        }

        if self.staging_sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "STAGING_SWEEP_INTERVAL_SECS must be greater than zero"
            ));
        }

        if let Some(url) = &self.base.database_url {
            if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        Ok(())
    }
}
