//! Shared constants: cache key prefixes and default lifetimes.

/// Session record: `upload:{upload_id}`.
pub const UPLOAD_SESSION_PREFIX: &str = "upload:";
/// Node id and backend handle for a session, outlives the session record.
pub const STAGING_REF_PREFIX: &str = "staging:upload:";
/// Completion barrier: `complete:upload:{upload_id}`.
pub const COMPLETION_BARRIER_PREFIX: &str = "complete:upload:";
/// Direct (single request) upload intent: `pending_upload:{file_id}`.
pub const PENDING_UPLOAD_PREFIX: &str = "pending_upload:";
/// Opaque capability token: `chunk:token:{token}`.
pub const OPAQUE_TOKEN_PREFIX: &str = "chunk:token:";
/// Revoked signed token id: `chunk:revoked:{jti}`.
pub const REVOKED_TOKEN_PREFIX: &str = "chunk:revoked:";

/// Registry key prefix: `/services/{name}/{instance_id}`.
pub const SERVICE_KEY_PREFIX: &str = "/services/";

pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
/// Extra lifetime of the staging reference past the session record.
pub const STAGING_REF_GRACE_SECS: u64 = 60 * 60;
pub const COMPLETION_BARRIER_TTL_SECS: u64 = 10 * 60;
pub const PENDING_UPLOAD_TTL_SECS: u64 = 24 * 60 * 60;
pub const OPAQUE_TOKEN_TTL_SECS: u64 = 5 * 60;

pub const DEFAULT_LEASE_TTL_SECS: u64 = 15;
pub const DEFAULT_SERVICE_NAME: &str = "chunkdrive-node";

/// Node id used when the control plane talks to an in-process backend.
pub const LOCAL_NODE_ID: &str = "local";
/// Node id used for the statically configured fallback node.
pub const STATIC_NODE_ID: &str = "static";

pub const DEFAULT_QUOTA_BYTES: u64 = 10 * 1024 * 1024 * 1024;
