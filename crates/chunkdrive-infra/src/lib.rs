//! Chunkdrive Infrastructure Library
//!
//! Shared plumbing for chunkdrive binaries:
//! - Telemetry initialization (tracing subscriber, plain or JSON output)
//! - Request ID middleware

#[cfg(feature = "middleware")]
pub mod middleware;

#[cfg(feature = "observability-basic")]
pub mod telemetry;

// Re-export commonly used types
#[cfg(feature = "middleware")]
pub use middleware::{get_request_id, request_id_middleware, RequestId, REQUEST_ID_HEADER};

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry};
