//! HTTP surface of chunkdrive: control-plane upload routes and, when this
//! process owns a storage backend, the token-driven storage-node routes.

mod api_doc;
pub mod auth;
pub mod error;
mod handlers;
pub mod setup;
pub mod state;

pub use api_doc::get_openapi_spec;
pub use error::ErrorResponse;
