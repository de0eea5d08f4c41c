//! Metadata store for the content index
//!
//! Blob rows (one per distinct hash), file references and per-owner quota. The
//! Postgres implementation is used in deployments; the in-memory one backs
//! tests and single-process setups without a database.

pub mod metadata;

pub use metadata::{InMemoryMetadataStore, MetadataStore, PgMetadataStore};
