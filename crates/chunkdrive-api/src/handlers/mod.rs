//! HTTP handlers.
//!
//! `node` serves the storage-node surface, `uploads` the control plane.

mod form;
pub mod node;
pub mod uploads;
