//! Data models for the upload subsystem
//!
//! Each sub-module covers one feature area; everything is re-exported here.

mod blob;
mod envelope;
mod node;
mod upload;
pub mod wire;

pub use blob::*;
pub use envelope::*;
pub use node::*;
pub use upload::*;
