//! Application state shared by every handler.

use chunkdrive_db::MetadataStore;
use chunkdrive_services::{StorageNode, StorageSelector, UploadService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Present when this process serves a storage backend of its own.
    pub node: Option<StorageNode>,
    pub uploads: Arc<UploadService>,
    pub metadata: Arc<dyn MetadataStore>,
    pub selector: Arc<dyn StorageSelector>,
}

impl AppState {
    pub fn new(
        node: Option<StorageNode>,
        uploads: Arc<UploadService>,
        metadata: Arc<dyn MetadataStore>,
        selector: Arc<dyn StorageSelector>,
    ) -> Self {
        Self {
            node,
            uploads,
            metadata,
            selector,
        }
    }
}
