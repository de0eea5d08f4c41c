//! Chunkdrive Services Layer
//!
//! Orchestration on top of storage and metadata: the ephemeral cache, upload
//! sessions and their cleanup, capability token issuance, storage-node
//! discovery, the content index and the control-plane [`UploadService`].
//! HTTP handling stays in `chunkdrive-api`.

pub mod cache;
pub mod cas;
pub mod discovery;
pub mod node;
pub mod session;
pub mod tokens;
pub mod upload;

pub use cache::{CacheError, EphemeralStore, InMemoryEphemeralStore, RedisEphemeralStore};
pub use cas::ContentIndex;
#[cfg(any(test, feature = "test-support"))]
pub use discovery::InMemoryCoordinator;
pub use discovery::{
    ChunkNodePool, Coordinator, CoordinatorError, EtcdCoordinator, NodeClientSettings,
    SelectedNode, ServiceDiscovery, ServiceRegistry, StaticSelector, StorageSelector,
};
pub use node::StorageNode;
pub use session::{SessionStore, UploadReaper};
pub use tokens::TokenService;
pub use upload::{UploadService, UploadSettings};
