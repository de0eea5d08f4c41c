//! Storage-node discovery
//!
//! Nodes register under `/services/{name}/{instance_id}` with a lease they keep
//! renewing; a crashed node drops out when its lease lapses. The control plane
//! watches that prefix and keeps one client per live node. Production
//! processes meet through [`EtcdCoordinator`].

mod coordinator;
mod etcd;
#[cfg(any(test, feature = "test-support"))]
mod memory;
mod registry;
mod selector;

pub use coordinator::{Coordinator, CoordinatorError, LeaseId, WatchEvent, WatchStream};
pub use etcd::EtcdCoordinator;
#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryCoordinator;
pub use registry::{service_key, service_prefix, ServiceDiscovery, ServiceRegistry};
pub use selector::{ChunkNodePool, NodeClientSettings, SelectedNode, StaticSelector, StorageSelector};
