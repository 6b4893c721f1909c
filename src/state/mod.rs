//! Entity storage and locking.
//!
//! This module holds the records reconciliation works on (services, hosts,
//! instances and expose maps), the store interface with its in-memory
//! implementation, and the per-service lock manager.

mod expose;
mod lock;
mod memory;
mod store;
mod types;

pub use expose::ExposeMapDao;
pub use lock::{generate_holder_id, LockInfo, LockManager, ServicesLock};
pub use memory::{MemoryStore, Snapshot};
pub use store::ObjectStore;
pub use types::{
    ExposeMapState, HealthCheckSpec, HealthState, Host, HostState, Instance, InstanceState, LaunchConfig,
    Service, ServiceExposeMap, ServiceState,
};
