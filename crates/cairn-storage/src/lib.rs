//! cairn-storage: OpenDAL backends, content-addressed object store, snapshot records

pub mod health;
pub mod object_store;
pub mod operator;
pub mod records;
pub mod repo;

pub use health::{check_health, Health};
pub use object_store::{ObjectStore, PutOutcome, StoreStats, SweepStats};
pub use operator::{build_from_core_config, build_operator, memory_operator, BackendConfig};
pub use records::{SnapshotId, SnapshotLog};
pub use repo::{RepoDescriptor, Repository};
