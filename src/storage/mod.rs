//! Local storage
//!
//! Pools, replica backends and the per-node registry that accounts for
//! them. Three backends share the [`ReplicaExecutor`] trait:
//!
//! - `lvm`: logical volumes in a `LocalStorage_Pool<Class>` volume group
//! - `disk`: whole disks exposed by hard links under the pool directory
//! - `ram`: tmpfs mounts under `/dev/LocalStorage_PoolRAM`

pub mod disk;
pub mod events;
pub mod executor;
pub mod lvm;
pub mod manager;
pub mod pools;
pub mod ram;
pub mod registry;
pub mod units;
pub mod validator;

pub use disk::DiskExecutor;
pub use events::RegistryEvent;
pub use executor::{ConsistencyReport, ReplicaExecutor};
pub use lvm::LvmExecutor;
pub use manager::ReplicaManager;
pub use pools::*;
pub use ram::RamExecutor;
pub use registry::LocalRegistry;
pub use units::*;
pub use validator::Validator;
