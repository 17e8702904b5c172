//! Controllers
//!
//! The per-node replica reconciler and node agent, plus the cluster-scoped
//! collaborators (disk claims, disk actions, eviction) and the lease that
//! gates the latter. All of them reach the API server through
//! [`ObjectStore`] and process keys from a [`TaskQueue`].

pub mod disk_action;
pub mod disk_claim;
pub mod evictor;
pub mod leader;
pub mod node;
pub mod queue;
pub mod replica;
pub mod store;

#[cfg(test)]
pub mod memory;
#[cfg(test)]
pub mod testing;

pub use disk_action::DiskActionController;
pub use disk_claim::DiskClaimBinder;
pub use evictor::Evictor;
pub use leader::{LeaderConfig, LeaderElector};
pub use node::{NodeAgent, NodeAgentConfig, NodeStatusPublisher};
pub use queue::TaskQueue;
pub use replica::ReplicaReconciler;
pub use store::{KubeStore, ObjectStore};
