//! Registry Events
//!
//! Events emitted by the local registry so the status publisher and the
//! exporter can react to pool and replica changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the local registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// Pools and replicas were rebuilt from a host scan
    PoolsSynced { pool_count: u32, replica_count: u32 },

    /// A replica was added to its pool's accounting
    ReplicaRegistered {
        volume_name: String,
        pool_name: String,
        allocated_bytes: i64,
    },

    /// A replica was removed from its pool's accounting
    ReplicaDeregistered { volume_name: String, pool_name: String },

    /// A pool's counters changed
    PoolUpdated { pool_name: String },
}

impl RegistryEvent {
    /// Pool affected by the event, if a single one
    pub fn pool_name(&self) -> Option<&str> {
        match self {
            RegistryEvent::PoolsSynced { .. } => None,
            RegistryEvent::ReplicaRegistered { pool_name, .. }
            | RegistryEvent::ReplicaDeregistered { pool_name, .. }
            | RegistryEvent::PoolUpdated { pool_name } => Some(pool_name),
        }
    }

    /// Whether the event is about a replica
    pub fn is_replica_event(&self) -> bool {
        matches!(
            self,
            RegistryEvent::ReplicaRegistered { .. } | RegistryEvent::ReplicaDeregistered { .. }
        )
    }

    /// Volume name for replica events
    pub fn volume_name(&self) -> Option<&str> {
        match self {
            RegistryEvent::ReplicaRegistered { volume_name, .. }
            | RegistryEvent::ReplicaDeregistered { volume_name, .. } => Some(volume_name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_helpers() {
        let event = RegistryEvent::ReplicaRegistered {
            volume_name: "pvc-1".into(),
            pool_name: "LocalStorage_PoolHDD".into(),
            allocated_bytes: 1024,
        };
        assert!(event.is_replica_event());
        assert_eq!(event.pool_name(), Some("LocalStorage_PoolHDD"));
        assert_eq!(event.volume_name(), Some("pvc-1"));

        let event = RegistryEvent::PoolsSynced { pool_count: 4, replica_count: 0 };
        assert!(!event.is_replica_event());
        assert_eq!(event.pool_name(), None);
        assert_eq!(event.volume_name(), None);
    }
}
