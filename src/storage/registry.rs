//! Local Registry
//!
//! The in-memory source of truth for one node: its disks, pools and
//! replicas. All mutations go through a single mutex so pool counters are
//! totally ordered; readers receive cloned snapshots and the lock is never
//! held across an await point.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::events::RegistryEvent;
use crate::crd::{LocalDevice, LocalPool, LocalVolumeReplica};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct RegistryState {
    disks: BTreeMap<String, LocalDevice>,
    pools: BTreeMap<String, LocalPool>,
    replicas: BTreeMap<String, LocalVolumeReplica>,
}

/// Per-node registry of disks, pools and replicas
#[derive(Clone)]
pub struct LocalRegistry {
    node_name: String,
    state: Arc<Mutex<RegistryState>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl LocalRegistry {
    /// Create an empty registry for a node
    pub fn new(node_name: impl Into<String>) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            node_name: node_name.into(),
            state: Arc::new(Mutex::new(RegistryState::default())),
            event_sender,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Replace pools and replicas with the result of a host scan.
    ///
    /// Disks are derived from pool membership.
    pub fn sync_resources(
        &self,
        pools: BTreeMap<String, LocalPool>,
        replicas: BTreeMap<String, LocalVolumeReplica>,
    ) {
        let disks = pools
            .values()
            .flat_map(|p| p.disks.iter())
            .map(|d| (d.dev_path.clone(), d.clone()))
            .collect();

        let (pool_count, replica_count) = (pools.len() as u32, replicas.len() as u32);
        {
            let mut state = self.state.lock();
            state.disks = disks;
            state.pools = pools;
            state.replicas = replicas;
        }

        debug!(
            "Registry synced: {} pools, {} replicas",
            pool_count, replica_count
        );
        let _ = self.event_sender.send(RegistryEvent::PoolsSynced {
            pool_count,
            replica_count,
        });
    }

    // =========================================================================
    // Replica Accounting
    // =========================================================================

    /// Add a replica to its pool's accounting.
    ///
    /// Re-registering with an unchanged allocation only refreshes the stored
    /// replica; a changed allocation is re-accounted.
    pub fn register_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let volume = replica.spec.volume_name.clone();
        let pool_name = replica.spec.pool_name.clone();
        let allocated = replica.allocated_capacity_bytes();

        {
            let mut state = self.state.lock();
            if !state.pools.contains_key(&pool_name) {
                return Err(Error::PoolNotFound { pool: pool_name });
            }

            if let Some(existing) = state.replicas.get(&volume).cloned() {
                if existing.spec.pool_name == pool_name
                    && existing.allocated_capacity_bytes() == allocated
                {
                    state.replicas.insert(volume, replica.clone());
                    return Ok(());
                }
                Self::release(&mut state, &existing);
            }

            if let Some(pool) = state.pools.get_mut(&pool_name) {
                pool.used_capacity_bytes += allocated;
                pool.free_capacity_bytes -= allocated;
                pool.used_volume_count += 1;
                pool.free_volume_count -= 1;
                if !pool.has_volume(&volume) {
                    pool.volumes.push(volume.clone());
                }
            }
            state.replicas.insert(volume.clone(), replica.clone());
        }

        let _ = self.event_sender.send(RegistryEvent::ReplicaRegistered {
            volume_name: volume,
            pool_name,
            allocated_bytes: allocated,
        });
        Ok(())
    }

    /// Remove a replica from its pool's accounting; exact inverse of
    /// [`register_replica`](Self::register_replica)
    pub fn deregister_replica(&self, volume_name: &str) -> Result<()> {
        let pool_name = {
            let mut state = self.state.lock();
            let existing = state
                .replicas
                .remove(volume_name)
                .ok_or_else(|| Error::ReplicaNotFound {
                    volume: volume_name.to_string(),
                })?;
            Self::release(&mut state, &existing);
            existing.spec.pool_name
        };

        let _ = self.event_sender.send(RegistryEvent::ReplicaDeregistered {
            volume_name: volume_name.to_string(),
            pool_name,
        });
        Ok(())
    }

    fn release(state: &mut RegistryState, replica: &LocalVolumeReplica) {
        let allocated = replica.allocated_capacity_bytes();
        if let Some(pool) = state.pools.get_mut(&replica.spec.pool_name) {
            pool.used_capacity_bytes -= allocated;
            pool.free_capacity_bytes += allocated;
            pool.used_volume_count -= 1;
            pool.free_volume_count += 1;
            pool.volumes.retain(|v| v != &replica.spec.volume_name);
        }
    }

    /// Replace a pool's record, e.g. after member disks were added
    pub fn update_pool(&self, pool: LocalPool) {
        let name = pool.name.clone();
        {
            let mut state = self.state.lock();
            for disk in &pool.disks {
                state.disks.insert(disk.dev_path.clone(), disk.clone());
            }
            state.pools.insert(name.clone(), pool);
        }
        let _ = self.event_sender.send(RegistryEvent::PoolUpdated { pool_name: name });
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn pools(&self) -> BTreeMap<String, LocalPool> {
        self.state.lock().pools.clone()
    }

    pub fn pool(&self, name: &str) -> Option<LocalPool> {
        self.state.lock().pools.get(name).cloned()
    }

    pub fn disks(&self) -> BTreeMap<String, LocalDevice> {
        self.state.lock().disks.clone()
    }

    pub fn replicas(&self) -> BTreeMap<String, LocalVolumeReplica> {
        self.state.lock().replicas.clone()
    }

    pub fn replica(&self, volume_name: &str) -> Option<LocalVolumeReplica> {
        self.state.lock().replicas.get(volume_name).cloned()
    }

    pub fn has_replica(&self, volume_name: &str) -> bool {
        self.state.lock().replicas.contains_key(volume_name)
    }
}
