//! Pool naming and assembly
//!
//! Pool names form a closed set, one per disk class plus the virtual RAM
//! pool. The [`PoolManager`] rebuilds pools each tick from the disk
//! inventory and the per-kind executors and folds them into the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::executor::ReplicaExecutor;
use super::registry::LocalRegistry;
use crate::crd::{DiskClass, LocalDevice, VolumeKind};
use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

pub const POOL_NAME_PREFIX: &str = "LocalStorage_Pool";
pub const POOL_NAME_HDD: &str = "LocalStorage_PoolHDD";
pub const POOL_NAME_SSD: &str = "LocalStorage_PoolSSD";
pub const POOL_NAME_NVME: &str = "LocalStorage_PoolNVMe";
pub const POOL_NAME_RAM: &str = "LocalStorage_PoolRAM";

/// Volume slots in an LVM pool
pub const LVM_VOLUME_MAX_COUNT: i64 = 1000;

/// Volume slots in the RAM pool
pub const RAM_VOLUME_MAX_COUNT: i64 = 1000;

/// Pool that hosts disks of a class
pub fn pool_name_for_class(class: DiskClass) -> &'static str {
    match class {
        DiskClass::Hdd => POOL_NAME_HDD,
        DiskClass::Ssd => POOL_NAME_SSD,
        DiskClass::Nvme => POOL_NAME_NVME,
        DiskClass::Ram => POOL_NAME_RAM,
    }
}

/// Inverse of [`pool_name_for_class`]
pub fn class_for_pool_name(name: &str) -> Result<DiskClass> {
    match name {
        POOL_NAME_HDD => Ok(DiskClass::Hdd),
        POOL_NAME_SSD => Ok(DiskClass::Ssd),
        POOL_NAME_NVME => Ok(DiskClass::Nvme),
        POOL_NAME_RAM => Ok(DiskClass::Ram),
        other => Err(Error::InvalidSpec(format!("unknown pool {}", other))),
    }
}

pub fn is_pool_name(name: &str) -> bool {
    class_for_pool_name(name).is_ok()
}

// =============================================================================
// Pool Manager
// =============================================================================

/// Rebuilds pools from the disk inventory and the per-kind executors
pub struct PoolManager {
    registry: LocalRegistry,
    executors: Vec<Arc<dyn ReplicaExecutor>>,
    raw_disk_classes: BTreeSet<DiskClass>,
}

impl PoolManager {
    /// Disks of `raw_disk_classes` go to whole-disk pools, all others to LVM
    pub fn new(
        registry: LocalRegistry,
        executors: Vec<Arc<dyn ReplicaExecutor>>,
        raw_disk_classes: impl IntoIterator<Item = DiskClass>,
    ) -> Self {
        Self {
            registry,
            executors,
            raw_disk_classes: raw_disk_classes.into_iter().collect(),
        }
    }

    /// Disks an executor of `kind` may take into its pools
    fn route(&self, kind: VolumeKind, disks: &BTreeMap<String, LocalDevice>) -> Vec<LocalDevice> {
        disks
            .values()
            .filter(|d| d.class != DiskClass::Ram)
            .filter(|d| match kind {
                VolumeKind::Lvm => !self.raw_disk_classes.contains(&d.class),
                VolumeKind::Disk => self.raw_disk_classes.contains(&d.class),
                VolumeKind::Ram => false,
            })
            .cloned()
            .collect()
    }

    /// One reconcile tick: extend pools with new disks, then fold the
    /// host's pools and replicas into the registry.
    ///
    /// Returns whether any pool gained disks.
    pub async fn sync(&self, disks: &BTreeMap<String, LocalDevice>) -> Result<bool> {
        let mut expanded = false;
        for executor in &self.executors {
            let routed = self.route(executor.kind(), disks);
            if routed.is_empty() && executor.kind() != VolumeKind::Disk {
                continue;
            }
            if executor.extend_pools(&routed).await? {
                info!("Extended {} pools on node {}", executor.kind(), self.registry.node_name());
                expanded = true;
            }
        }

        let mut pools = BTreeMap::new();
        let mut replicas = BTreeMap::new();
        for executor in &self.executors {
            pools.extend(executor.pools_info().await?);
            replicas.extend(executor.get_replicas().await?);
        }
        debug!(
            "Pool sync found {} pools and {} replicas",
            pools.len(),
            replicas.len()
        );
        self.registry.sync_resources(pools, replicas);
        Ok(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_names() {
        for class in [DiskClass::Hdd, DiskClass::Ssd, DiskClass::Nvme, DiskClass::Ram] {
            let name = pool_name_for_class(class);
            assert!(name.starts_with(POOL_NAME_PREFIX));
            assert_eq!(class_for_pool_name(name).unwrap(), class);
        }
        assert!(!is_pool_name("LocalStorage_PoolTape"));
        assert!(!is_pool_name("vg0"));
    }

    use crate::crd::{DiskState, LocalPool, LocalVolumeReplica};
    use crate::storage::executor::ConsistencyReport;
    use crate::storage::registry::tests::{pool, replica};
    use crate::storage::units::GIB;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingExecutor {
        kind: VolumeKind,
        pool: &'static str,
        offered: Mutex<Vec<String>>,
    }

    impl RecordingExecutor {
        fn new(kind: VolumeKind, pool: &'static str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                pool,
                offered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReplicaExecutor for RecordingExecutor {
        fn kind(&self) -> VolumeKind {
            self.kind
        }
        async fn create_replica(&self, r: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
            Ok(r.clone())
        }
        async fn delete_replica(&self, _r: &LocalVolumeReplica) -> Result<()> {
            Ok(())
        }
        async fn expand_replica(&self, r: &LocalVolumeReplica, _n: i64) -> Result<LocalVolumeReplica> {
            Ok(r.clone())
        }
        async fn test_replica(&self, r: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
            Ok(r.clone())
        }
        async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>> {
            let mut out = BTreeMap::new();
            out.insert(format!("pvc-{}", self.kind), replica(&format!("pvc-{}", self.kind), self.pool, GIB));
            Ok(out)
        }
        async fn extend_pools(&self, disks: &[LocalDevice]) -> Result<bool> {
            let mut offered = self.offered.lock();
            offered.extend(disks.iter().map(|d| d.dev_path.clone()));
            Ok(!disks.is_empty())
        }
        async fn pools_info(&self) -> Result<BTreeMap<String, LocalPool>> {
            let mut out = BTreeMap::new();
            out.insert(self.pool.to_string(), pool(self.pool, 10 * GIB, 10));
            Ok(out)
        }
        async fn consistency_check(
            &self,
            _declared: &[LocalVolumeReplica],
            _registered: &BTreeMap<String, LocalVolumeReplica>,
        ) -> Result<ConsistencyReport> {
            Ok(ConsistencyReport::default())
        }
    }

    fn device(path: &str, class: DiskClass) -> (String, LocalDevice) {
        (
            path.to_string(),
            LocalDevice {
                dev_path: path.to_string(),
                class,
                capacity_bytes: GIB,
                state: DiskState::Available,
            },
        )
    }

    #[tokio::test]
    async fn test_sync_routes_disks_and_folds_registry() {
        let registry = LocalRegistry::new("n1");
        let lvm = RecordingExecutor::new(VolumeKind::Lvm, POOL_NAME_HDD);
        let raw = RecordingExecutor::new(VolumeKind::Disk, POOL_NAME_SSD);
        let manager = PoolManager::new(
            registry.clone(),
            vec![lvm.clone() as Arc<dyn ReplicaExecutor>, raw.clone()],
            [DiskClass::Ssd],
        );

        let disks: BTreeMap<_, _> = [
            device("/dev/sdb", DiskClass::Hdd),
            device("/dev/sdc", DiskClass::Ssd),
        ]
        .into_iter()
        .collect();

        assert!(manager.sync(&disks).await.unwrap());
        assert_eq!(*lvm.offered.lock(), vec!["/dev/sdb".to_string()]);
        assert_eq!(*raw.offered.lock(), vec!["/dev/sdc".to_string()]);

        let pools = registry.pools();
        assert!(pools.contains_key(POOL_NAME_HDD));
        assert!(pools.contains_key(POOL_NAME_SSD));
        assert_eq!(registry.replicas().len(), 2);
    }
}
