//! Node agent
//!
//! Periodic per-node work that is not driven by a replica event: disk
//! inventory, pool extension, registry sync, node status and the
//! consistency check between the host, the registry and the declared
//! replicas.

use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::ObjectStore;
use crate::crd::{
    storage_condition, DiskState, LocalDevice, LocalDisk, LocalDiskSpec, LocalDiskStatus,
    NodeState, StorageNodeCondition,
};
use crate::error::Result;
use crate::ha::DrbdConfigurator;
use crate::hardware::discovery::{grown_disks, DiskInventory};
use crate::hardware::health::object_name;
use crate::storage::{ConsistencyReport, LocalRegistry, LvmExecutor, PoolManager, ReplicaManager};

// =============================================================================
// Node status publisher
// =============================================================================

/// Writes registry pools and conditions into the LocalStorageNode status
pub struct NodeStatusPublisher {
    node_name: String,
    store: Arc<dyn ObjectStore>,
    registry: LocalRegistry,
}

impl NodeStatusPublisher {
    pub fn new(node_name: impl Into<String>, store: Arc<dyn ObjectStore>, registry: LocalRegistry) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            registry,
        }
    }

    /// Publish `{state: Ready, pools}` and optionally upsert a condition.
    ///
    /// A missing LocalStorageNode is skipped; the cluster controller
    /// creates it.
    pub async fn publish(&self, condition: Option<StorageNodeCondition>) -> Result<()> {
        let Some(mut node) = self.store.get_node(&self.node_name).await? else {
            debug!("LocalStorageNode {} not found, skipping status", self.node_name);
            return Ok(());
        };
        let pools = self.registry.pools();
        let status = node.status.get_or_insert_with(Default::default);
        let unchanged = status.state == Some(NodeState::Ready)
            && status.pools == pools
            && condition.is_none();
        if unchanged {
            return Ok(());
        }
        status.state = Some(NodeState::Ready);
        status.pools = pools;
        if let Some(condition) = condition {
            status.set_condition(condition);
        }
        self.store.update_node_status(&node).await?;
        debug!("Published status of node {}", self.node_name);
        Ok(())
    }
}

// =============================================================================
// Local disks
// =============================================================================

/// LocalDisk name of a scanned device: `<node>-<kernel name>`
pub fn local_disk_name(node: &str, dev_path: &str) -> String {
    let base = dev_path.rsplit('/').next().unwrap_or(dev_path);
    object_name(&format!("{}-{}", node, base))
}

/// Scanned disks a claim bound to `node` that are not reserved.
///
/// Only these may be taken into pools; anything else on the host is left
/// alone even when it looks blank.
pub fn pool_candidates(
    node: &str,
    disks: &BTreeMap<String, LocalDevice>,
    local_disks: &[LocalDisk],
) -> BTreeMap<String, LocalDevice> {
    let bound: BTreeSet<&str> = local_disks
        .iter()
        .filter(|d| d.spec.node_name == node && !d.spec.reserved && d.spec.claim_ref.is_some())
        .map(|d| d.spec.device_path.as_str())
        .collect();
    disks
        .iter()
        .filter(|(path, _)| bound.contains(path.as_str()))
        .map(|(path, disk)| (path.clone(), disk.clone()))
        .collect()
}

// =============================================================================
// Node agent
// =============================================================================

#[derive(Debug, Clone)]
pub struct NodeAgentConfig {
    pub sync_interval: Duration,
    /// Every Nth sync also runs the consistency check
    pub consistency_every: u32,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            consistency_every: 10,
        }
    }
}

pub struct NodeAgent {
    node_name: String,
    store: Arc<dyn ObjectStore>,
    inventory: Arc<DiskInventory>,
    pools: PoolManager,
    manager: Arc<ReplicaManager>,
    lvm: Option<Arc<LvmExecutor>>,
    drbd: Option<Arc<DrbdConfigurator>>,
    publisher: Arc<NodeStatusPublisher>,
    config: NodeAgentConfig,
    last_disks: Mutex<BTreeMap<String, LocalDevice>>,
}

impl NodeAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        inventory: Arc<DiskInventory>,
        pools: PoolManager,
        manager: Arc<ReplicaManager>,
        publisher: Arc<NodeStatusPublisher>,
        config: NodeAgentConfig,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            inventory,
            pools,
            manager,
            lvm: None,
            drbd: None,
            publisher,
            config,
            last_disks: Mutex::new(BTreeMap::new()),
        }
    }

    /// LVM executor used to grow PVs after a disk was enlarged
    pub fn with_lvm(mut self, lvm: Arc<LvmExecutor>) -> Self {
        self.lvm = Some(lvm);
        self
    }

    pub fn with_drbd(mut self, drbd: Arc<DrbdConfigurator>) -> Self {
        self.drbd = Some(drbd);
        self
    }

    /// Create or refresh the LocalDisk of every scanned device and mark
    /// the ones no longer seen Offline. Returns this node's LocalDisks.
    pub async fn publish_disks(&self, disks: &BTreeMap<String, LocalDevice>) -> Result<Vec<LocalDisk>> {
        let mut existing: BTreeMap<String, LocalDisk> = self
            .store
            .list_disks()
            .await?
            .into_iter()
            .filter(|d| d.spec.node_name == self.node_name)
            .map(|d| (d.name_any(), d))
            .collect();

        let mut published = Vec::new();
        for disk in disks.values() {
            let name = local_disk_name(&self.node_name, &disk.dev_path);
            let result = match existing.remove(&name) {
                Some(current) => self.refresh_disk(current, disk).await,
                None => self.create_disk(&name, disk).await,
            };
            match result {
                Ok(d) => published.push(d),
                Err(e) => warn!("Failed to publish LocalDisk {}: {}", name, e),
            }
        }

        for (name, mut gone) in existing {
            if gone.status.as_ref().and_then(|s| s.state) == Some(DiskState::Offline) {
                published.push(gone);
                continue;
            }
            info!("Disk {} ({}) is offline", name, gone.spec.device_path);
            gone.status = Some(LocalDiskStatus {
                state: Some(DiskState::Offline),
            });
            match self.store.update_disk_status(&gone).await {
                Ok(d) => published.push(d),
                Err(e) => warn!("Failed to mark LocalDisk {} offline: {}", name, e),
            }
        }
        Ok(published)
    }

    async fn create_disk(&self, name: &str, disk: &LocalDevice) -> Result<LocalDisk> {
        info!("Discovered disk {} on {}", disk.dev_path, self.node_name);
        let new = LocalDisk::new(
            name,
            LocalDiskSpec {
                node_name: self.node_name.clone(),
                device_path: disk.dev_path.clone(),
                capacity: disk.capacity_bytes,
                class: Some(disk.class),
                reserved: false,
                claim_ref: None,
                serial_number: String::new(),
            },
        );
        let mut created = self.store.create_disk(&new).await?;
        created.status = Some(LocalDiskStatus {
            state: Some(disk.state),
        });
        self.store.update_disk_status(&created).await
    }

    async fn refresh_disk(&self, mut current: LocalDisk, disk: &LocalDevice) -> Result<LocalDisk> {
        if current.spec.capacity != disk.capacity_bytes
            || current.spec.class != Some(disk.class)
            || current.spec.device_path != disk.dev_path
        {
            current.spec.capacity = disk.capacity_bytes;
            current.spec.class = Some(disk.class);
            current.spec.device_path = disk.dev_path.clone();
            current = self.store.update_disk(&current).await?;
        }
        let state = if current.spec.reserved {
            DiskState::Reserved
        } else {
            disk.state
        };
        if current.status.as_ref().and_then(|s| s.state) == Some(state) {
            return Ok(current);
        }
        current.status = Some(LocalDiskStatus { state: Some(state) });
        self.store.update_disk_status(&current).await
    }

    /// One tick: scan disks, extend pools, sync the registry, publish
    pub async fn sync_once(&self) -> Result<bool> {
        let disks = self.inventory.scan().await?;
        self.sync_disks(disks).await
    }

    /// Everything after the scan: LocalDisks, PV growth, pools, status
    pub async fn sync_disks(&self, disks: BTreeMap<String, LocalDevice>) -> Result<bool> {
        let local_disks = self.publish_disks(&disks).await?;

        let grown = {
            let mut last = self.last_disks.lock();
            let grown = grown_disks(&last, &disks);
            *last = disks.clone();
            grown
        };
        if !grown.is_empty() {
            info!("Disks grew: {:?}", grown);
            if let Some(lvm) = &self.lvm {
                lvm.resize_physical_volumes().await?;
            }
        }

        let candidates = pool_candidates(&self.node_name, &disks, &local_disks);
        match self.pools.sync(&candidates).await {
            Ok(expanded) => {
                let condition = if expanded {
                    info!(target: "audit", "Extended storage pools on node {}", self.node_name);
                    Some(storage_condition(true, "Storage pools extended"))
                } else {
                    None
                };
                self.publisher.publish(condition).await?;
                Ok(expanded)
            }
            Err(e) => {
                warn!("Pool sync failed on node {}: {}", self.node_name, e);
                self.publisher
                    .publish(Some(storage_condition(false, e.to_string())))
                    .await?;
                Err(e)
            }
        }
    }

    /// Compare declared replicas with the registry and the host, and
    /// remove DRBD configs of replicas that no longer exist
    pub async fn consistency_check(&self) -> Result<ConsistencyReport> {
        let declared = self.store.list_replicas_by_node(&self.node_name).await?;
        let report = self.manager.consistency_check(&declared).await?;
        for issue in &report.issues {
            warn!("Consistency: {}", issue);
        }
        for repaired in &report.repaired {
            info!("Consistency: repaired {}", repaired);
        }

        if let Some(drbd) = &self.drbd {
            let known: BTreeSet<String> = declared
                .iter()
                .map(|r| r.spec.volume_name.clone())
                .collect();
            drbd.consistency_check(&known).await?;
        }
        Ok(report)
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Node agent started on {}, sync every {}s",
            self.node_name,
            self.config.sync_interval.as_secs()
        );
        let mut tick: u32 = 0;
        loop {
            if let Err(e) = self.sync_once().await {
                error!("Node sync failed: {}", e);
            }
            if self.config.consistency_every > 0 && tick % self.config.consistency_every == 0 {
                if let Err(e) = self.consistency_check().await {
                    error!("Consistency check failed: {}", e);
                }
            }
            tick = tick.wrapping_add(1);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.sync_interval) => {}
            }
        }
        info!("Node agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::memory::MemoryStore;
    use crate::controller::testing::{storage_node, FakeLvm, POOL};
    use crate::crd::{DiskClass, StorageConditionType};
    use crate::exec::mock::MockExecutor;
    use crate::hardware::discovery::ScannerConfig;
    use crate::storage::units::GIB;
    use tempfile::TempDir;

    fn agent(dir: &TempDir) -> (Arc<MemoryStore>, Arc<FakeLvm>, LocalRegistry, NodeAgent) {
        let by_path = dir.path().join("by-path");
        std::fs::create_dir_all(&by_path).unwrap();
        let inventory = Arc::new(DiskInventory::new(
            ScannerConfig {
                by_path_dir: by_path,
                sysfs_block: dir.path().join("sys"),
            },
            Arc::new(MockExecutor::new()),
        ));
        let store = Arc::new(MemoryStore::new());
        store.nodes.put(storage_node("n1"));
        let registry = LocalRegistry::new("n1");
        let lvm = Arc::new(FakeLvm::default());
        let pools = PoolManager::new(
            registry.clone(),
            vec![lvm.clone() as Arc<dyn crate::storage::ReplicaExecutor>],
            [],
        );
        let manager = Arc::new(ReplicaManager::new(registry.clone()).with_executor(lvm.clone()));
        let publisher = Arc::new(NodeStatusPublisher::new("n1", store.clone(), registry.clone()));
        let agent = NodeAgent::new(
            "n1",
            store.clone(),
            inventory,
            pools,
            manager,
            publisher,
            NodeAgentConfig::default(),
        );
        (store, lvm, registry, agent)
    }

    #[tokio::test]
    async fn test_sync_publishes_pools() {
        let dir = TempDir::new().unwrap();
        let (store, _lvm, registry, agent) = agent(&dir);

        assert!(!agent.sync_once().await.unwrap());
        assert!(registry.pool(POOL).is_some());

        let node = store.nodes.get("n1").unwrap();
        assert!(node.is_ready());
        assert_eq!(node.pool(POOL).unwrap().total_capacity_bytes, 100 * GIB);
    }

    #[tokio::test]
    async fn test_publish_condition() {
        let dir = TempDir::new().unwrap();
        let (store, _lvm, registry, _agent) = agent(&dir);
        let publisher = NodeStatusPublisher::new("n1", store.clone(), registry);

        publisher
            .publish(Some(storage_condition(false, "vgextend failed")))
            .await
            .unwrap();
        let node = store.nodes.get("n1").unwrap();
        let status = node.status.unwrap();
        let cond = status
            .condition(StorageConditionType::StorageExpandFailure)
            .unwrap();
        assert_eq!(cond.message, "vgextend failed");

        // no node object is not an error
        let other = NodeStatusPublisher::new("n2", store.clone(), LocalRegistry::new("n2"));
        other.publish(None).await.unwrap();
    }

    fn blank(path: &str) -> (String, LocalDevice) {
        (
            path.to_string(),
            LocalDevice {
                dev_path: path.to_string(),
                class: DiskClass::Hdd,
                capacity_bytes: 100 * GIB,
                state: DiskState::Available,
            },
        )
    }

    #[test]
    fn test_local_disk_name() {
        assert_eq!(local_disk_name("Node-1", "/dev/sdb"), "node-1-sdb");
        assert_eq!(local_disk_name("n1", "/dev/nvme0n1"), "n1-nvme0n1");
    }

    #[tokio::test]
    async fn test_publish_disks_creates_and_marks_offline() {
        let dir = TempDir::new().unwrap();
        let (store, _lvm, _registry, agent) = agent(&dir);

        let disks: BTreeMap<_, _> = [blank("/dev/sdb"), blank("/dev/sdc")].into_iter().collect();
        let published = agent.publish_disks(&disks).await.unwrap();
        assert_eq!(published.len(), 2);
        let sdb = store.disks.get("n1-sdb").unwrap();
        assert_eq!(sdb.spec.device_path, "/dev/sdb");
        assert_eq!(sdb.spec.class, Some(DiskClass::Hdd));
        assert!(sdb.is_available());

        let mut reserved = store.disks.get("n1-sdc").unwrap();
        reserved.spec.reserved = true;
        store.disks.put(reserved);

        let disks: BTreeMap<_, _> = [blank("/dev/sdc")].into_iter().collect();
        agent.publish_disks(&disks).await.unwrap();
        let state = |name: &str| store.disks.get(name).unwrap().status.unwrap().state;
        assert_eq!(state("n1-sdb"), Some(DiskState::Offline));
        assert_eq!(state("n1-sdc"), Some(DiskState::Reserved));
    }

    #[test]
    fn test_pool_candidates_need_claim() {
        let disks: BTreeMap<_, _> = [blank("/dev/sdb"), blank("/dev/sdc"), blank("/dev/sdd")]
            .into_iter()
            .collect();
        let local = |path: &str, claim: Option<&str>, reserved: bool| {
            LocalDisk::new(
                &local_disk_name("n1", path),
                LocalDiskSpec {
                    node_name: "n1".into(),
                    device_path: path.into(),
                    capacity: 100 * GIB,
                    class: Some(DiskClass::Hdd),
                    reserved,
                    claim_ref: claim.map(String::from),
                    serial_number: String::new(),
                },
            )
        };
        let local_disks = vec![
            local("/dev/sdb", Some("claim-1"), false),
            local("/dev/sdc", None, false),
            local("/dev/sdd", Some("claim-1"), true),
        ];

        let candidates = pool_candidates("n1", &disks, &local_disks);
        assert_eq!(candidates.keys().collect::<Vec<_>>(), vec!["/dev/sdb"]);
        assert!(pool_candidates("n2", &disks, &local_disks).is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_disks_are_not_pooled() {
        let dir = TempDir::new().unwrap();
        let (store, _lvm, _registry, agent) = agent(&dir);
        let disks: BTreeMap<_, _> = [blank("/dev/sdb")].into_iter().collect();

        assert!(!agent.sync_disks(disks.clone()).await.unwrap());

        let mut claimed = store.disks.get("n1-sdb").unwrap();
        claimed.spec.claim_ref = Some("claim-1".into());
        store.disks.put(claimed);
        assert!(agent.sync_disks(disks).await.unwrap());
    }

    #[tokio::test]
    async fn test_consistency_check_runs() {
        let dir = TempDir::new().unwrap();
        let (_store, _lvm, _registry, agent) = agent(&dir);
        let report = agent.consistency_check().await.unwrap();
        assert!(report.is_consistent());
    }
}
