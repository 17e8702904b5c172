//! Fixtures shared by controller tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::crd::{
    LocalDevice, LocalPool, LocalStorageNode, LocalStorageNodeSpec, LocalVolume, LocalVolumeReplica,
    LocalVolumeReplicaStatus, LocalVolumeSpec, ReplicaState, VolumeKind,
};
use crate::error::Result;
use crate::storage::executor::{ready_status, with_status, ConsistencyReport, ReplicaExecutor};
use crate::storage::lvm::lv_path;
use crate::storage::registry::tests::pool;
use crate::storage::units::GIB;

pub const POOL: &str = "LocalStorage_PoolHDD";

/// LVM-like executor that keeps replicas in memory
#[derive(Default)]
pub struct FakeLvm {
    pub host: Mutex<BTreeMap<String, LocalVolumeReplica>>,
    pub calls: Mutex<Vec<String>>,
    /// Reported kind; LVM when unset
    pub kind: Option<VolumeKind>,
    /// How long `create_replica` takes
    pub create_delay: Mutex<Duration>,
}

impl FakeLvm {
    pub fn of_kind(kind: VolumeKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait]
impl ReplicaExecutor for FakeLvm {
    fn kind(&self) -> VolumeKind {
        self.kind.unwrap_or(VolumeKind::Lvm)
    }

    async fn create_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        self.record(format!("create {}", replica.spec.volume_name));
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let path = lv_path(&replica.spec.pool_name, &replica.spec.volume_name);
        let created = with_status(
            replica,
            ready_status(
                path.clone(),
                path,
                replica.spec.required_capacity_bytes,
                vec!["/dev/sdb".into()],
            ),
        );
        self.host
            .lock()
            .insert(replica.spec.volume_name.clone(), created.clone());
        Ok(created)
    }

    async fn delete_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        self.record(format!("delete {}", replica.spec.volume_name));
        self.host.lock().remove(&replica.spec.volume_name);
        Ok(())
    }

    async fn expand_replica(
        &self,
        replica: &LocalVolumeReplica,
        new_capacity: i64,
    ) -> Result<LocalVolumeReplica> {
        self.record(format!("expand {} {}", replica.spec.volume_name, new_capacity));
        let mut out = replica.clone();
        let status = out.status.get_or_insert_with(Default::default);
        status.allocated_capacity_bytes = new_capacity;
        self.host
            .lock()
            .insert(replica.spec.volume_name.clone(), out.clone());
        Ok(out)
    }

    async fn test_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        self.record(format!("test {}", replica.spec.volume_name));
        let host = self.host.lock().get(&replica.spec.volume_name).cloned();
        Ok(match host {
            Some(found) => {
                let mut status = found.status.unwrap_or_default();
                status.state = Some(ReplicaState::Ready);
                with_status(replica, status)
            }
            None => with_status(
                replica,
                LocalVolumeReplicaStatus {
                    state: Some(ReplicaState::NotReady),
                    message: "backing not found".into(),
                    ..Default::default()
                },
            ),
        })
    }

    async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>> {
        Ok(self.host.lock().clone())
    }

    async fn extend_pools(&self, disks: &[LocalDevice]) -> Result<bool> {
        Ok(!disks.is_empty())
    }

    async fn pools_info(&self) -> Result<BTreeMap<String, LocalPool>> {
        let mut out = BTreeMap::new();
        out.insert(POOL.to_string(), pool(POOL, 100 * GIB, 1000));
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

pub fn storage_node(name: &str) -> LocalStorageNode {
    LocalStorageNode::new(
        name,
        LocalStorageNodeSpec {
            hostname: name.into(),
            storage_ip: "10.0.0.1".into(),
            topology: Default::default(),
        },
    )
}

pub fn volume(name: &str, replicas: i64) -> LocalVolume {
    LocalVolume::new(
        name,
        LocalVolumeSpec {
            pool_name: POOL.into(),
            required_capacity_bytes: GIB,
            replica_number: replicas,
            convertible: false,
            striped: false,
            accessibility: Default::default(),
            pvc_namespace: "default".into(),
            pvc_name: format!("{}-claim", name),
            config: None,
            encryption: None,
            delete: false,
        },
    )
}

/// A replica on node `n1` with no status yet
pub fn pending_replica(volume: &str) -> LocalVolumeReplica {
    let mut r = crate::storage::registry::tests::replica(volume, POOL, GIB);
    r.status = None;
    r
}
