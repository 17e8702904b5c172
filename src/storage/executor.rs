//! Replica Executor
//!
//! Per-kind backends (LVM, raw disk, RAM) implement [`ReplicaExecutor`];
//! the [`ReplicaManager`](super::ReplicaManager) validates requests and
//! dispatches to the executor matching the replica's kind.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::crd::{
    LocalDevice, LocalPool, LocalVolumeReplica, LocalVolumeReplicaStatus, ReplicaState,
    VolumeKind,
};
use crate::error::Result;

/// Discrepancies found by a consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Human-readable mismatches, one per finding
    pub issues: Vec<String>,
    /// Host-side repairs performed (RAM remounts)
    pub repaired: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn merge(&mut self, other: ConsistencyReport) {
        self.issues.extend(other.issues);
        self.repaired.extend(other.repaired);
    }
}

/// Backend for one volume kind
#[async_trait]
pub trait ReplicaExecutor: Send + Sync {
    fn kind(&self) -> VolumeKind;

    /// Carve the backing for a replica and return it with status filled in
    async fn create_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica>;

    /// Release the backing; a missing backing is not an error
    async fn delete_replica(&self, replica: &LocalVolumeReplica) -> Result<()>;

    /// Grow the backing to `new_capacity` bytes
    async fn expand_replica(
        &self,
        replica: &LocalVolumeReplica,
        new_capacity: i64,
    ) -> Result<LocalVolumeReplica>;

    /// Probe the backing and return refreshed state, disks and synced flag
    async fn test_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica>;

    /// Replicas present on the host, keyed by volume name
    async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>>;

    /// Add disks to the pools of this kind; returns whether anything changed
    async fn extend_pools(&self, disks: &[LocalDevice]) -> Result<bool>;

    /// Pools of this kind as found on the host
    async fn pools_info(&self) -> Result<BTreeMap<String, LocalPool>>;

    /// Compare declared and registered replicas against the host.
    ///
    /// Never writes declarative objects.
    async fn consistency_check(
        &self,
        declared: &[LocalVolumeReplica],
        registered: &BTreeMap<String, LocalVolumeReplica>,
    ) -> Result<ConsistencyReport>;
}

/// Copy of `replica` with its status replaced
pub fn with_status(
    replica: &LocalVolumeReplica,
    status: LocalVolumeReplicaStatus,
) -> LocalVolumeReplica {
    let mut out = replica.clone();
    out.status = Some(status);
    out
}

/// Status for a backing that was found and is usable
pub fn ready_status(
    storage_path: impl Into<String>,
    device_path: impl Into<String>,
    allocated: i64,
    disks: Vec<String>,
) -> LocalVolumeReplicaStatus {
    LocalVolumeReplicaStatus {
        state: Some(ReplicaState::Ready),
        storage_path: storage_path.into(),
        device_path: device_path.into(),
        allocated_capacity_bytes: allocated,
        synced: true,
        disks,
        ..Default::default()
    }
}

/// Compare path and capacity fields of two views of one replica
pub fn compare_replicas(
    source: &str,
    expected: &LocalVolumeReplica,
    actual: &LocalVolumeReplica,
) -> Vec<String> {
    let mut issues = Vec::new();
    let (Some(exp), Some(act)) = (expected.status.as_ref(), actual.status.as_ref()) else {
        return issues;
    };
    let volume = &expected.spec.volume_name;

    if exp.storage_path != act.storage_path {
        issues.push(format!(
            "{volume}: {source} storage path {:?} differs from host {:?}",
            exp.storage_path, act.storage_path
        ));
    }
    if exp.device_path != act.device_path {
        issues.push(format!(
            "{volume}: {source} device path {:?} differs from host {:?}",
            exp.device_path, act.device_path
        ));
    }
    if exp.allocated_capacity_bytes != act.allocated_capacity_bytes {
        issues.push(format!(
            "{volume}: {source} capacity {} differs from host {}",
            exp.allocated_capacity_bytes, act.allocated_capacity_bytes
        ));
    }
    issues
}

/// Shared consistency logic: every registered and declared replica must
/// exist on the host with matching paths, and every host replica must be
/// known to the registry
pub fn check_against_host(
    host: &BTreeMap<String, LocalVolumeReplica>,
    declared: &[LocalVolumeReplica],
    registered: &BTreeMap<String, LocalVolumeReplica>,
) -> ConsistencyReport {
    let mut report = ConsistencyReport::default();

    for (name, replica) in registered {
        match host.get(name) {
            Some(actual) => report
                .issues
                .extend(compare_replicas("registry", replica, actual)),
            None => report
                .issues
                .push(format!("{name}: registered but missing on host")),
        }
    }

    for replica in declared {
        let name = &replica.spec.volume_name;
        if replica.state() != Some(ReplicaState::Ready) {
            continue;
        }
        match host.get(name) {
            Some(actual) => report
                .issues
                .extend(compare_replicas("declared", replica, actual)),
            None => report
                .issues
                .push(format!("{name}: declared Ready but missing on host")),
        }
    }

    for name in host.keys() {
        if !registered.contains_key(name) {
            report
                .issues
                .push(format!("{name}: present on host but not registered"));
        }
    }

    report
}
