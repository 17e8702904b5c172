//! RAM backing
//!
//! Each replica is a tmpfs mounted at `/dev/LocalStorage_PoolRAM/<volume>`
//! with source `ramdisk-<volume>`. RAM state does not survive a reboot, so
//! the consistency check remounts replicas that are declared Ready but
//! missing on the host.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::executor::{check_against_host, ready_status, with_status, ConsistencyReport, ReplicaExecutor};
use super::pools::{POOL_NAME_RAM, RAM_VOLUME_MAX_COUNT};
use super::units::parse_bytes;
use crate::crd::{
    DiskClass, LocalDevice, LocalPool, LocalVolumeReplica, LocalVolumeReplicaSpec,
    LocalVolumeReplicaStatus, ReplicaState, VolumeKind,
};
use crate::error::{Error, Result};
use crate::exec::{ExecParams, Executor};

/// Default mount anchor of the RAM pool
pub const RAM_POOL_PATH: &str = "/dev/LocalStorage_PoolRAM";

/// tmpfs source prefix marking a RAM replica
pub const RAMDISK_SOURCE_PREFIX: &str = "ramdisk";

/// Replica executor for the RAM pool
pub struct RamExecutor {
    node_name: String,
    exec: Arc<dyn Executor>,
    pool_path: PathBuf,
    total_capacity: i64,
}

impl RamExecutor {
    pub fn new(
        node_name: impl Into<String>,
        exec: Arc<dyn Executor>,
        pool_path: impl Into<PathBuf>,
        total_capacity: i64,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            exec,
            pool_path: pool_path.into(),
            total_capacity,
        }
    }

    fn mount_dir(&self, volume: &str) -> String {
        self.pool_path.join(volume).to_string_lossy().to_string()
    }

    /// Mounted tmpfs size, if `dir` is a RAM replica mount
    async fn probe(&self, dir: &str) -> Result<Option<i64>> {
        let res = self
            .exec
            .run(ExecParams::new("findmnt").args(["-n", "--output=source,size", "--target", dir]))
            .await;
        if !res.is_success() {
            return Ok(None);
        }
        let mut fields = res.stdout.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(source), Some(size)) if source.starts_with(RAMDISK_SOURCE_PREFIX) => {
                Ok(Some(parse_bytes(size)?))
            }
            _ => Ok(None),
        }
    }

    fn host_replica(&self, volume: &str, allocated: i64) -> LocalVolumeReplica {
        let mut replica = LocalVolumeReplica::new(
            volume,
            LocalVolumeReplicaSpec {
                volume_name: volume.to_string(),
                pool_name: POOL_NAME_RAM.to_string(),
                node_name: self.node_name.clone(),
                kind: VolumeKind::Ram,
                required_capacity_bytes: allocated,
                striped: false,
                convertible: false,
                require_ready: false,
                delete: false,
            },
        );
        replica.status = Some(ready_status(
            RAMDISK_SOURCE_PREFIX,
            self.mount_dir(volume),
            allocated,
            Vec::new(),
        ));
        replica
    }
}

#[async_trait]
impl ReplicaExecutor for RamExecutor {
    fn kind(&self) -> VolumeKind {
        VolumeKind::Ram
    }

    async fn create_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        let volume = &replica.spec.volume_name;
        let dir = self.mount_dir(volume);

        if self.probe(&dir).await?.is_some() {
            debug!("RAM replica {} already mounted", dir);
            return self.test_replica(replica).await;
        }

        tokio::fs::create_dir_all(&dir).await?;
        self.exec
            .run_checked(ExecParams::new("mount").args([
                "-t".to_string(),
                "tmpfs".to_string(),
                "-o".to_string(),
                format!("size={}", replica.spec.required_capacity_bytes),
                format!("{}-{}", RAMDISK_SOURCE_PREFIX, volume),
                dir.clone(),
            ]))
            .await?;
        info!(target: "audit", "Mounted RAM replica {} ({} bytes)", dir, replica.spec.required_capacity_bytes);

        self.test_replica(replica).await
    }

    async fn delete_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let dir = self.mount_dir(&replica.spec.volume_name);
        if self.probe(&dir).await?.is_some() {
            self.exec
                .run_checked(ExecParams::new("umount").arg(dir.as_str()))
                .await?;
        }
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(target: "audit", "Removed RAM replica {}", dir);
        Ok(())
    }

    async fn expand_replica(
        &self,
        _replica: &LocalVolumeReplica,
        _new_capacity: i64,
    ) -> Result<LocalVolumeReplica> {
        Err(Error::Unsupported {
            kind: VolumeKind::Ram.to_string(),
            operation: "expand".into(),
        })
    }

    async fn test_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        let dir = self.mount_dir(&replica.spec.volume_name);
        match self.probe(&dir).await? {
            Some(allocated) => Ok(with_status(
                replica,
                ready_status(RAMDISK_SOURCE_PREFIX, dir, allocated, Vec::new()),
            )),
            None => Ok(with_status(
                replica,
                LocalVolumeReplicaStatus {
                    state: Some(ReplicaState::NotReady),
                    synced: false,
                    message: format!("{} is not a ramdisk mount", dir),
                    ..replica.status.clone().unwrap_or_default()
                },
            )),
        }
    }

    async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>> {
        tokio::fs::create_dir_all(&self.pool_path).await?;
        let mut replicas = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.pool_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let volume = entry.file_name().to_string_lossy().to_string();
            if let Some(allocated) = self.probe(&self.mount_dir(&volume)).await? {
                replicas.insert(volume.clone(), self.host_replica(&volume, allocated));
            }
        }
        Ok(replicas)
    }

    async fn extend_pools(&self, _disks: &[LocalDevice]) -> Result<bool> {
        Ok(false)
    }

    async fn pools_info(&self) -> Result<BTreeMap<String, LocalPool>> {
        let replicas = self.get_replicas().await?;
        let mut pool = LocalPool::new(POOL_NAME_RAM, DiskClass::Ram, VolumeKind::Ram);
        pool.path = self.pool_path.to_string_lossy().to_string();
        pool.total_capacity_bytes = self.total_capacity;
        pool.volume_capacity_bytes_limit = self.total_capacity;
        pool.used_capacity_bytes = replicas.values().map(|r| r.allocated_capacity_bytes()).sum();
        pool.free_capacity_bytes = pool.total_capacity_bytes - pool.used_capacity_bytes;
        pool.volumes = replicas.keys().cloned().collect();
        pool.total_volume_count = RAM_VOLUME_MAX_COUNT;
        pool.used_volume_count = pool.volumes.len() as i64;
        pool.free_volume_count = pool.total_volume_count - pool.used_volume_count;

        let mut pools = BTreeMap::new();
        pools.insert(pool.name.clone(), pool);
        Ok(pools)
    }

    async fn consistency_check(
        &self,
        declared: &[LocalVolumeReplica],
        registered: &BTreeMap<String, LocalVolumeReplica>,
    ) -> Result<ConsistencyReport> {
        let mut repaired = Vec::new();
        let host = self.get_replicas().await?;
        for replica in declared {
            let volume = &replica.spec.volume_name;
            if replica.is_ready() && !host.contains_key(volume) {
                warn!("RAM replica {} is declared Ready but missing, remounting", volume);
                match self.create_replica(replica).await {
                    Ok(_) => repaired.push(volume.clone()),
                    Err(e) => error!("Failed to remount RAM replica {}: {}", volume, e),
                }
            }
        }

        let host = if repaired.is_empty() { host } else { self.get_replicas().await? };
        let mut report = check_against_host(&host, declared, registered);
        report.repaired = repaired;
        for issue in &report.issues {
            warn!("RAM consistency: {}", issue);
        }
        Ok(report)
    }
}
