//! Raw-disk backing
//!
//! A replica owns a whole disk. The disk is exposed by a hard link named
//! after the volume under the pool's anchor directory
//! (`/dev/LocalStorage_Pool<Class>/<volume>`); link-to-disk matching uses
//! the device number, or the inode for non-device files.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::executor::{check_against_host, ready_status, with_status, ConsistencyReport, ReplicaExecutor};
use super::pools::pool_name_for_class;
use crate::crd::{
    DiskClass, DiskState, LocalDevice, LocalPool, LocalVolumeReplica, LocalVolumeReplicaSpec,
    LocalVolumeReplicaStatus, ReplicaState, VolumeKind,
};
use crate::error::{Error, Result};
use crate::exec::{ExecParams, Executor};

/// Identity shared by a device node and its hard links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum FileIdentity {
    Device(u64),
    Inode(u64, u64),
}

fn identity(path: &Path) -> Option<FileIdentity> {
    let meta = std::fs::metadata(path).ok()?;
    Some(if meta.rdev() != 0 {
        FileIdentity::Device(meta.rdev())
    } else {
        FileIdentity::Inode(meta.dev(), meta.ino())
    })
}

/// Replica executor for whole-disk pools
pub struct DiskExecutor {
    node_name: String,
    exec: Arc<dyn Executor>,
    dev_root: PathBuf,
    classes: BTreeSet<DiskClass>,
    disks: Mutex<BTreeMap<String, LocalDevice>>,
}

impl DiskExecutor {
    /// `classes` are the disk classes whose pools use whole disks
    pub fn new(
        node_name: impl Into<String>,
        exec: Arc<dyn Executor>,
        dev_root: impl Into<PathBuf>,
        classes: impl IntoIterator<Item = DiskClass>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            exec,
            dev_root: dev_root.into(),
            classes: classes.into_iter().filter(|c| *c != DiskClass::Ram).collect(),
            disks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn handles(&self, class: DiskClass) -> bool {
        self.classes.contains(&class)
    }

    fn anchor_dir(&self, pool: &str) -> PathBuf {
        self.dev_root.join(pool)
    }

    fn link_path(&self, pool: &str, volume: &str) -> PathBuf {
        self.anchor_dir(pool).join(volume)
    }

    fn pool_disks(&self, pool: &str) -> Vec<LocalDevice> {
        self.disks
            .lock()
            .values()
            .filter(|d| pool_name_for_class(d.class) == pool)
            .cloned()
            .collect()
    }

    /// Volume links of a pool mapped to the disk each one references
    fn links(&self, pool: &str) -> Result<BTreeMap<String, Option<LocalDevice>>> {
        let dir = self.anchor_dir(pool);
        let mut out = BTreeMap::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        let by_identity: BTreeMap<FileIdentity, LocalDevice> = self
            .pool_disks(pool)
            .into_iter()
            .filter_map(|d| identity(Path::new(&d.dev_path)).map(|id| (id, d)))
            .collect();

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let disk = identity(&entry.path()).and_then(|id| by_identity.get(&id).cloned());
            out.insert(name, disk);
        }
        Ok(out)
    }

    fn host_replica(&self, pool: &str, volume: &str, disk: &LocalDevice) -> LocalVolumeReplica {
        let mut replica = LocalVolumeReplica::new(
            volume,
            LocalVolumeReplicaSpec {
                volume_name: volume.to_string(),
                pool_name: pool.to_string(),
                node_name: self.node_name.clone(),
                kind: VolumeKind::Disk,
                required_capacity_bytes: disk.capacity_bytes,
                striped: false,
                convertible: false,
                require_ready: false,
                delete: false,
            },
        );
        replica.status = Some(ready_status(
            disk.dev_path.clone(),
            self.link_path(pool, volume).to_string_lossy().to_string(),
            disk.capacity_bytes,
            vec![disk.dev_path.clone()],
        ));
        replica
    }

    async fn is_healthy(&self, device: &str) -> bool {
        let res = self
            .exec
            .run(ExecParams::new("smartctl").args(["-H", device]))
            .await;
        let out = &res.stdout;
        // Devices without SMART (virtual disks) count as healthy
        out.contains("PASSED") || out.contains("SMART Health Status: OK") || out.contains("Unavailable")
    }
}

#[async_trait]
impl ReplicaExecutor for DiskExecutor {
    fn kind(&self) -> VolumeKind {
        VolumeKind::Disk
    }

    async fn create_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        let pool = &replica.spec.pool_name;
        let volume = &replica.spec.volume_name;
        let link = self.link_path(pool, volume);

        if link.exists() {
            debug!("Disk link {} already exists", link.display());
            return self.test_replica(replica).await;
        }

        let linked: BTreeSet<String> = self
            .links(pool)?
            .into_values()
            .flatten()
            .map(|d| d.dev_path)
            .collect();
        let mut candidates: Vec<LocalDevice> = self
            .pool_disks(pool)
            .into_iter()
            .filter(|d| d.state == DiskState::Available && !linked.contains(&d.dev_path))
            .filter(|d| d.capacity_bytes >= replica.spec.required_capacity_bytes)
            .collect();
        candidates.sort_by(|a, b| a.dev_path.cmp(&b.dev_path));

        let disk = candidates.into_iter().next().ok_or_else(|| Error::InsufficientResources {
            pool: pool.clone(),
            reason: "no available disk".into(),
        })?;

        tokio::fs::create_dir_all(self.anchor_dir(pool)).await?;
        tokio::fs::hard_link(&disk.dev_path, &link).await?;
        info!(target: "audit", "Linked disk {} as {}", disk.dev_path, link.display());

        {
            let mut disks = self.disks.lock();
            if let Some(d) = disks.get_mut(&disk.dev_path) {
                d.state = DiskState::InUse;
            }
        }

        let mut created = with_status(
            replica,
            ready_status(
                disk.dev_path.clone(),
                link.to_string_lossy().to_string(),
                disk.capacity_bytes,
                vec![disk.dev_path.clone()],
            ),
        );
        if !self.is_healthy(&disk.dev_path).await {
            if let Some(status) = created.status.as_mut() {
                status.state = Some(ReplicaState::NotReady);
                status.synced = false;
            }
        }
        Ok(created)
    }

    async fn delete_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let pool = &replica.spec.pool_name;
        let volume = &replica.spec.volume_name;
        let link = self.link_path(pool, volume);

        let disk = match self.links(pool)?.remove(volume) {
            None => {
                debug!("Disk link {} already removed", link.display());
                return Ok(());
            }
            Some(disk) => disk,
        };

        // Wipe leading signatures so the disk comes back clean
        let storage = disk
            .map(|d| d.dev_path)
            .or_else(|| replica.status.as_ref().map(|s| s.storage_path.clone()))
            .filter(|p| !p.is_empty());
        if let Some(storage) = &storage {
            self.exec
                .run_checked(ExecParams::new("dd").args([
                    "if=/dev/zero".to_string(),
                    format!("of={}", storage),
                    "bs=1024".to_string(),
                    "count=20".to_string(),
                ]))
                .await?;
            let mut disks = self.disks.lock();
            if let Some(d) = disks.get_mut(storage) {
                d.state = DiskState::Available;
            }
        }

        tokio::fs::remove_file(&link).await?;
        info!(target: "audit", "Released disk replica {}", link.display());
        Ok(())
    }

    async fn expand_replica(
        &self,
        _replica: &LocalVolumeReplica,
        _new_capacity: i64,
    ) -> Result<LocalVolumeReplica> {
        Err(Error::Unsupported {
            kind: VolumeKind::Disk.to_string(),
            operation: "expand".into(),
        })
    }

    async fn test_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        let pool = &replica.spec.pool_name;
        let volume = &replica.spec.volume_name;

        let disk = match self.links(pool)?.remove(volume) {
            Some(Some(disk)) => disk,
            _ => {
                return Ok(with_status(
                    replica,
                    LocalVolumeReplicaStatus {
                        state: Some(ReplicaState::NotReady),
                        synced: false,
                        message: "disk link not found".into(),
                        ..replica.status.clone().unwrap_or_default()
                    },
                ));
            }
        };

        let mut tested = with_status(replica, self.host_replica(pool, volume, &disk).status.unwrap_or_default());
        if !self.is_healthy(&disk.dev_path).await {
            if let Some(status) = tested.status.as_mut() {
                status.state = Some(ReplicaState::NotReady);
                status.synced = false;
                status.message = "SMART health check failed".into();
            }
        }
        Ok(tested)
    }

    async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>> {
        let mut replicas = BTreeMap::new();
        for class in &self.classes {
            let pool = pool_name_for_class(*class);
            for (volume, disk) in self.links(pool)? {
                match disk {
                    Some(disk) => {
                        replicas.insert(volume.clone(), self.host_replica(pool, &volume, &disk));
                    }
                    None => warn!("Link {}/{} references no known disk", pool, volume),
                }
            }
        }
        Ok(replicas)
    }

    async fn extend_pools(&self, disks: &[LocalDevice]) -> Result<bool> {
        let mut known = self.disks.lock();
        let mut changed = false;
        for disk in disks.iter().filter(|d| self.handles(d.class)) {
            match known.get(&disk.dev_path) {
                Some(existing) if existing == disk => {}
                _ => {
                    if !known.contains_key(&disk.dev_path) {
                        info!(target: "audit", "Adding disk {} to pool {}", disk.dev_path, pool_name_for_class(disk.class));
                        changed = true;
                    }
                    known.insert(disk.dev_path.clone(), disk.clone());
                }
            }
        }
        Ok(changed)
    }

    async fn pools_info(&self) -> Result<BTreeMap<String, LocalPool>> {
        let mut pools = BTreeMap::new();
        for class in &self.classes {
            let name = pool_name_for_class(*class);
            let disks = self.pool_disks(name);
            if disks.is_empty() {
                continue;
            }

            let links = self.links(name)?;
            let linked: BTreeMap<String, String> = links
                .iter()
                .filter_map(|(v, d)| d.as_ref().map(|d| (d.dev_path.clone(), v.clone())))
                .collect();

            let mut pool = LocalPool::new(name, *class, VolumeKind::Disk);
            pool.path = self.anchor_dir(name).to_string_lossy().to_string();
            for mut disk in disks {
                if linked.contains_key(&disk.dev_path) {
                    disk.state = DiskState::InUse;
                    pool.used_capacity_bytes += disk.capacity_bytes;
                } else if disk.state == DiskState::Available {
                    pool.volume_capacity_bytes_limit =
                        pool.volume_capacity_bytes_limit.max(disk.capacity_bytes);
                }
                pool.total_capacity_bytes += disk.capacity_bytes;
                pool.disks.push(disk);
            }
            pool.free_capacity_bytes = pool.total_capacity_bytes - pool.used_capacity_bytes;
            pool.volumes = linked.values().cloned().collect();
            pool.volumes.sort();
            pool.total_volume_count = pool.disks.len() as i64;
            pool.used_volume_count = pool.volumes.len() as i64;
            pool.free_volume_count = pool.total_volume_count - pool.used_volume_count;
            pools.insert(name.to_string(), pool);
        }
        Ok(pools)
    }

    async fn consistency_check(
        &self,
        declared: &[LocalVolumeReplica],
        registered: &BTreeMap<String, LocalVolumeReplica>,
    ) -> Result<ConsistencyReport> {
        let host = self.get_replicas().await?;
        let report = check_against_host(&host, declared, registered);
        for issue in &report.issues {
            warn!("Disk consistency: {}", issue);
        }
        Ok(report)
    }
}
