//! LVM backing
//!
//! Disks of a class become physical volumes of the volume group named after
//! the class's pool; each replica is one logical volume. Storage path and
//! device path are both `/dev/<vg>/<volume>`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::executor::{check_against_host, ready_status, with_status, ConsistencyReport, ReplicaExecutor};
use super::pools::{class_for_pool_name, is_pool_name, pool_name_for_class, LVM_VOLUME_MAX_COUNT};
use super::units::{parse_lvm_bytes, to_lvm_bytes};
use crate::crd::{
    DiskClass, DiskState, LocalDevice, LocalPool, LocalVolumeReplica, LocalVolumeReplicaSpec,
    LocalVolumeReplicaStatus, ReplicaState, VolumeKind,
};
use crate::error::{Error, Result};
use crate::exec::{ExecParams, Executor};

// =============================================================================
// JSON Reports
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct Report {
    #[serde(default)]
    report: Vec<ReportSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportSection {
    #[serde(default)]
    pv: Vec<PvRecord>,
    #[serde(default)]
    vg: Vec<VgRecord>,
    #[serde(default)]
    lv: Vec<LvRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct PvRecord {
    pv_name: String,
    #[serde(default)]
    vg_name: String,
    #[serde(default)]
    pv_size: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VgRecord {
    vg_name: String,
    #[serde(default)]
    vg_size: String,
    #[serde(default)]
    vg_free: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LvRecord {
    lv_name: String,
    vg_name: String,
    #[serde(default)]
    lv_size: String,
    #[serde(default)]
    lv_path: String,
}

fn parse_report(command: &str, stdout: &str) -> Result<ReportSection> {
    let report: Report = serde_json::from_str(stdout).map_err(|e| Error::CommandOutputParse {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    let mut merged = ReportSection::default();
    for section in report.report {
        merged.pv.extend(section.pv);
        merged.vg.extend(section.vg);
        merged.lv.extend(section.lv);
    }
    Ok(merged)
}

/// Disks and activation state from `lvdisplay -m`
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LvDisplay {
    pub available: bool,
    pub disks: Vec<String>,
}

pub fn parse_lvdisplay(stdout: &str) -> LvDisplay {
    let mut out = LvDisplay::default();
    for line in stdout.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("LV Status") {
            out.available = rest.trim() == "available";
        } else if let Some(rest) = line.strip_prefix("Physical volume") {
            let disk = rest.trim().to_string();
            if !disk.is_empty() && !out.disks.contains(&disk) {
                out.disks.push(disk);
            }
        }
    }
    out
}

pub fn lv_path(vg: &str, volume: &str) -> String {
    format!("/dev/{}/{}", vg, volume)
}

// =============================================================================
// LVM Executor
// =============================================================================

/// Replica executor for LVM-backed pools
pub struct LvmExecutor {
    node_name: String,
    exec: Arc<dyn Executor>,
}

impl LvmExecutor {
    pub fn new(node_name: impl Into<String>, exec: Arc<dyn Executor>) -> Self {
        Self {
            node_name: node_name.into(),
            exec,
        }
    }

    async fn report(&self, cmd: &str, fields: &str, target: Option<&str>) -> Result<ReportSection> {
        let mut params = ExecParams::new(cmd).args(["--reportformat", "json", "--units", "B", "-o", fields]);
        if let Some(target) = target {
            params = params.arg(target);
        }
        let command = params.command_line();
        let res = self.exec.run_checked(params).await?;
        parse_report(&command, &res.stdout)
    }

    async fn physical_volumes(&self) -> Result<Vec<PvRecord>> {
        Ok(self.report("pvs", "pv_name,vg_name,pv_size", None).await?.pv)
    }

    async fn volume_groups(&self) -> Result<Vec<VgRecord>> {
        Ok(self
            .report("vgs", "vg_name,vg_size,vg_free", None)
            .await?
            .vg
            .into_iter()
            .filter(|vg| is_pool_name(&vg.vg_name))
            .collect())
    }

    async fn logical_volumes(&self, target: Option<&str>) -> Result<Vec<LvRecord>> {
        Ok(self
            .report("lvs", "lv_name,vg_name,lv_size,lv_path", target)
            .await?
            .lv
            .into_iter()
            .filter(|lv| is_pool_name(&lv.vg_name))
            .collect())
    }

    fn host_replica(&self, lv: &LvRecord) -> Result<LocalVolumeReplica> {
        let name = lv.lv_name.trim_matches(|c| c == '[' || c == ']').to_string();
        let path = if lv.lv_path.is_empty() {
            lv_path(&lv.vg_name, &name)
        } else {
            lv.lv_path.clone()
        };
        let mut replica = LocalVolumeReplica::new(
            &name,
            LocalVolumeReplicaSpec {
                volume_name: name.clone(),
                pool_name: lv.vg_name.clone(),
                node_name: self.node_name.clone(),
                kind: VolumeKind::Lvm,
                required_capacity_bytes: 0,
                striped: false,
                convertible: false,
                require_ready: false,
                delete: false,
            },
        );
        replica.status = Some(ready_status(
            path.clone(),
            path,
            parse_lvm_bytes(&lv.lv_size)?,
            Vec::new(),
        ));
        Ok(replica)
    }

    /// Grow each pool PV to its device size after a disk was enlarged
    pub async fn resize_physical_volumes(&self) -> Result<()> {
        for pv in self.physical_volumes().await? {
            if !is_pool_name(&pv.vg_name) {
                continue;
            }
            info!("Resizing physical volume {} in {}", pv.pv_name, pv.vg_name);
            self.exec
                .run_checked(ExecParams::new("pvresize").args([pv.pv_name.as_str(), "-y"]))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaExecutor for LvmExecutor {
    fn kind(&self) -> VolumeKind {
        VolumeKind::Lvm
    }

    async fn create_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        let vg = &replica.spec.pool_name;
        let volume = &replica.spec.volume_name;

        let pv_count = self
            .physical_volumes()
            .await?
            .iter()
            .filter(|pv| &pv.vg_name == vg)
            .count();
        let stripes = if replica.spec.striped {
            if pv_count < 2 {
                return Err(Error::InsufficientResources {
                    pool: vg.clone(),
                    reason: format!("striping needs at least 2 physical volumes, found {}", pv_count),
                });
            }
            pv_count
        } else {
            1
        };

        let size = to_lvm_bytes(replica.spec.required_capacity_bytes);
        let params = ExecParams::new("lvcreate").args([
            "--size".to_string(),
            format!("{}B", size),
            "--stripes".to_string(),
            stripes.to_string(),
            vg.clone(),
            "-n".to_string(),
            volume.clone(),
            "-y".to_string(),
        ]);
        let command = params.command_line();
        let res = self.exec.run(params).await;
        if !res.is_success() {
            if res.stderr.contains("already exists in volume group") {
                debug!("Logical volume {}/{} already exists", vg, volume);
            } else {
                res.check(&command)?;
            }
        } else {
            info!(target: "audit", "Created logical volume {}/{} ({} bytes)", vg, volume, size);
        }

        self.test_replica(replica).await
    }

    async fn delete_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let path = lv_path(&replica.spec.pool_name, &replica.spec.volume_name);
        let params = ExecParams::new("lvremove").args([path.as_str(), "-y"]);
        let command = params.command_line();
        let res = self.exec.run(params).await;
        if !res.is_success() {
            if res.stderr.contains("Failed to find logical volume") || res.stderr.contains("not found") {
                debug!("Logical volume {} already removed", path);
                return Ok(());
            }
            res.check(&command)?;
        }
        info!(target: "audit", "Removed logical volume {}", path);
        Ok(())
    }

    async fn expand_replica(
        &self,
        replica: &LocalVolumeReplica,
        new_capacity: i64,
    ) -> Result<LocalVolumeReplica> {
        let target = to_lvm_bytes(new_capacity);
        if replica.allocated_capacity_bytes() >= target {
            return Ok(replica.clone());
        }

        let path = lv_path(&replica.spec.pool_name, &replica.spec.volume_name);
        let params = ExecParams::new("lvextend").args([
            "--size".to_string(),
            format!("{}B", target),
            path.clone(),
            "-y".to_string(),
        ]);
        let command = params.command_line();
        let res = self.exec.run(params).await;
        if !res.is_success() && !res.stderr.contains("matches existing size") {
            res.check(&command)?;
        }
        info!(target: "audit", "Extended logical volume {} to {} bytes", path, target);

        self.test_replica(replica).await
    }

    async fn test_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        let path = lv_path(&replica.spec.pool_name, &replica.spec.volume_name);

        let res = self
            .exec
            .run(ExecParams::new("lvdisplay").args(["-m", path.as_str()]))
            .await;
        if !res.is_success() {
            debug!("Logical volume {} not found: {}", path, res.stderr.trim());
            return Ok(with_status(
                replica,
                LocalVolumeReplicaStatus {
                    state: Some(ReplicaState::NotReady),
                    message: res.stderr.trim().to_string(),
                    ..replica.status.clone().unwrap_or_default()
                },
            ));
        }
        let display = parse_lvdisplay(&res.stdout);

        let target = format!("{}/{}", replica.spec.pool_name, replica.spec.volume_name);
        let allocated = match self.logical_volumes(Some(&target)).await?.first() {
            Some(lv) => parse_lvm_bytes(&lv.lv_size)?,
            None => replica.allocated_capacity_bytes(),
        };

        let mut status = ready_status(path.clone(), path, allocated, display.disks);
        if !display.available {
            status.state = Some(ReplicaState::NotReady);
            status.message = "logical volume is not active".into();
        }
        if let Some(prev) = &replica.status {
            status.ha_state = prev.ha_state.clone();
            status.in_use = prev.in_use;
        }
        Ok(with_status(replica, status))
    }

    async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>> {
        let mut replicas = BTreeMap::new();
        for lv in self.logical_volumes(None).await? {
            let replica = self.host_replica(&lv)?;
            replicas.insert(replica.spec.volume_name.clone(), replica);
        }
        Ok(replicas)
    }

    async fn extend_pools(&self, disks: &[LocalDevice]) -> Result<bool> {
        let existing_pvs: BTreeSet<String> = self
            .physical_volumes()
            .await?
            .into_iter()
            .map(|pv| pv.pv_name)
            .collect();
        let existing_vgs: BTreeSet<String> = self
            .volume_groups()
            .await?
            .into_iter()
            .map(|vg| vg.vg_name)
            .collect();

        let mut by_pool: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for disk in disks {
            if disk.state != DiskState::Available
                || disk.class == DiskClass::Ram
                || existing_pvs.contains(&disk.dev_path)
            {
                continue;
            }
            by_pool
                .entry(pool_name_for_class(disk.class))
                .or_default()
                .push(disk.dev_path.clone());
        }

        let mut changed = false;
        for (pool, paths) in by_pool {
            let verb = if existing_vgs.contains(pool) { "vgextend" } else { "vgcreate" };
            info!(target: "audit", "Extending pool {} with {:?} ({})", pool, paths, verb);
            self.exec
                .run_checked(ExecParams::new(verb).args([pool, "-y"]).args(paths))
                .await?;
            changed = true;
        }
        Ok(changed)
    }

    async fn pools_info(&self) -> Result<BTreeMap<String, LocalPool>> {
        let pvs = self.physical_volumes().await?;
        let lvs = self.logical_volumes(None).await?;
        let mut pools = BTreeMap::new();

        for vg in self.volume_groups().await? {
            let class = class_for_pool_name(&vg.vg_name)?;
            let mut pool = LocalPool::new(&vg.vg_name, class, VolumeKind::Lvm);
            pool.path = vg.vg_name.clone();
            pool.total_capacity_bytes = parse_lvm_bytes(&vg.vg_size)?;
            pool.free_capacity_bytes = parse_lvm_bytes(&vg.vg_free)?;
            pool.used_capacity_bytes = pool.total_capacity_bytes - pool.free_capacity_bytes;
            pool.volume_capacity_bytes_limit = pool.total_capacity_bytes;

            for pv in pvs.iter().filter(|pv| pv.vg_name == vg.vg_name) {
                pool.disks.push(LocalDevice {
                    dev_path: pv.pv_name.clone(),
                    class,
                    capacity_bytes: parse_lvm_bytes(&pv.pv_size)?,
                    state: DiskState::InUse,
                });
            }
            for lv in lvs.iter().filter(|lv| lv.vg_name == vg.vg_name) {
                let name = lv.lv_name.trim_matches(|c| c == '[' || c == ']').to_string();
                if !pool.has_volume(&name) {
                    pool.volumes.push(name);
                }
            }

            pool.total_volume_count = LVM_VOLUME_MAX_COUNT;
            pool.used_volume_count = pool.volumes.len() as i64;
            pool.free_volume_count = pool.total_volume_count - pool.used_volume_count;
            pools.insert(pool.name.clone(), pool);
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
            warn!("LVM consistency: {}", issue);
        }
        Ok(report)
    }
}
