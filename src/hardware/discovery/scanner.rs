//! Disk Inventory
//!
//! Enumerates the PCI-attached disks of the node and classifies them.
//! Only disks reachable through `/dev/disk/by-path/pci-*` are considered;
//! iSCSI, device-mapper composites and rbd devices are excluded.
//!
//! A disk is `Available` only when it is blank: no partitions and no
//! signature (filesystem, partition table, LVM or any other) on the disk
//! or its partitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::crd::{DiskClass, DiskState, LocalDevice};
use crate::error::{Error, Result};
use crate::exec::{ExecParams, Executor};

// =============================================================================
// Constants
// =============================================================================

const DISK_BY_PATH: &str = "/dev/disk/by-path";
const SYSFS_BLOCK: &str = "/sys/class/block";

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Filesystem roots read by the inventory
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub by_path_dir: PathBuf,
    pub sysfs_block: PathBuf,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            by_path_dir: PathBuf::from(DISK_BY_PATH),
            sysfs_block: PathBuf::from(SYSFS_BLOCK),
        }
    }
}

/// A PCI-attached disk found under `/dev/disk/by-path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDisk {
    /// Kernel name, e.g. `sdb` or `nvme0n1`
    pub name: String,
    /// by-path entry name
    pub pci_path: String,
    pub nvme: bool,
    /// Has at least one partition
    pub partitioned: bool,
}

// =============================================================================
// Output parsers
// =============================================================================

/// Strip a partition suffix: `sda2 -> sda`, `nvme0n1p2 -> nvme0n1`
pub fn normalize_partition(name: &str) -> String {
    let name = name.trim_start_matches("/dev/");
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        if let Some(idx) = name.rfind('p') {
            let suffix = &name[idx + 1..];
            if idx > 0 && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                return name[..idx].to_string();
            }
        }
        return name.to_string();
    }
    name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

/// `lsblk -d -n -o NAME,ROTA` into name -> rotational
pub fn parse_lsblk_rota(stdout: &str) -> BTreeMap<String, bool> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let rota = fields.next()?;
            Some((name.to_string(), rota == "1"))
        })
        .collect()
}

/// `fdisk -l` "Disk /dev/X: ..., N bytes, ..." lines into path -> bytes
pub fn parse_fdisk_capacity(stdout: &str) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix("Disk /dev/") else {
            continue;
        };
        if rest.starts_with("mapper") {
            continue;
        }
        let Some((device, detail)) = rest.split_once(':') else {
            continue;
        };
        let bytes = detail
            .split(',')
            .map(str::trim)
            .find_map(|part| part.strip_suffix(" bytes"))
            .and_then(|n| n.trim().parse::<i64>().ok());
        if let Some(bytes) = bytes {
            out.insert(format!("/dev/{}", device), bytes);
        }
    }
    out
}

/// Disk names carrying a signature on themselves or a partition.
///
/// Any `TYPE` (filesystem, swap, `LVM2_member`, ...) or `PTTYPE`
/// (partition table) counts.
pub fn parse_blkid_signatures(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(_, fields)| {
            fields
                .split_whitespace()
                .any(|f| f.starts_with("TYPE=") || f.starts_with("PTTYPE="))
        })
        .map(|(dev, _)| normalize_partition(dev))
        .collect()
}

// =============================================================================
// Disk Inventory
// =============================================================================

/// Scans the node's disks
pub struct DiskInventory {
    config: ScannerConfig,
    exec: Arc<dyn Executor>,
}

impl DiskInventory {
    pub fn new(config: ScannerConfig, exec: Arc<dyn Executor>) -> Self {
        Self { config, exec }
    }

    /// PCI disks keyed by kernel name
    pub fn pci_disks(&self) -> Result<BTreeMap<String, PciDisk>> {
        let dir = &self.config.by_path_dir;
        let entries = fs::read_dir(dir).map_err(|e| {
            Error::HardwareDiscovery(format!("Failed to read {}: {}", dir.display(), e))
        })?;

        let mut disks = BTreeMap::new();
        let mut partitioned = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            let pci_path = entry.file_name().to_string_lossy().to_string();
            if !pci_path.starts_with("pci-") {
                continue;
            }
            let target = match fs::read_link(entry.path()) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Skipping {}: {}", pci_path, e);
                    continue;
                }
            };
            let Some(name) = target.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if pci_path.contains("-part") {
                partitioned.insert(normalize_partition(&name));
                continue;
            }
            disks.insert(
                name.clone(),
                PciDisk {
                    name,
                    nvme: pci_path.contains("-nvme-"),
                    pci_path,
                    partitioned: false,
                },
            );
        }
        for name in partitioned {
            if let Some(disk) = disks.get_mut(&name) {
                disk.partitioned = true;
            }
        }
        Ok(disks)
    }

    fn read_sysfs_attr(&self, name: &str, attr: &str) -> Option<String> {
        fs::read_to_string(self.config.sysfs_block.join(name).join(attr))
            .ok()
            .map(|s| s.trim().to_string())
    }

    async fn rotational(&self) -> BTreeMap<String, bool> {
        let res = self
            .exec
            .run(ExecParams::new("lsblk").args(["-d", "-n", "-o", "NAME,ROTA"]))
            .await;
        if res.is_success() {
            parse_lsblk_rota(&res.stdout)
        } else {
            warn!("lsblk failed, falling back to sysfs: {}", res.stderr.trim());
            BTreeMap::new()
        }
    }

    async fn capacities(&self) -> BTreeMap<String, i64> {
        let res = self.exec.run(ExecParams::new("fdisk").arg("-l")).await;
        parse_fdisk_capacity(&res.stdout)
    }

    async fn signatures(&self) -> BTreeSet<String> {
        let res = self.exec.run(ExecParams::new("blkid")).await;
        parse_blkid_signatures(&res.stdout)
    }

    fn classify(&self, disk: &PciDisk, rota: &BTreeMap<String, bool>) -> Option<DiskClass> {
        if disk.nvme {
            return Some(DiskClass::Nvme);
        }
        let rotational = match rota.get(&disk.name) {
            Some(r) => *r,
            None => self.read_sysfs_attr(&disk.name, "queue/rotational")? == "1",
        };
        Some(if rotational { DiskClass::Hdd } else { DiskClass::Ssd })
    }

    /// Inventory keyed by device path
    pub async fn scan(&self) -> Result<BTreeMap<String, LocalDevice>> {
        let pci = self.pci_disks()?;
        let rota = self.rotational().await;
        let capacities = self.capacities().await;
        let signed = self.signatures().await;

        let mut devices = BTreeMap::new();
        for disk in pci.values() {
            let dev_path = format!("/dev/{}", disk.name);
            let Some(class) = self.classify(disk, &rota) else {
                warn!("Cannot classify {}, skipping", dev_path);
                continue;
            };
            let capacity_bytes = match capacities.get(&dev_path) {
                Some(c) => *c,
                None => self
                    .read_sysfs_attr(&disk.name, "size")
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(|sectors| sectors * 512)
                    .unwrap_or(0),
            };
            let state = if disk.partitioned || signed.contains(&disk.name) {
                debug!("{} holds data, not available", dev_path);
                DiskState::InUse
            } else {
                DiskState::Available
            };
            devices.insert(
                dev_path.clone(),
                LocalDevice {
                    dev_path,
                    class,
                    capacity_bytes,
                    state,
                },
            );
        }

        info!("Disk inventory found {} disk(s)", devices.len());
        Ok(devices)
    }
}

/// Paths whose capacity grew between two scans
pub fn grown_disks(
    previous: &BTreeMap<String, LocalDevice>,
    current: &BTreeMap<String, LocalDevice>,
) -> Vec<String> {
    current
        .values()
        .filter(|d| {
            previous
                .get(&d.dev_path)
                .map(|p| d.capacity_bytes > p.capacity_bytes)
                .unwrap_or(false)
        })
        .map(|d| d.dev_path.clone())
        .collect()
}
