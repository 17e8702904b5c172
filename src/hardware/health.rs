//! Disk Health
//!
//! Periodically probes every PCI disk and RAID member with smartctl,
//! reconciles one PhysicalDisk per serial number and raises a FaultTicket
//! for disks that fail their SMART self-assessment.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::discovery::{DiskInventory, SmartReport, SmartctlClient};
use crate::controller::store::ObjectStore;
use crate::crd::{
    FaultDevice, FaultTicket, FaultTicketSpec, FaultType, PhysicalDisk, PhysicalDiskSpec,
    PhysicalDiskStatus,
};
use crate::error::Result;

/// FaultTicket source of disk health faults
pub const FAULT_SOURCE_DISK_HEALTH: &str = "disk-health";

/// smartctl product string of hypervisor-provided disks
const VIRTUAL_DISK_PRODUCT: &str = "Virtual disk";

/// Health loop timing
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Upper bound of the random delay before the first check
    pub max_start_delay: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            max_start_delay: Duration::from_secs(5),
        }
    }
}

/// Counts from one health pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub probed: usize,
    pub failed: usize,
    pub offline: usize,
    pub tickets: usize,
}

/// Kubernetes object name for a serial number
pub fn object_name(serial: &str) -> String {
    let name: String = serial
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect();
    name.trim_matches(|c| c == '-' || c == '.').to_string()
}

pub struct HealthManager {
    node_name: String,
    inventory: Arc<DiskInventory>,
    smartctl: SmartctlClient,
    store: Arc<dyn ObjectStore>,
    config: HealthConfig,
    reports: RwLock<Vec<SmartReport>>,
}

impl HealthManager {
    pub fn new(
        node_name: impl Into<String>,
        inventory: Arc<DiskInventory>,
        smartctl: SmartctlClient,
        store: Arc<dyn ObjectStore>,
        config: HealthConfig,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            inventory,
            smartctl,
            store,
            config,
            reports: RwLock::new(Vec::new()),
        }
    }

    /// Reports from the latest pass
    pub fn reports(&self) -> Vec<SmartReport> {
        self.reports.read().clone()
    }

    fn effective_serial(&self, report: &SmartReport) -> String {
        if report.serial_number.is_empty() || report.product == VIRTUAL_DISK_PRODUCT {
            let base = report.device_path.rsplit('/').next().unwrap_or_default();
            format!("{}-{}", self.node_name, base)
        } else {
            report.serial_number.clone()
        }
    }

    fn new_physical_disk(&self, serial: &str, report: &SmartReport) -> PhysicalDisk {
        let mut disk = PhysicalDisk::new(
            &object_name(serial),
            PhysicalDiskSpec {
                node_name: self.node_name.clone(),
                serial_number: serial.to_string(),
                device_path: report.device_path.clone(),
                vendor: report.vendor.clone(),
                product: report.product.clone(),
                model_name: report.model_name.clone(),
                rotation_rate: report.rotation_rate,
                r#type: report.device_type.clone(),
                protocol: report.protocol.clone(),
                form_factor: report.form_factor.clone(),
                capacity: report.capacity,
                pci_vendor_id: String::new(),
                is_raid: report.device_type.contains(','),
                smart_support: report.smart_support,
            },
        );
        disk.status = Some(PhysicalDiskStatus {
            online: true,
            smart_check: Some(report.check.clone()),
        });
        disk
    }

    async fn raise_ticket(&self, serial: &str, report: &SmartReport) -> Result<bool> {
        let exists = self.store.list_fault_tickets().await?.into_iter().any(|t| {
            t.spec.r#type == FaultType::Disk
                && t.spec.node_name == self.node_name
                && t.spec
                    .device
                    .as_ref()
                    .is_some_and(|d| d.serial_number == serial)
        });
        if exists {
            return Ok(false);
        }
        let ticket = FaultTicket::new(
            &format!("disk-{}", object_name(serial)),
            FaultTicketSpec {
                node_name: self.node_name.clone(),
                r#type: FaultType::Disk,
                source: FAULT_SOURCE_DISK_HEALTH.to_string(),
                message: format!("SMART check failed on {}", report.device_path),
                device: Some(FaultDevice {
                    dev_path: report.device_path.clone(),
                    serial_number: serial.to_string(),
                    local_disk_name: String::new(),
                }),
                volume: None,
            },
        );
        self.store.create_fault_ticket(&ticket).await?;
        warn!(
            "Raised disk fault ticket for {} ({})",
            report.device_path, serial
        );
        Ok(true)
    }

    /// One pass: probe, reconcile PhysicalDisks, raise tickets
    pub async fn check_once(&self) -> Result<HealthSummary> {
        let pci: BTreeSet<String> = self.inventory.pci_disks()?.into_keys().collect();
        let targets = self.smartctl.health_targets(&pci).await?;

        let mut existing: BTreeMap<String, PhysicalDisk> = self
            .store
            .list_physical_disks(&self.node_name)
            .await?
            .into_iter()
            .map(|d| (d.spec.serial_number.clone(), d))
            .collect();

        let mut summary = HealthSummary::default();
        let mut reports = Vec::new();
        for target in &targets {
            let report = match self.smartctl.probe(target).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("SMART probe of {} failed: {}", target.name, e);
                    continue;
                }
            };
            summary.probed += 1;
            let serial = self.effective_serial(&report);

            let result = match existing.remove(&serial) {
                Some(mut disk) => {
                    disk.status = Some(PhysicalDiskStatus {
                        online: true,
                        smart_check: Some(report.check.clone()),
                    });
                    self.store.update_physical_disk_status(&disk).await
                }
                None => {
                    let disk = self.new_physical_disk(&serial, &report);
                    info!("Discovered physical disk {} at {}", serial, report.device_path);
                    match self.store.create_physical_disk(&disk).await {
                        Ok(mut created) => {
                            created.status = disk.status.clone();
                            self.store.update_physical_disk_status(&created).await
                        }
                        Err(e) => Err(e),
                    }
                }
            };
            if let Err(e) = result {
                error!("Failed to record health of {}: {}", serial, e);
            }

            if !report.check.passed {
                summary.failed += 1;
                match self.raise_ticket(&serial, &report).await {
                    Ok(true) => summary.tickets += 1,
                    Ok(false) => {}
                    Err(e) => error!("Failed to raise fault ticket for {}: {}", serial, e),
                }
            }
            reports.push(report);
        }

        for (serial, mut disk) in existing {
            if !disk.is_online() {
                continue;
            }
            let status = disk.status.get_or_insert_with(Default::default);
            status.online = false;
            match self.store.update_physical_disk_status(&disk).await {
                Ok(_) => {
                    info!("Physical disk {} is offline", serial);
                    summary.offline += 1;
                }
                Err(e) => error!("Failed to mark {} offline: {}", serial, e),
            }
        }

        *self.reports.write() = reports;
        debug!("Disk health pass: {:?}", summary);
        Ok(summary)
    }

    /// Run passes until cancelled
    pub async fn run(&self, token: CancellationToken) {
        let max_ms = self.config.max_start_delay.as_millis() as u64;
        let delay = Duration::from_millis(rand::rng().random_range(0..=max_ms));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        info!(
            "Disk health manager started, interval {}s",
            self.config.interval.as_secs()
        );
        loop {
            if let Err(e) = self.check_once().await {
                error!("Disk health pass failed: {}", e);
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("Disk health manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::memory::MemoryStore;
    use crate::exec::mock::MockExecutor;
    use crate::exec::ExecResult;
    use crate::hardware::discovery::ScannerConfig;
    use tempfile::TempDir;

    const SCAN: &str = r#"{"devices": [
        {"name": "/dev/sda", "type": "sat", "protocol": "ATA"},
        {"name": "/dev/sdb", "type": "scsi", "protocol": "SCSI"},
        {"name": "/dev/sdx", "type": "scsi", "protocol": "SCSI"}
    ]}"#;

    const FAILING: &str = r#"{
        "serial_number": "WD-123",
        "model_name": "WDC WD10EZEX",
        "smart_support": {"available": true},
        "smart_status": {"passed": false}
    }"#;

    const VIRTUAL: &str = r#"{
        "product": "Virtual disk",
        "smart_status": {"passed": true}
    }"#;

    fn setup() -> (TempDir, Arc<MemoryStore>, HealthManager) {
        let dir = TempDir::new().unwrap();
        let by_path = dir.path().join("by-path");
        std::fs::create_dir_all(&by_path).unwrap();
        std::os::unix::fs::symlink("../../sda", by_path.join("pci-0000:00:1f.2-ata-1")).unwrap();
        std::os::unix::fs::symlink("../../sdb", by_path.join("pci-0000:00:1f.2-ata-2")).unwrap();

        let mock = Arc::new(MockExecutor::new());
        mock.on("smartctl --scan", ExecResult::success(SCAN));
        mock.on("smartctl -x /dev/sda", ExecResult::success(FAILING));
        mock.on("smartctl -x /dev/sdb", ExecResult::success(VIRTUAL));

        let inventory = Arc::new(DiskInventory::new(
            ScannerConfig {
                by_path_dir: by_path,
                sysfs_block: dir.path().join("sys"),
            },
            mock.clone(),
        ));
        let store = Arc::new(MemoryStore::new());
        let manager = HealthManager::new(
            "n1",
            inventory,
            SmartctlClient::new(mock),
            store.clone(),
            HealthConfig::default(),
        );
        (dir, store, manager)
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name("WD-123_ABC"), "wd-123-abc");
        assert_eq!(object_name("_S3Z1NB0K"), "s3z1nb0k");
    }

    #[tokio::test]
    async fn test_check_once_records_disks_and_tickets() {
        let (_dir, store, manager) = setup();

        let summary = manager.check_once().await.unwrap();
        assert_eq!(summary.probed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.tickets, 1);

        let disks = store.list_physical_disks("n1").await.unwrap();
        let serials: BTreeSet<_> = disks.iter().map(|d| d.spec.serial_number.clone()).collect();
        assert!(serials.contains("WD-123"));
        assert!(serials.contains("n1-sdb"));
        assert!(disks.iter().all(|d| d.is_online()));
        assert!(!disks.iter().find(|d| d.spec.serial_number == "WD-123").unwrap().is_healthy());

        let tickets = store.list_fault_tickets().await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].spec.source, FAULT_SOURCE_DISK_HEALTH);

        // a second pass keeps a single ticket per serial
        let summary = manager.check_once().await.unwrap();
        assert_eq!(summary.tickets, 0);
        assert_eq!(store.list_fault_tickets().await.unwrap().len(), 1);
        assert_eq!(manager.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_disk_goes_offline() {
        let (_dir, store, manager) = setup();
        let mut gone = PhysicalDisk::new(
            "old",
            PhysicalDiskSpec {
                node_name: "n1".into(),
                serial_number: "OLD-1".into(),
                ..Default::default()
            },
        );
        gone.status = Some(PhysicalDiskStatus { online: true, smart_check: None });
        store.physical_disks.put(gone);

        let summary = manager.check_once().await.unwrap();
        assert_eq!(summary.offline, 1);
        assert!(!store.physical_disks.get("old").unwrap().is_online());
    }
}
