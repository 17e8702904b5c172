//! Engine configuration
//!
//! [`NodeConfig`] describes this node and how its storage is laid out;
//! [`SystemConfig`] holds process-level settings (listeners, optional
//! collaborators). Both are filled from the command line in `main`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::{LeaderConfig, NodeAgentConfig};
use crate::crd::DiskClass;
use crate::error::{Error, Result};
use crate::ha::DrbdSettings;
use crate::hardware::{HealthConfig, ScannerConfig};
use crate::storage::ram::RAM_POOL_PATH;
use crate::webhook::{MutateConfig, WebhookServerConfig};

/// Per-node storage configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_name: String,
    pub storage_ip: String,
    /// Declared total of the RAM pool
    pub ram_disk_total_capacity: i64,
    pub ram_pool_path: PathBuf,
    /// Classes whose pools use whole disks instead of LVM
    pub raw_disk_classes: Vec<DiskClass>,
    /// Root of the raw-disk pool anchors
    pub dev_root: PathBuf,
    /// Where LUKS key files are staged
    pub key_dir: PathBuf,
    pub scanner: ScannerConfig,
    pub drbd: DrbdSettings,
    pub health: HealthConfig,
    pub agent: NodeAgentConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            storage_ip: String::new(),
            ram_disk_total_capacity: 0,
            ram_pool_path: PathBuf::from(RAM_POOL_PATH),
            raw_disk_classes: Vec::new(),
            dev_root: PathBuf::from("/dev"),
            key_dir: std::env::temp_dir(),
            scanner: ScannerConfig::default(),
            drbd: DrbdSettings::default(),
            health: HealthConfig::default(),
            agent: NodeAgentConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Configuration("node name is required".into()));
        }
        if self.ram_disk_total_capacity < 0 {
            return Err(Error::Configuration("RAM disk capacity must not be negative".into()));
        }
        if self.raw_disk_classes.contains(&DiskClass::Ram) {
            return Err(Error::Configuration("RAM pool cannot be disk backed".into()));
        }
        if self.drbd.start_port <= 0 || self.drbd.start_port > i64::from(u16::MAX) {
            return Err(Error::Configuration(format!(
                "invalid DRBD start port {}",
                self.drbd.start_port
            )));
        }
        if self.agent.sync_interval.is_zero() || self.health.interval.is_zero() {
            return Err(Error::Configuration("intervals must be positive".into()));
        }
        Ok(())
    }
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub metrics_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub webhook: WebhookServerConfig,
    pub mutate: MutateConfig,
    pub leader: LeaderConfig,
    pub enable_webhook: bool,
    pub enable_evictor: bool,
    pub enable_disk_action: bool,
    pub shutdown_grace: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            webhook: WebhookServerConfig::default(),
            mutate: MutateConfig::default(),
            leader: LeaderConfig::default(),
            enable_webhook: false,
            enable_evictor: false,
            enable_disk_action: false,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl SystemConfig {
    /// Whether any collaborator needs the leader lease
    pub fn needs_leader(&self) -> bool {
        self.enable_evictor || self.enable_disk_action
    }

    pub fn validate(&self) -> Result<()> {
        if self.needs_leader() && self.leader.identity.is_empty() {
            return Err(Error::Configuration(
                "pod name is required for leader election".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a disk class name as used on the command line
pub fn parse_disk_class(s: &str) -> Result<DiskClass> {
    match s.to_ascii_uppercase().as_str() {
        "HDD" => Ok(DiskClass::Hdd),
        "SSD" => Ok(DiskClass::Ssd),
        "NVME" => Ok(DiskClass::Nvme),
        "RAM" => Ok(DiskClass::Ram),
        _ => Err(Error::Configuration(format!("unknown disk class {:?}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let node = NodeConfig::default();
        assert_eq!(node.drbd.start_port, 43001);
        assert_eq!(node.agent.sync_interval, Duration::from_secs(60));
        assert_eq!(node.health.interval, Duration::from_secs(1800));

        let system = SystemConfig::default();
        assert_eq!(system.metrics_addr.port(), 80);
        assert_eq!(system.webhook.addr.port(), 18443);
        assert!(!system.needs_leader());
    }

    #[test]
    fn test_validate() {
        assert_matches!(NodeConfig::default().validate(), Err(Error::Configuration(_)));

        let mut node = NodeConfig {
            node_name: "n1".into(),
            ..Default::default()
        };
        assert!(node.validate().is_ok());
        node.raw_disk_classes = vec![DiskClass::Ram];
        assert!(node.validate().is_err());

        let system = SystemConfig {
            enable_evictor: true,
            ..Default::default()
        };
        assert!(system.validate().is_err());
    }

    #[test]
    fn test_parse_disk_class() {
        assert_eq!(parse_disk_class("nvme").unwrap(), DiskClass::Nvme);
        assert_eq!(parse_disk_class("HDD").unwrap(), DiskClass::Hdd);
        assert!(parse_disk_class("tape").is_err());
    }
}
