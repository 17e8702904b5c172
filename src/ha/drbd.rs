//! DRBD resource configurator
//!
//! Drives the per-volume DRBD resource of an HA replica through
//! `Unconfigured → Configured → HasMetadata → Running → RunningPrimary`
//! and back. The current state is always re-derived by probing the host;
//! only the backing size seen at the last resize is remembered.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::{ha_state, CONNECTION_CONNECTED, DISK_UP_TO_DATE};
use crate::crd::{HaState, HaStatus, VolumeConfig, VolumeReplicaConfig};
use crate::error::{Error, Result};
use crate::exec::{ExecParams, Executor};

// =============================================================================
// Constants
// =============================================================================

pub const DRBD_CONFIG_DIR: &str = "/etc/drbd.d";
pub const DRBD_CONFIG_SUFFIX: &str = "res";
pub const DRBD_START_PORT: i64 = 43001;
pub const DRBD_MINOR_BASE: i64 = 1000;
pub const DRBD_MAX_PEERS: i64 = 3;

/// Suffix of the directory holding HA device links of a pool
pub const HA_DEVICE_DIR_SUFFIX: &str = "-HA";

const DISK_DISKLESS: &str = "Diskless";
const ROLE_PRIMARY: &str = "Primary";
const NO_METADATA: &str = "no valid meta data found";

/// Host paths and ports used for DRBD resources
#[derive(Debug, Clone)]
pub struct DrbdSettings {
    pub config_dir: PathBuf,
    pub dev_dir: PathBuf,
    pub start_port: i64,
}

impl Default for DrbdSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DRBD_CONFIG_DIR),
            dev_dir: PathBuf::from("/dev"),
            start_port: DRBD_START_PORT,
        }
    }
}

// =============================================================================
// Resource definition
// =============================================================================

/// A DRBD resource as rendered into `/etc/drbd.d/<name>.res`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaResource {
    pub name: String,
    pub minor: i64,
    pub port: i64,
    /// Backing device, identical on every peer
    pub disk: String,
    pub peers: Vec<VolumeReplicaConfig>,
}

impl HaResource {
    pub fn new(config: &VolumeConfig, disk: impl Into<String>, start_port: i64) -> Self {
        Self {
            name: config.volume_name.clone(),
            minor: config.resource_id + DRBD_MINOR_BASE,
            port: config.resource_id + start_port,
            disk: disk.into(),
            peers: config.replicas.clone(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("resource {} {{\n    net {{ protocol C; }}\n", self.name);
        for peer in &self.peers {
            out.push_str(&format!(
                "    on {} {{\n        device minor {};\n        disk {};\n        address {}:{};\n        meta-disk internal;\n        node-id {};\n    }}\n",
                peer.hostname, self.minor, self.disk, peer.ip, self.port, peer.id
            ));
        }
        let hosts: Vec<&str> = self.peers.iter().map(|p| p.hostname.as_str()).collect();
        out.push_str(&format!("    connection-mesh {{ hosts {}; }}\n}}\n", hosts.join(" ")));
        out
    }
}

/// Probed lifecycle state of a resource on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unconfigured,
    Configured,
    HasMetadata,
    Running,
    RunningPrimary,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::Unconfigured => write!(f, "Unconfigured"),
            ResourceState::Configured => write!(f, "Configured"),
            ResourceState::HasMetadata => write!(f, "HasMetadata"),
            ResourceState::Running => write!(f, "Running"),
            ResourceState::RunningPrimary => write!(f, "RunningPrimary"),
        }
    }
}

/// Result of [`DrbdConfigurator::ensure_config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub device_path: String,
    /// Set when this call ran the initial sync; the volume config must be
    /// marked initialized
    pub initialized: bool,
}

// =============================================================================
// Configurator
// =============================================================================

pub struct DrbdConfigurator {
    node_name: String,
    exec: Arc<dyn Executor>,
    settings: DrbdSettings,
    /// Backing device size at the last `drbdadm resize`, per resource
    resized: Mutex<HashMap<String, u64>>,
}

impl DrbdConfigurator {
    pub fn new(node_name: impl Into<String>, exec: Arc<dyn Executor>, settings: DrbdSettings) -> Self {
        Self {
            node_name: node_name.into(),
            exec,
            settings,
            resized: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DrbdSettings {
        &self.settings
    }

    pub fn resource(&self, config: &VolumeConfig, disk: &str) -> HaResource {
        HaResource::new(config, disk, self.settings.start_port)
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.settings
            .config_dir
            .join(format!("{}.{}", name, DRBD_CONFIG_SUFFIX))
    }

    /// User-facing device of an HA replica: `/dev/<pool>-HA/<volume>`
    pub fn device_path(&self, pool: &str, volume: &str) -> PathBuf {
        self.settings
            .dev_dir
            .join(format!("{}{}", pool, HA_DEVICE_DIR_SUFFIX))
            .join(volume)
    }

    fn drbd_device(&self, minor: i64) -> PathBuf {
        self.settings.dev_dir.join(format!("drbd{}", minor))
    }

    async fn drbdadm(&self, args: &[&str]) -> Result<String> {
        let params = ExecParams::new("drbdadm").args(args.iter().copied());
        Ok(self.exec.run_checked(params).await?.stdout)
    }

    // -------------------------------------------------------------------------
    // Probes
    // -------------------------------------------------------------------------

    /// Local and peer disk states; `None` when the resource is not up
    async fn disk_states(&self, name: &str) -> Option<Vec<String>> {
        let result = self
            .exec
            .run(ExecParams::new("drbdadm").args(["dstate", name]))
            .await;
        if !result.is_success() {
            return None;
        }
        let states: Vec<String> = result
            .stdout
            .lines()
            .next()
            .unwrap_or_default()
            .split('/')
            .map(|s| s.trim().to_string())
            .collect();
        match states.first().map(String::as_str) {
            None | Some("") | Some(DISK_DISKLESS) => None,
            Some(_) => Some(states),
        }
    }

    /// Whether the backing disk carries DRBD metadata
    async fn has_metadata(&self, resource: &HaResource) -> Result<bool> {
        let minor = resource.minor.to_string();
        let result = self
            .exec
            .run(ExecParams::new("drbdmeta").args([
                minor.as_str(),
                "v09",
                resource.disk.as_str(),
                "internal",
                "get-gi",
                "--node-id",
                "0",
                "--force",
            ]))
            .await;
        if result.is_success() {
            return Ok(true);
        }
        let output = format!("{}\n{}", result.stdout, result.stderr).to_lowercase();
        if output.contains(NO_METADATA) {
            return Ok(false);
        }
        warn!(
            "DRBD metadata probe failed for {}: {}",
            resource.name,
            result.stderr.trim()
        );
        Err(Error::HaMetadataCorrupted {
            resource: resource.name.clone(),
        })
    }

    async fn connection_states(&self, name: &str) -> Result<Vec<String>> {
        let out = self.drbdadm(&["cstate", name]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn role(&self, name: &str) -> Result<String> {
        let out = self.drbdadm(&["role", name]).await?;
        Ok(out
            .lines()
            .next()
            .unwrap_or_default()
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    /// Whether a config file exists for the resource
    pub async fn is_configured(&self, name: &str) -> bool {
        tokio::fs::metadata(self.config_path(name)).await.is_ok()
    }

    /// Size of the backing device; `None` when it cannot be read
    async fn backing_size(&self, disk: &str) -> Option<u64> {
        let result = self
            .exec
            .run(ExecParams::new("blockdev").args(["--getsize64", disk]))
            .await;
        if !result.is_success() {
            return None;
        }
        result.stdout.trim().parse().ok()
    }

    pub async fn probe_state(&self, resource: &HaResource) -> Result<ResourceState> {
        if tokio::fs::metadata(self.config_path(&resource.name)).await.is_err() {
            return Ok(ResourceState::Unconfigured);
        }
        if self.disk_states(&resource.name).await.is_some() {
            return Ok(if self.role(&resource.name).await? == ROLE_PRIMARY {
                ResourceState::RunningPrimary
            } else {
                ResourceState::Running
            });
        }
        if self.has_metadata(resource).await? {
            Ok(ResourceState::HasMetadata)
        } else {
            Ok(ResourceState::Configured)
        }
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    async fn write_config(&self, resource: &HaResource) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.config_dir).await?;
        tokio::fs::write(self.config_path(&resource.name), resource.render()).await?;
        Ok(())
    }

    async fn link_device(&self, resource: &HaResource, link: &Path) -> Result<()> {
        let target = self.drbd_device(resource.minor);
        if let Ok(current) = tokio::fs::read_link(link).await {
            if current == target {
                return Ok(());
            }
            tokio::fs::remove_file(link).await?;
        }
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::symlink(&target, link).await?;
        debug!("Linked {} to {}", link.display(), target.display());
        Ok(())
    }

    /// Bring the resource of `config` up on this node and converge its role
    pub async fn ensure_config(
        &self,
        config: &VolumeConfig,
        pool: &str,
        disk: &str,
    ) -> Result<EnsureOutcome> {
        let local = config
            .replica(&self.node_name)
            .ok_or_else(|| Error::HaResource {
                resource: config.volume_name.clone(),
                reason: format!("node {} is not a peer", self.node_name),
            })?
            .clone();
        let resource = self.resource(config, disk);
        let name = resource.name.as_str();

        self.write_config(&resource).await?;

        if self.disk_states(name).await.is_none() && !self.has_metadata(&resource).await? {
            info!("Creating DRBD metadata for {}", name);
            let max_peers = DRBD_MAX_PEERS.to_string();
            self.drbdadm(&["create-md", name, "--max-peers", &max_peers, "--force"])
                .await?;
        }

        self.drbdadm(&["adjust", name]).await?;

        let link = self.device_path(pool, name);
        self.link_device(&resource, &link).await?;

        let mut initialized = false;
        if config.ready_to_initialize && !config.initialized && local.primary {
            let up_to_date = self
                .disk_states(name)
                .await
                .and_then(|s| s.first().cloned())
                .is_some_and(|s| s == DISK_UP_TO_DATE);
            if !up_to_date {
                let states = self.connection_states(name).await?;
                if let Some(state) = states.iter().find(|s| *s != CONNECTION_CONNECTED) {
                    return Err(Error::HaResource {
                        resource: name.to_string(),
                        reason: format!("peer not connected: {}", state),
                    });
                }
                info!("Initializing DRBD resource {}", name);
                self.drbdadm(&["new-current-uuid", name, "--clear-bitmap"])
                    .await?;
            }
            initialized = true;
        }

        let role = self.role(name).await?;
        if local.primary && role != ROLE_PRIMARY {
            info!("Promoting DRBD resource {} on {}", name, self.node_name);
            if config.replicas.len() == 1 {
                self.drbdadm(&["primary", name, "--force"]).await?;
            } else {
                self.drbdadm(&["primary", name]).await?;
            }
        } else if !local.primary && role == ROLE_PRIMARY {
            info!("Demoting DRBD resource {} on {}", name, self.node_name);
            self.drbdadm(&["secondary", name]).await?;
        }

        self.resize_if_grown(name, disk).await?;

        Ok(EnsureOutcome {
            device_path: link.to_string_lossy().into_owned(),
            initialized,
        })
    }

    /// Grow the resource onto its backing device once the backing grew.
    ///
    /// An unreadable backing size always resizes.
    async fn resize_if_grown(&self, name: &str, disk: &str) -> Result<()> {
        let size = self.backing_size(disk).await;
        let last = self.resized.lock().get(name).copied();
        if let (Some(size), Some(last)) = (size, last) {
            if size <= last {
                return Ok(());
            }
        }
        info!("Resizing DRBD resource {}", name);
        self.drbdadm(&["resize", name]).await?;
        match size {
            Some(size) => self.resized.lock().insert(name.to_string(), size),
            None => self.resized.lock().remove(name),
        };
        Ok(())
    }

    /// Tear the resource down and remove everything `ensure_config` created
    pub async fn delete_config(&self, pool: &str, name: &str) -> Result<()> {
        self.resized.lock().remove(name);
        let shown = self
            .exec
            .run(ExecParams::new("drbdsetup").args(["show", name]))
            .await;
        if shown.is_success() && !shown.stdout.trim().is_empty() {
            info!("Tearing down DRBD resource {}", name);
            self.drbdadm(&["down", name]).await?;
            self.drbdadm(&["wipe-md", name, "--force"]).await?;
        }

        for path in [self.device_path(pool, name), self.config_path(name)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Current replication health of a resource
    pub async fn test(&self, name: &str) -> HaStatus {
        match self.disk_states(name).await {
            Some(states) => {
                let peers: Vec<&str> = states[1..].iter().map(String::as_str).collect();
                HaStatus {
                    state: ha_state(&states[0], &peers),
                    reason: states.join("/"),
                }
            }
            None => HaStatus {
                state: HaState::Unknown,
                reason: "resource is not up".to_string(),
            },
        }
    }

    /// Remove config files of resources that belong to no known replica
    pub async fn consistency_check(&self, known: &BTreeSet<String>) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.settings.config_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut removed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DRBD_CONFIG_SUFFIX) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if known.contains(name) {
                continue;
            }
            warn!("Removing orphan DRBD config {}", path.display());
            tokio::fs::remove_file(&path).await?;
            removed.push(name.to_string());
        }
        removed.sort();
        Ok(removed)
    }
}
