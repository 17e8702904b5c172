//! LocalStorageNode CRD
//!
//! Per-node storage status published by the node agent: the assembled pools
//! with their capacity and volume counters, member disks and resident
//! volumes, plus node-level conditions.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// LocalStorageNode CRD
// =============================================================================

/// LocalStorageNode is the declarative view of one node's local storage.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalStorageNode",
    plural = "localstoragenodes",
    shortname = "lsn",
    status = "LocalStorageNodeStatus",
    printcolumn = r#"{"name": "IP", "type": "string", "jsonPath": ".spec.storageIP"}"#,
    printcolumn = r#"{"name": "Zone", "type": "string", "jsonPath": ".spec.topology.zone"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageNodeSpec {
    /// Hostname of the node
    pub hostname: String,

    /// IP address used for replication traffic
    #[serde(default, rename = "storageIP")]
    pub storage_ip: String,

    #[serde(default)]
    pub topology: Topology,
}

/// Failure-domain placement of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub region: String,
}

// =============================================================================
// Classes & Kinds
// =============================================================================

/// Disk class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum DiskClass {
    #[serde(rename = "HDD")]
    Hdd,
    #[serde(rename = "SSD")]
    Ssd,
    #[serde(rename = "NVMe")]
    Nvme,
    #[serde(rename = "RAM")]
    Ram,
}

impl std::fmt::Display for DiskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskClass::Hdd => write!(f, "HDD"),
            DiskClass::Ssd => write!(f, "SSD"),
            DiskClass::Nvme => write!(f, "NVMe"),
            DiskClass::Ram => write!(f, "RAM"),
        }
    }
}

impl std::str::FromStr for DiskClass {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "HDD" => Ok(DiskClass::Hdd),
            "SSD" => Ok(DiskClass::Ssd),
            "NVMe" => Ok(DiskClass::Nvme),
            "RAM" => Ok(DiskClass::Ram),
            other => Err(crate::Error::InvalidSpec(format!("unknown disk class {other}"))),
        }
    }
}

/// Backing kind of a pool and its replicas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum VolumeKind {
    #[default]
    #[serde(rename = "LVM")]
    Lvm,
    Disk,
    #[serde(rename = "RAM")]
    Ram,
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeKind::Lvm => write!(f, "LVM"),
            VolumeKind::Disk => write!(f, "Disk"),
            VolumeKind::Ram => write!(f, "RAM"),
        }
    }
}

/// State of a disk as seen by the pool manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DiskState {
    #[default]
    Available,
    InUse,
    Offline,
    Reserved,
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskState::Available => write!(f, "Available"),
            DiskState::InUse => write!(f, "InUse"),
            DiskState::Offline => write!(f, "Offline"),
            DiskState::Reserved => write!(f, "Reserved"),
        }
    }
}

// =============================================================================
// Pools
// =============================================================================

/// Regular pool type; the only one in use
pub const POOL_TYPE_REGULAR: &str = "REGULAR";

fn default_pool_type() -> String {
    POOL_TYPE_REGULAR.to_string()
}

/// A disk that belongs to a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDevice {
    pub dev_path: String,

    pub class: DiskClass,

    #[serde(default)]
    pub capacity_bytes: i64,

    #[serde(default)]
    pub state: DiskState,
}

/// A storage pool on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalPool {
    pub name: String,

    pub class: DiskClass,

    #[serde(rename = "type", default = "default_pool_type")]
    pub pool_type: String,

    #[serde(default)]
    pub kind: VolumeKind,

    /// Volume group name or anchor directory
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub total_capacity_bytes: i64,

    #[serde(default)]
    pub used_capacity_bytes: i64,

    #[serde(default)]
    pub free_capacity_bytes: i64,

    /// Largest allocation permitted for a single volume
    #[serde(default)]
    pub volume_capacity_bytes_limit: i64,

    #[serde(default)]
    pub total_volume_count: i64,

    #[serde(default)]
    pub used_volume_count: i64,

    #[serde(default)]
    pub free_volume_count: i64,

    #[serde(default)]
    pub disks: Vec<LocalDevice>,

    #[serde(default)]
    pub volumes: Vec<String>,
}

impl LocalPool {
    pub fn new(name: impl Into<String>, class: DiskClass, kind: VolumeKind) -> Self {
        Self {
            name: name.into(),
            class,
            pool_type: default_pool_type(),
            kind,
            path: String::new(),
            total_capacity_bytes: 0,
            used_capacity_bytes: 0,
            free_capacity_bytes: 0,
            volume_capacity_bytes_limit: 0,
            total_volume_count: 0,
            used_volume_count: 0,
            free_volume_count: 0,
            disks: Vec::new(),
            volumes: Vec::new(),
        }
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.iter().any(|v| v == name)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Node state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodeState {
    Ready,
    #[default]
    NotReady,
    Offline,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Ready => write!(f, "Ready"),
            NodeState::NotReady => write!(f, "NotReady"),
            NodeState::Offline => write!(f, "Offline"),
        }
    }
}

/// Kind of node condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StorageConditionType {
    Available,
    UnAvailable,
    Progressing,
    StorageExpandFailure,
    StorageExpandSuccess,
}

/// Condition truth value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A node condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeCondition {
    pub r#type: StorageConditionType,

    pub status: ConditionStatus,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,
}

/// Status of the LocalStorageNode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageNodeStatus {
    #[serde(default)]
    pub state: Option<NodeState>,

    #[serde(default)]
    pub pools: BTreeMap<String, LocalPool>,

    #[serde(default)]
    pub conditions: Vec<StorageNodeCondition>,
}

// =============================================================================
// Implementations
// =============================================================================

impl LocalStorageNode {
    /// Check if node is ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.state)
            .map(|s| s == NodeState::Ready)
            .unwrap_or(false)
    }

    /// Look up a pool by name
    pub fn pool(&self, name: &str) -> Option<&LocalPool> {
        self.status.as_ref().and_then(|s| s.pools.get(name))
    }
}

impl LocalStorageNodeStatus {
    /// Set or replace a condition by type.
    ///
    /// The transition time only moves when the status value changes.
    pub fn set_condition(&mut self, mut condition: StorageNodeCondition) {
        let now = Utc::now();
        condition.last_update_time = Some(now);
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                Some(now)
            };
            *existing = condition;
        } else {
            condition.last_transition_time = Some(now);
            self.conditions.push(condition);
        }
    }

    pub fn condition(&self, kind: StorageConditionType) -> Option<&StorageNodeCondition> {
        self.conditions.iter().find(|c| c.r#type == kind)
    }
}

/// Condition describing the outcome of a pool extension
pub fn storage_condition(expanded: bool, message: impl Into<String>) -> StorageNodeCondition {
    let (kind, reason) = if expanded {
        (StorageConditionType::StorageExpandSuccess, "StorageExpandSuccess")
    } else {
        (StorageConditionType::StorageExpandFailure, "StorageExpandFailure")
    };
    StorageNodeCondition {
        r#type: kind,
        status: ConditionStatus::True,
        last_update_time: None,
        last_transition_time: None,
        reason: reason.to_string(),
        message: message.into(),
    }
}
