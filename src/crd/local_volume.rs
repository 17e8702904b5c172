//! LocalVolume and LocalVolumeReplica CRDs
//!
//! A LocalVolume is the cluster-level intent for a block volume; each
//! LocalVolumeReplica binds one copy of it to one node and pool. The node
//! agent reconciles replicas targeting its node and publishes their status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::VolumeKind;

// =============================================================================
// LocalVolume CRD
// =============================================================================

/// Cluster-level volume intent
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolume",
    plural = "localvolumes",
    shortname = "lv",
    status = "LocalVolumeStatus",
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.poolName"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicaNumber"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.requiredCapacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Published", "type": "string", "jsonPath": ".status.publishedNode"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSpec {
    pub pool_name: String,

    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default = "default_replica_number")]
    pub replica_number: i64,

    /// Single replica whose layout permits promotion to HA
    #[serde(default)]
    pub convertible: bool,

    #[serde(default)]
    pub striped: bool,

    #[serde(default)]
    pub accessibility: AccessibilityTopology,

    #[serde(default)]
    pub pvc_namespace: String,

    #[serde(default)]
    pub pvc_name: String,

    /// Replica placement and DRBD resource settings
    #[serde(default)]
    pub config: Option<VolumeConfig>,

    /// Secret holding the LUKS key when encryption is requested
    #[serde(default)]
    pub encryption: Option<EncryptionSpec>,

    #[serde(default)]
    pub delete: bool,
}

fn default_replica_number() -> i64 {
    1
}

/// Nodes and zones a volume may be placed in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityTopology {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Replica placement shared by all peers of a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    #[serde(default)]
    pub version: i64,

    pub volume_name: String,

    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub convertible: bool,

    /// DRBD resource identity; port and minor derive from it
    #[serde(default, rename = "resourceID")]
    pub resource_id: i64,

    #[serde(default)]
    pub ready_to_initialize: bool,

    #[serde(default)]
    pub initialized: bool,

    #[serde(default)]
    pub replicas: Vec<VolumeReplicaConfig>,
}

/// One peer in a volume's placement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicaConfig {
    /// DRBD node id
    pub id: i64,

    pub hostname: String,

    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub primary: bool,
}

impl VolumeConfig {
    pub fn replica(&self, hostname: &str) -> Option<&VolumeReplicaConfig> {
        self.replicas.iter().find(|r| r.hostname == hostname)
    }

    pub fn primary(&self) -> Option<&VolumeReplicaConfig> {
        self.replicas.iter().find(|r| r.primary)
    }
}

/// Reference to the Secret with the volume key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    pub secret_name: String,
    #[serde(default)]
    pub secret_namespace: String,
}

/// Volume lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumeState {
    Creating,
    Ready,
    NotReady,
    ToBeDeleted,
    Deleted,
}

/// Status of the LocalVolume
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeStatus {
    #[serde(default)]
    pub state: Option<VolumeState>,

    #[serde(default)]
    pub allocated_capacity_bytes: i64,

    #[serde(default)]
    pub used_capacity_bytes: i64,

    #[serde(default)]
    pub replicas: Vec<String>,

    #[serde(default)]
    pub published_node: String,

    #[serde(default)]
    pub message: String,
}

impl LocalVolume {
    /// HA volumes keep two or more replicas in sync through DRBD
    pub fn is_high_availability(&self) -> bool {
        self.spec.replica_number >= 2
    }

    /// Whether this volume's replicas need a DRBD resource
    pub fn needs_ha_resource(&self) -> bool {
        self.is_high_availability() || self.spec.convertible
    }

    pub fn is_encrypted(&self) -> bool {
        self.spec.encryption.is_some()
    }
}

// =============================================================================
// LocalVolumeReplica CRD
// =============================================================================

/// One copy of a volume on one node
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeReplica",
    plural = "localvolumereplicas",
    shortname = "lvr",
    status = "LocalVolumeReplicaStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.allocatedCapacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Synced", "type": "boolean", "jsonPath": ".status.synced"}"#,
    printcolumn = r#"{"name": "Device", "type": "string", "jsonPath": ".status.devicePath"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeReplicaSpec {
    pub volume_name: String,

    pub pool_name: String,

    pub node_name: String,

    #[serde(default)]
    pub kind: VolumeKind,

    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub striped: bool,

    #[serde(default)]
    pub convertible: bool,

    #[serde(default)]
    pub require_ready: bool,

    #[serde(default)]
    pub delete: bool,
}

/// Replica lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ReplicaState {
    Creating,
    Ready,
    NotReady,
    ToBeDeleted,
    Deleted,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Creating => write!(f, "Creating"),
            ReplicaState::Ready => write!(f, "Ready"),
            ReplicaState::NotReady => write!(f, "NotReady"),
            ReplicaState::ToBeDeleted => write!(f, "ToBeDeleted"),
            ReplicaState::Deleted => write!(f, "Deleted"),
        }
    }
}

impl ReplicaState {
    pub const ALL: [ReplicaState; 5] = [
        ReplicaState::Creating,
        ReplicaState::Ready,
        ReplicaState::NotReady,
        ReplicaState::ToBeDeleted,
        ReplicaState::Deleted,
    ];
}

/// Replication health of an HA replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HaState {
    Consistent,
    Inconsistent,
    UpToDate,
    #[default]
    Unknown,
}

impl std::fmt::Display for HaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaState::Consistent => write!(f, "Consistent"),
            HaState::Inconsistent => write!(f, "Inconsistent"),
            HaState::UpToDate => write!(f, "UpToDate"),
            HaState::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HaStatus {
    pub state: HaState,
    #[serde(default)]
    pub reason: String,
}

/// Status of the LocalVolumeReplica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeReplicaStatus {
    #[serde(default)]
    pub state: Option<ReplicaState>,

    /// Raw backing: LV path, whole disk or "ramdisk"
    #[serde(default)]
    pub storage_path: String,

    /// User-facing block device
    #[serde(default)]
    pub device_path: String,

    #[serde(default)]
    pub allocated_capacity_bytes: i64,

    #[serde(default)]
    pub synced: bool,

    #[serde(default)]
    pub ha_state: Option<HaStatus>,

    #[serde(default)]
    pub disks: Vec<String>,

    #[serde(default)]
    pub in_use: bool,

    #[serde(default)]
    pub message: String,
}

impl LocalVolumeReplica {
    pub fn state(&self) -> Option<ReplicaState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == Some(ReplicaState::Ready)
    }

    pub fn allocated_capacity_bytes(&self) -> i64 {
        self.status
            .as_ref()
            .map(|s| s.allocated_capacity_bytes)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(replicas: i64, convertible: bool) -> LocalVolume {
        LocalVolume::new(
            "pvc-1",
            LocalVolumeSpec {
                pool_name: "LocalStorage_PoolHDD".into(),
                required_capacity_bytes: 1 << 30,
                replica_number: replicas,
                convertible,
                striped: false,
                accessibility: Default::default(),
                pvc_namespace: String::new(),
                pvc_name: String::new(),
                config: None,
                encryption: None,
                delete: false,
            },
        )
    }

    #[test]
    fn test_high_availability() {
        assert!(!volume(1, false).is_high_availability());
        assert!(!volume(1, false).needs_ha_resource());
        assert!(volume(1, true).needs_ha_resource());
        assert!(volume(2, false).is_high_availability());
    }

    #[test]
    fn test_replica_spec_from_json() {
        let spec: LocalVolumeReplicaSpec = serde_json::from_str(
            r#"{"volumeName":"pvc-1","poolName":"LocalStorage_PoolRAM","nodeName":"n1","kind":"RAM","requiredCapacityBytes":1024}"#,
        )
        .unwrap();
        assert_eq!(spec.kind, VolumeKind::Ram);
        assert!(!spec.delete);
    }

    #[test]
    fn test_config_lookup() {
        let config = VolumeConfig {
            volume_name: "pvc-1".into(),
            replicas: vec![
                VolumeReplicaConfig { id: 0, hostname: "a".into(), ip: "10.0.0.1".into(), primary: true },
                VolumeReplicaConfig { id: 1, hostname: "b".into(), ip: "10.0.0.2".into(), primary: false },
            ],
            ..Default::default()
        };
        assert_eq!(config.primary().map(|r| r.hostname.as_str()), Some("a"));
        assert_eq!(config.replica("b").map(|r| r.id), Some(1));
        assert!(config.replica("c").is_none());
    }
}
