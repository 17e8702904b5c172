//! LocalDisk, LocalDiskClaim and LocalDiskAction CRDs
//!
//! Disks discovered on a node, claims that bind them to a consumer, and
//! rule-based actions (reserve) applied to matching disks.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DiskClass, DiskState};

/// Length bound of `LocalDiskAction.status.latestMatchedLds`
pub const LATEST_MATCHED_LENGTH: usize = 10;

// =============================================================================
// LocalDisk CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDisk",
    plural = "localdisks",
    shortname = "ld",
    status = "LocalDiskStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.devicePath"}"#,
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.class"}"#,
    printcolumn = r#"{"name": "Reserved", "type": "boolean", "jsonPath": ".spec.reserved"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskSpec {
    pub node_name: String,

    pub device_path: String,

    #[serde(default)]
    pub capacity: i64,

    #[serde(default)]
    pub class: Option<DiskClass>,

    /// Reserved disks are never claimed or pooled
    #[serde(default)]
    pub reserved: bool,

    /// Name of the claim that owns this disk
    #[serde(default)]
    pub claim_ref: Option<String>,

    #[serde(default)]
    pub serial_number: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskStatus {
    #[serde(default)]
    pub state: Option<DiskState>,
}

impl LocalDisk {
    pub fn is_available(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.state)
            .map(|s| s == DiskState::Available)
            .unwrap_or(false)
    }
}

// =============================================================================
// LocalDiskClaim CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDiskClaim",
    plural = "localdiskclaims",
    shortname = "ldc",
    status = "LocalDiskClaimStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskClaimSpec {
    pub node_name: String,

    #[serde(default)]
    pub description: DiskClaimDescription,

    #[serde(default)]
    pub disk_refs: Vec<String>,

    #[serde(default)]
    pub owner: String,
}

/// What disks a claim wants
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskClaimDescription {
    #[serde(default)]
    pub disk_type: Option<DiskClass>,

    /// Minimum capacity of each disk
    #[serde(default)]
    pub capacity: i64,

    #[serde(default)]
    pub local_disk_names: Vec<String>,

    #[serde(default)]
    pub device_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DiskClaimStatus {
    Pending,
    Extending,
    Bound,
    Consumed,
    ToBeDeleted,
    Deleted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskClaimStatus {
    #[serde(default)]
    pub status: Option<DiskClaimStatus>,
}

// =============================================================================
// LocalDiskAction CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDiskAction",
    plural = "localdiskactions",
    shortname = "lda",
    status = "LocalDiskActionStatus",
    printcolumn = r#"{"name": "Action", "type": "string", "jsonPath": ".spec.action"}"#,
    printcolumn = r#"{"name": "MaxCapacity", "type": "integer", "jsonPath": ".spec.rule.maxCapacity"}"#,
    printcolumn = r#"{"name": "MinCapacity", "type": "integer", "jsonPath": ".spec.rule.minCapacity"}"#,
    printcolumn = r#"{"name": "DevicePath", "type": "string", "jsonPath": ".spec.rule.devicePath"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskActionSpec {
    /// Only "reserve" is defined
    pub action: String,

    #[serde(default)]
    pub rule: DiskActionRule,
}

/// Disk selector. Every criterion that is set must hold: capacity below
/// `minCapacity`, capacity above `maxCapacity`, path matching the
/// `devicePath` glob. An empty rule matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskActionRule {
    #[serde(default)]
    pub max_capacity: i64,

    #[serde(default)]
    pub min_capacity: i64,

    #[serde(default)]
    pub device_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskActionStatus {
    /// Most recently matched disks, newest first
    #[serde(default)]
    pub latest_matched_lds: Vec<String>,
}
