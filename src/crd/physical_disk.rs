//! PhysicalDisk CRD
//!
//! One object per disk serial number, carrying hardware identity in the
//! spec and SMART health plus an online flag in the status. Objects outlive
//! disk removal; absent disks are marked offline.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "PhysicalDisk",
    plural = "physicaldisks",
    shortname = "pd",
    status = "PhysicalDiskStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Serial", "type": "string", "jsonPath": ".spec.serialNumber"}"#,
    printcolumn = r#"{"name": "Model", "type": "string", "jsonPath": ".spec.modelName"}"#,
    printcolumn = r#"{"name": "Online", "type": "boolean", "jsonPath": ".status.online"}"#,
    printcolumn = r#"{"name": "Passed", "type": "boolean", "jsonPath": ".status.smartCheck.passed"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalDiskSpec {
    pub node_name: String,

    pub serial_number: String,

    #[serde(default)]
    pub device_path: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub product: String,

    #[serde(default)]
    pub model_name: String,

    #[serde(default)]
    pub rotation_rate: i64,

    /// smartctl device type, e.g. "nvme", "sat" or "megaraid,0"
    #[serde(default)]
    pub r#type: String,

    #[serde(default)]
    pub protocol: String,

    #[serde(default)]
    pub form_factor: String,

    #[serde(default)]
    pub capacity: i64,

    #[serde(default, rename = "pciVendorID")]
    pub pci_vendor_id: String,

    #[serde(default)]
    pub is_raid: bool,

    #[serde(default)]
    pub smart_support: bool,
}

/// One row of the ATA SMART attribute table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SmartAttribute {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub worst: i64,
    #[serde(default)]
    pub thresh: i64,
    #[serde(default)]
    pub raw: i64,
}

/// Latest SMART probe result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SmartCheck {
    pub passed: bool,

    #[serde(default)]
    pub temperature: Option<i64>,

    #[serde(default)]
    pub power_on_hours: Option<i64>,

    #[serde(default)]
    pub attributes: Vec<SmartAttribute>,

    /// Flattened NVMe SMART/health information log
    #[serde(default)]
    pub nvme_health: BTreeMap<String, i64>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalDiskStatus {
    #[serde(default)]
    pub online: bool,

    #[serde(default)]
    pub smart_check: Option<SmartCheck>,
}

impl PhysicalDisk {
    pub fn is_online(&self) -> bool {
        self.status.as_ref().map(|s| s.online).unwrap_or(false)
    }

    pub fn is_healthy(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.smart_check.as_ref())
            .map(|c| c.passed)
            .unwrap_or(true)
    }
}
