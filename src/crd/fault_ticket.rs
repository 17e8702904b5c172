//! FaultTicket CRD
//!
//! Records a detected fault on a disk, volume or node for the
//! fault-management collaborator to evaluate and recover.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "FaultTicket",
    plural = "faulttickets",
    shortname = "ft",
    status = "FaultTicketStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "Source", "type": "string", "jsonPath": ".spec.source"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct FaultTicketSpec {
    pub node_name: String,

    pub r#type: FaultType,

    /// Component that raised the ticket
    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub device: Option<FaultDevice>,

    #[serde(default)]
    pub volume: Option<FaultVolume>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FaultType {
    Disk,
    Volume,
    Node,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FaultDevice {
    #[serde(default)]
    pub dev_path: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub local_disk_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FaultVolume {
    pub volume_name: String,
    #[serde(default)]
    pub fault_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FaultPhase {
    Evaluating,
    Recovering,
    Completed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FaultTicketStatus {
    #[serde(default)]
    pub phase: Option<FaultPhase>,

    #[serde(default)]
    pub effect_scope: Vec<String>,
}
