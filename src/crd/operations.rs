//! Volume operation CRDs
//!
//! LocalVolumeMigrate, LocalVolumeConvert and LocalVolumeExpand record a
//! requested operation on a volume and its progress. They share one status
//! shape so the exporter can report durations uniformly.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Progress of a volume operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum OperationState {
    Submitted,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Submitted => write!(f, "Submitted"),
            OperationState::InProgress => write!(f, "InProgress"),
            OperationState::Completed => write!(f, "Completed"),
            OperationState::Failed => write!(f, "Failed"),
        }
    }
}

/// Status shared by all volume operations
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    #[serde(default)]
    pub state: Option<OperationState>,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// LocalVolumeMigrate CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeMigrate",
    plural = "localvolumemigrates",
    shortname = "lvmigrate",
    status = "OperationStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Source", "type": "string", "jsonPath": ".spec.sourceNode"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeMigrateSpec {
    pub volume_name: String,

    /// Node the replica moves away from
    pub source_node: String,

    #[serde(default)]
    pub target_nodes: Vec<String>,

    #[serde(default)]
    pub abort: bool,
}

// =============================================================================
// LocalVolumeConvert CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeConvert",
    plural = "localvolumeconverts",
    shortname = "lvconvert",
    status = "OperationStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicaNumber"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeConvertSpec {
    pub volume_name: String,

    pub replica_number: i64,

    #[serde(default)]
    pub abort: bool,
}

// =============================================================================
// LocalVolumeExpand CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeExpand",
    plural = "localvolumeexpands",
    shortname = "lvexpand",
    status = "OperationStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.requiredCapacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeExpandSpec {
    pub volume_name: String,

    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub abort: bool,
}

/// Seconds from creation to completion, if the operation finished
pub fn operation_duration_secs(
    created: Option<&DateTime<Utc>>,
    status: Option<&OperationStatus>,
) -> Option<f64> {
    let created = created?;
    let completed = status?.completed_at?;
    let millis = (completed - *created).num_milliseconds();
    (millis >= 0).then(|| millis as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_operation_duration() {
        let created = Utc::now();
        let status = OperationStatus {
            state: Some(OperationState::Completed),
            message: String::new(),
            completed_at: Some(created + Duration::milliseconds(2500)),
        };
        assert_eq!(operation_duration_secs(Some(&created), Some(&status)), Some(2.5));
        assert_eq!(operation_duration_secs(None, Some(&status)), None);
        assert_eq!(
            operation_duration_secs(Some(&created), Some(&OperationStatus::default())),
            None
        );
    }
}
