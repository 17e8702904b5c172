//! Custom Resource Definitions for HwameiStor
//!
//! This module contains all CRD types (group `hwameistor.io`, all
//! cluster-scoped):
//! - LocalStorageNode: per-node pools and conditions
//! - LocalVolume / LocalVolumeReplica: volume intent and per-node copies
//! - LocalDisk / LocalDiskClaim / LocalDiskAction: disk lifecycle
//! - LocalVolumeMigrate / LocalVolumeConvert / LocalVolumeExpand: operations
//! - PhysicalDisk: hardware identity and SMART health
//! - FaultTicket: detected faults

pub mod fault_ticket;
pub mod local_disk;
pub mod local_storage_node;
pub mod local_volume;
pub mod operations;
pub mod physical_disk;

pub use fault_ticket::*;
pub use local_disk::*;
pub use local_storage_node::*;
pub use local_volume::*;
pub use operations::*;
pub use physical_disk::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;

use kube::CustomResourceExt;

/// Render every CRD as a multi-document YAML stream
pub fn crds_yaml() -> crate::Result<String> {
    let crds = [
        LocalStorageNode::crd(),
        LocalVolume::crd(),
        LocalVolumeReplica::crd(),
        LocalDisk::crd(),
        LocalDiskClaim::crd(),
        LocalDiskAction::crd(),
        LocalVolumeMigrate::crd(),
        LocalVolumeConvert::crd(),
        LocalVolumeExpand::crd(),
        PhysicalDisk::crd(),
        FaultTicket::crd(),
    ];

    let mut out = String::new();
    for crd in crds {
        let doc = serde_yaml::to_string(&crd)
            .map_err(|e| crate::Error::Internal(format!("CRD serialization failed: {}", e)))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}
